//! Raw document loading
//!
//! The normalizer consumes a plain [`serde_json::Value`] tree: null, bool,
//! number, string, sequence, string-keyed mapping. This module turns YAML
//! text or files into that tree and rejects anything the value model cannot
//! carry (non-string mapping keys, YAML tags) at the load boundary, so the
//! rest of the engine never sees an unsupported shape.

use std::path::Path;

use serde_json::Value;

use crate::error::{EngineError, ErrorKind, Result};

/// Parse a YAML document string into the raw value tree.
pub fn from_yaml_str(text: &str) -> Result<Value> {
    let doc: Value = serde_yaml::from_str(text)
        .map_err(|e| EngineError::new(ErrorKind::DocParse, format!("YAML error: {e}")))?;
    ensure_mapping(&doc)?;
    Ok(doc)
}

/// Read and parse a YAML document file.
pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    from_yaml_str(&text)
}

fn ensure_mapping(doc: &Value) -> Result<()> {
    if !doc.is_object() {
        return Err(EngineError::at(
            ErrorKind::DocShape,
            "/",
            "document root must be a mapping",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_top_level_mapping() {
        let doc = from_yaml_str("meta:\n  version: 2\n").unwrap();
        assert_eq!(doc["meta"]["version"], 2);
    }

    #[test]
    fn rejects_non_mapping_root() {
        let err = from_yaml_str("- 1\n- 2\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DocShape);
    }

    #[test]
    fn rejects_non_string_keys() {
        let err = from_yaml_str("1: a\n2: b\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DocParse);
    }

    #[test]
    fn rejects_invalid_yaml() {
        let err = from_yaml_str("a: [1, 2\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DocParse);
    }
}
