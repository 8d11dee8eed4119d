//! Event payload masking
//!
//! Applied by the event bus to every payload before fan-out. Two rules:
//!
//! - `fields`: dotted paths replaced unconditionally with the mask value;
//! - `diff_fields`: the first value observed at the path in a run passes
//!   through; later occurrences with a different value are masked. This
//!   defeats leakage of rotating secrets that change mid-run.
//!
//! Masking is idempotent: applying the masker twice yields the same payload.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use crate::ir::MaskingSpec;

/// Run-scoped masker; the diff memory lives for one run.
pub struct Masker {
    spec: MaskingSpec,
    seen: Mutex<HashMap<String, Value>>,
}

impl Masker {
    pub fn new(spec: MaskingSpec) -> Self {
        Self {
            spec,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Apply both rules to a payload in place.
    pub fn mask(&self, data: &mut Value) {
        for path in &self.spec.fields {
            if let Some(slot) = lookup_path(data, path) {
                *slot = Value::String(self.spec.mask_value.clone());
            }
        }

        for path in &self.spec.diff_fields {
            let Some(slot) = lookup_path(data, path) else { continue };
            if slot.is_null() {
                continue;
            }
            let mut seen = self.seen.lock();
            match seen.get(path) {
                None => {
                    seen.insert(path.clone(), slot.clone());
                }
                Some(first) if first == slot => {}
                Some(_) => {
                    *slot = Value::String(self.spec.mask_value.clone());
                }
            }
        }
    }
}

fn lookup_path<'a>(data: &'a mut Value, dotted: &str) -> Option<&'a mut Value> {
    let mut current = data;
    for segment in dotted.split('.') {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn masker(fields: &[&str], diff_fields: &[&str]) -> Masker {
        Masker::new(MaskingSpec {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            diff_fields: diff_fields.iter().map(|s| s.to_string()).collect(),
            mask_value: "***".to_string(),
        })
    }

    #[test]
    fn fields_are_masked_unconditionally() {
        let masker = masker(&["outputs.api_key"], &[]);
        let mut data = json!({"outputs": {"api_key": "sk-123", "text": "ok"}});
        masker.mask(&mut data);
        assert_eq!(data["outputs"]["api_key"], "***");
        assert_eq!(data["outputs"]["text"], "ok");
    }

    #[test]
    fn missing_paths_are_ignored() {
        let masker = masker(&["outputs.absent.deep"], &[]);
        let mut data = json!({"outputs": {}});
        masker.mask(&mut data);
        assert_eq!(data, json!({"outputs": {}}));
    }

    #[test]
    fn diff_fields_pass_first_then_mask_changes() {
        let masker = masker(&[], &["outputs.token"]);

        let mut first = json!({"outputs": {"token": "aaa"}});
        masker.mask(&mut first);
        assert_eq!(first["outputs"]["token"], "aaa");

        let mut same = json!({"outputs": {"token": "aaa"}});
        masker.mask(&mut same);
        assert_eq!(same["outputs"]["token"], "aaa");

        let mut rotated = json!({"outputs": {"token": "bbb"}});
        masker.mask(&mut rotated);
        assert_eq!(rotated["outputs"]["token"], "***");
    }

    #[test]
    fn masking_is_idempotent() {
        let masker = masker(&["outputs.api_key"], &["outputs.token"]);
        let mut data = json!({"outputs": {"api_key": "sk-1", "token": "t-2"}});
        masker.mask(&mut data);
        let once = data.clone();
        masker.mask(&mut data);
        assert_eq!(data, once);

        // A rotated diff value also stabilizes after one application.
        let mut rotated = json!({"outputs": {"api_key": "sk-1", "token": "t-3"}});
        masker.mask(&mut rotated);
        let once = rotated.clone();
        masker.mask(&mut rotated);
        assert_eq!(rotated, once);
    }
}
