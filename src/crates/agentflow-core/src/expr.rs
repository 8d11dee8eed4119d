//! Input and output expression language
//!
//! Node inputs are small reference expressions resolved against the running
//! state; node outputs are extracted from the returned mapping with a
//! deliberately restricted JSONPath.
//!
//! Input forms:
//!
//! - `graph.inputs.<key>` — a key of the run's input mapping
//! - `node.<node_id>.<output_name>` — a recorded output of an earlier node
//! - `const:<string>` — the literal string after the prefix
//! - any other scalar — a bare literal (string, number, bool)
//!
//! Output paths support exactly: root `$`, dotted object keys, and
//! non-negative integer array indices in brackets (`$.choices[0].text`).
//! Wildcards, slices, filters, and recursive descent are rejected at parse
//! time. A missing path resolves to `null` in both languages — never an
//! error on its own.
//!
//! Evaluation is pure: the same scope and the same expression always produce
//! the same value.

use serde_json::Value;

use crate::error::{EngineError, ErrorKind, Result};

/// Read access to the running state, as the input language sees it.
pub trait EvalScope {
    /// The run's input mapping.
    fn graph_inputs(&self) -> &Value;
    /// A previously recorded node output mapping, if that node has finished.
    fn node_output(&self, node_id: &str) -> Option<Value>;
}

/// A parsed input expression.
#[derive(Debug, Clone, PartialEq)]
pub enum InputExpr {
    /// `graph.inputs.<path>`
    GraphInput(Vec<String>),
    /// `node.<node_id>.<path>`
    NodeOutput { node: String, path: Vec<String> },
    /// A literal value (bare scalar or `const:` string).
    Const(Value),
}

impl InputExpr {
    /// Parse one input expression from its raw document value.
    ///
    /// `pointer` anchors parse failures to the document location.
    pub fn parse(raw: &Value, pointer: &str) -> Result<Self> {
        let text = match raw {
            Value::String(s) => s,
            other => return Ok(Self::Const(other.clone())),
        };

        if let Some(rest) = text.strip_prefix("const:") {
            return Ok(Self::Const(Value::String(rest.to_string())));
        }
        if let Some(rest) = text.strip_prefix("graph.inputs.") {
            let path = split_dotted(rest, pointer)?;
            return Ok(Self::GraphInput(path));
        }
        if let Some(rest) = text.strip_prefix("node.") {
            let mut path = split_dotted(rest, pointer)?;
            if path.len() < 2 {
                return Err(EngineError::at(
                    ErrorKind::ExprInvalid,
                    pointer,
                    format!("node reference '{text}' must name a node and an output"),
                ));
            }
            let node = path.remove(0);
            return Ok(Self::NodeOutput { node, path });
        }

        // Anything else is a bare string literal.
        Ok(Self::Const(Value::String(text.clone())))
    }

    /// Resolve the expression against a scope. Missing paths yield `null`.
    pub fn eval(&self, scope: &dyn EvalScope) -> Value {
        match self {
            Self::Const(v) => v.clone(),
            Self::GraphInput(path) => walk(scope.graph_inputs(), path),
            Self::NodeOutput { node, path } => match scope.node_output(node) {
                Some(outputs) => walk(&outputs, path),
                None => Value::Null,
            },
        }
    }
}

fn split_dotted(text: &str, pointer: &str) -> Result<Vec<String>> {
    if text.is_empty() || text.split('.').any(str::is_empty) {
        return Err(EngineError::at(
            ErrorKind::ExprInvalid,
            pointer,
            format!("empty path segment in '{text}'"),
        ));
    }
    Ok(text.split('.').map(str::to_string).collect())
}

fn walk(value: &Value, path: &[String]) -> Value {
    let mut current = value;
    for segment in path {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

/// One step of a parsed output path.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed output extraction path. An empty segment list is the root `$`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputExpr {
    segments: Vec<Segment>,
}

impl OutputExpr {
    /// The whole-result path `$`.
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Parse an output path. Must start at `$`; only dotted keys and
    /// bracketed non-negative indices are accepted.
    pub fn parse(text: &str, pointer: &str) -> Result<Self> {
        let invalid = |msg: String| EngineError::at(ErrorKind::ExprInvalid, pointer, msg);

        let rest = text
            .strip_prefix('$')
            .ok_or_else(|| invalid(format!("output path '{text}' must start at '$'")))?;

        let mut segments = Vec::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((at, ch)) = chars.next() {
            match ch {
                '.' => {
                    let mut key = String::new();
                    while let Some((_, c)) = chars.peek() {
                        if *c == '.' || *c == '[' {
                            break;
                        }
                        key.push(*c);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(invalid(format!("empty key at offset {at} in '{text}'")));
                    }
                    if key.contains('*') {
                        return Err(invalid(format!("wildcards are not supported in '{text}'")));
                    }
                    segments.push(Segment::Key(key));
                }
                '[' => {
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some((_, ']')) => break,
                            Some((_, c)) if c.is_ascii_digit() => digits.push(c),
                            Some((_, c)) => {
                                return Err(invalid(format!(
                                    "unsupported index character '{c}' in '{text}'"
                                )))
                            }
                            None => return Err(invalid(format!("unclosed index in '{text}'"))),
                        }
                    }
                    if digits.is_empty() {
                        return Err(invalid(format!("empty index in '{text}'")));
                    }
                    let index: usize = digits
                        .parse()
                        .map_err(|_| invalid(format!("index out of range in '{text}'")))?;
                    segments.push(Segment::Index(index));
                }
                other => {
                    return Err(invalid(format!(
                        "unexpected character '{other}' in output path '{text}'"
                    )))
                }
            }
        }

        Ok(Self { segments })
    }

    /// Extract the addressed value; missing paths yield `null`.
    pub fn eval(&self, value: &Value) -> Value {
        let mut current = value;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(k), Value::Object(map)) => match map.get(k) {
                    Some(next) => next,
                    None => return Value::Null,
                },
                (Segment::Index(i), Value::Array(items)) => match items.get(*i) {
                    Some(next) => next,
                    None => return Value::Null,
                },
                _ => return Value::Null,
            };
        }
        current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeScope {
        inputs: Value,
        outputs: Value,
    }

    impl EvalScope for FakeScope {
        fn graph_inputs(&self) -> &Value {
            &self.inputs
        }
        fn node_output(&self, node_id: &str) -> Option<Value> {
            self.outputs.get(node_id).cloned()
        }
    }

    fn scope() -> FakeScope {
        FakeScope {
            inputs: json!({"question": "why", "nested": {"deep": 5}}),
            outputs: json!({"a": {"x": 7, "list": [1, 2, 3]}}),
        }
    }

    #[test]
    fn parses_graph_input_reference() {
        let expr = InputExpr::parse(&json!("graph.inputs.question"), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), json!("why"));
    }

    #[test]
    fn parses_nested_graph_input() {
        let expr = InputExpr::parse(&json!("graph.inputs.nested.deep"), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), json!(5));
    }

    #[test]
    fn parses_node_output_reference() {
        let expr = InputExpr::parse(&json!("node.a.x"), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), json!(7));
    }

    #[test]
    fn missing_path_is_null_not_error() {
        let expr = InputExpr::parse(&json!("node.a.nope"), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), Value::Null);

        let expr = InputExpr::parse(&json!("graph.inputs.absent"), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), Value::Null);
    }

    #[test]
    fn unknown_node_is_null() {
        let expr = InputExpr::parse(&json!("node.zz.x"), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), Value::Null);
    }

    #[test]
    fn const_prefix_and_bare_literals() {
        let expr = InputExpr::parse(&json!("const:node.a.x"), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), json!("node.a.x"));

        let expr = InputExpr::parse(&json!("hello"), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), json!("hello"));

        let expr = InputExpr::parse(&json!(42), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), json!(42));

        let expr = InputExpr::parse(&json!(true), "/t").unwrap();
        assert_eq!(expr.eval(&scope()), json!(true));
    }

    #[test]
    fn node_reference_requires_output_name() {
        let err = InputExpr::parse(&json!("node.only"), "/t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExprInvalid);
    }

    #[test]
    fn output_root_returns_whole_value() {
        let expr = OutputExpr::parse("$", "/t").unwrap();
        let v = json!({"a": 1});
        assert_eq!(expr.eval(&v), v);
    }

    #[test]
    fn output_keys_and_indices() {
        let expr = OutputExpr::parse("$.choices[0].text", "/t").unwrap();
        let v = json!({"choices": [{"text": "hi"}, {"text": "no"}]});
        assert_eq!(expr.eval(&v), json!("hi"));
    }

    #[test]
    fn output_missing_is_null() {
        let expr = OutputExpr::parse("$.choices[9].text", "/t").unwrap();
        let v = json!({"choices": []});
        assert_eq!(expr.eval(&v), Value::Null);
    }

    #[test]
    fn output_rejects_wildcards_and_filters() {
        for bad in ["$.items[*]", "$..deep", "$.a[?(@.x)]", "items", "$.a[1:2]", "$["] {
            let err = OutputExpr::parse(bad, "/t").unwrap_err();
            assert_eq!(err.kind, ErrorKind::ExprInvalid, "expected reject: {bad}");
        }
    }

    #[test]
    fn evaluation_is_pure() {
        let expr = OutputExpr::parse("$.a.b", "/t").unwrap();
        let v = json!({"a": {"b": [1, {"c": true}]}});
        assert_eq!(expr.eval(&v), expr.eval(&v));

        let input = InputExpr::parse(&json!("node.a.list.1"), "/t").unwrap();
        assert_eq!(input.eval(&scope()), input.eval(&scope()));
        assert_eq!(input.eval(&scope()), json!(2));
    }
}
