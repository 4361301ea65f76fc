//! Restricted expression language used in node properties.
//!
//! A property string that is exactly one `$expr$` block resolves to the typed
//! value of the expression. Any other string containing blocks is a template:
//! each block is rendered to text in place. `$$` stands for a literal dollar
//! sign and a lone `$` without a closing marker is kept as-is.

mod eval;
mod lexer;
mod parser;

pub use eval::{Lookup, FUNCTIONS};

use latticecore::{EvaluationError, Value};
use std::collections::BTreeMap;

pub const MARKER: char = '$';

const MAX_VALUE_DEPTH: usize = 64;

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(MARKER) {
        let after = &rest[open + 1..];
        let Some(close) = after.find(MARKER) else {
            break;
        };
        if open > 0 {
            out.push(Segment::Text(&rest[..open]));
        }
        if close == 0 {
            out.push(Segment::Text("$"));
        } else {
            out.push(Segment::Expr(&after[..close]));
        }
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

/// Whether `text` holds at least one expression block
pub fn contains_expression(text: &str) -> bool {
    segments(text)
        .iter()
        .any(|segment| matches!(segment, Segment::Expr(_)))
}

/// Evaluate bare expression text (no markers)
pub fn evaluate(text: &str, scope: &dyn Lookup) -> Result<Value, EvaluationError> {
    let expr = parser::parse(text.trim())
        .map_err(|reason| EvaluationError::new(reason).with_text(text))?;
    eval::eval(&expr, scope).map_err(|reason| EvaluationError::new(reason).with_text(text))
}

/// Resolve a property string: typed value for a single block, text otherwise
pub fn resolve_text(text: &str, scope: &dyn Lookup) -> Result<Value, EvaluationError> {
    let segments = segments(text);
    if let [Segment::Expr(expr)] = segments.as_slice() {
        return evaluate(expr, scope);
    }
    let mut out = String::with_capacity(text.len());
    for segment in segments {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Expr(expr) => out.push_str(&evaluate(expr, scope)?.render()),
        }
    }
    Ok(Value::String(out))
}

/// Resolves the expressions of one node against a scope
pub struct Resolver<'a> {
    scope: &'a dyn Lookup,
    node: String,
}

impl<'a> Resolver<'a> {
    pub fn new(scope: &'a dyn Lookup, node: impl Into<String>) -> Self {
        Self {
            scope,
            node: node.into(),
        }
    }

    pub fn resolve_properties(
        &self,
        properties: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, EvaluationError> {
        properties
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.resolve(key, value)?)))
            .collect()
    }

    /// Resolve `value`, recursing into arrays and records
    pub fn resolve(&self, path: &str, value: &Value) -> Result<Value, EvaluationError> {
        self.resolve_at(path, value, 0)
    }

    /// Evaluate a branch or loop condition. Marker-free text is a bare expression.
    pub fn condition(&self, path: &str, text: &str) -> Result<bool, EvaluationError> {
        let value = if contains_expression(text) {
            resolve_text(text, self.scope)
        } else {
            evaluate(text, self.scope)
        };
        value
            .map(|v| v.is_truthy())
            .map_err(|e| e.at(self.node.clone(), path))
    }

    /// Evaluate an expression that must produce a value (items, loop data)
    pub fn expression(&self, path: &str, text: &str) -> Result<Value, EvaluationError> {
        let value = if contains_expression(text) {
            resolve_text(text, self.scope)
        } else {
            evaluate(text, self.scope)
        };
        value.map_err(|e| e.at(self.node.clone(), path))
    }

    fn resolve_at(&self, path: &str, value: &Value, depth: usize) -> Result<Value, EvaluationError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(EvaluationError::new("property nested too deeply").at(self.node.clone(), path));
        }
        match value {
            Value::String(text) => {
                resolve_text(text, self.scope).map_err(|e| e.at(self.node.clone(), path))
            }
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.resolve_at(&format!("{}[{}]", path, i), item, depth + 1))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(key, item)| {
                    let child = format!("{}.{}", path, key);
                    Ok((key.clone(), self.resolve_at(&child, item, depth + 1)?))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Vars(BTreeMap<String, Value>);

    impl Lookup for Vars {
        fn lookup(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }
    }

    fn vars() -> Vars {
        let mut map = BTreeMap::new();
        map.insert("count".to_string(), Value::Number(3.0));
        map.insert("name".to_string(), Value::from("lattice"));
        map.insert(
            "rows".to_string(),
            Value::Array(vec![Value::from(1i64), Value::from(2i64)]),
        );
        Vars(map)
    }

    #[test]
    fn test_segments() {
        assert_eq!(
            segments("a $x$ b"),
            vec![Segment::Text("a "), Segment::Expr("x"), Segment::Text(" b")]
        );
        assert_eq!(segments("costs $5"), vec![Segment::Text("costs $5")]);
        assert_eq!(segments("$$"), vec![Segment::Text("$")]);
    }

    #[test]
    fn test_single_block_keeps_type() {
        let scope = vars();
        assert_eq!(resolve_text("$count * 2$", &scope).unwrap(), Value::Number(6.0));
        assert_eq!(
            resolve_text("$rows$", &scope).unwrap(),
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0)])
        );
    }

    #[test]
    fn test_template_renders_text() {
        let scope = vars();
        assert_eq!(
            resolve_text("$upper(name)$ has $len(rows)$ rows", &scope).unwrap(),
            Value::from("LATTICE has 2 rows")
        );
    }

    #[test]
    fn test_nested_resolution_reports_path() {
        let scope = vars();
        let resolver = Resolver::new(&scope, "reader");
        let value = Value::Object(BTreeMap::from([(
            "limits".to_string(),
            Value::Array(vec![Value::from("$count$"), Value::from("$missing$")]),
        )]));
        let err = resolver.resolve("options", &value).unwrap_err();
        assert_eq!(err.node, "reader");
        assert_eq!(err.path, "options.limits[1]");
        assert_eq!(err.text, "missing");
    }

    #[test]
    fn test_whitelist_only() {
        let scope = vars();
        assert!(evaluate("open('/etc/passwd')", &scope).is_err());
        assert!(evaluate("__import__('os')", &scope).is_err());
        for name in FUNCTIONS {
            assert!(!name.is_empty());
        }
    }

    #[test]
    fn test_operators() {
        let scope = vars();
        assert_eq!(evaluate("7 % 4 + -1", &scope).unwrap(), Value::Number(2.0));
        assert_eq!(evaluate("2 in rows and count > 2", &scope).unwrap(), Value::Bool(true));
        assert_eq!(evaluate("'lat' in name", &scope).unwrap(), Value::Bool(true));
        assert_eq!(evaluate("rows[-1]", &scope).unwrap(), Value::Number(2.0));
        assert_eq!(evaluate("name + 1", &scope).unwrap(), Value::from("lattice1"));
        assert_eq!(evaluate("max(rows) == 2", &scope).unwrap(), Value::Bool(true));
        assert_eq!(evaluate("round(2.456, 2)", &scope).unwrap(), Value::Number(2.46));
        assert_eq!(evaluate("int('42')", &scope).unwrap(), Value::Number(42.0));
        assert!(evaluate("missing or 'fallback'", &scope).is_err());
        assert!(evaluate("count / 0", &scope).is_err());
        assert!(evaluate("count < 'a'", &scope).is_err());
    }

    #[test]
    fn test_json_and_time_functions() {
        let scope = vars();
        let parsed = evaluate(r#"json_loads('{"k": [1, "x"]}')"#, &scope).unwrap();
        assert_eq!(
            evaluate(r#"json_loads('{"k": [1, "x"]}').k[1]"#, &scope).unwrap(),
            Value::from("x")
        );
        assert_eq!(parsed.as_object().unwrap().len(), 1);
        assert_eq!(evaluate("json_dumps(name)", &scope).unwrap(), Value::from("\"lattice\""));
        assert!(evaluate("json_loads('{oops')", &scope).is_err());
        assert!(evaluate("json_loads(count)", &scope).is_err());

        let stamp = evaluate("timestamp()", &scope).unwrap().as_f64().unwrap();
        assert_eq!(stamp.fract(), 0.0);
        assert!(stamp > 1_600_000_000.0);
    }
}
