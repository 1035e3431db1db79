//! # Variable Expansion
//!
//! Resolves `%{dotted.path.or.index}` placeholder tokens against a nested
//! JSON context assembled per job (workspace paths, download files, message
//! attributes, payload). Paths walk objects by key and arrays by digits-only
//! index; string intermediates that look like JSON are parsed before the walk
//! continues, so attributes carrying JSON-encoded structures behave like
//! native ones.
//!
//! Every invalid token in a template is reported, not just the first one, so
//! a misconfigured command surfaces all of its bad references in one pass.

use serde_json::Value;
use thiserror::Error;

/// Separator between path segments inside a token.
const EXPR_SEPARATOR: char = '.';

/// Reserved separator used when expanding templates into argv slots. A unit
/// separator cannot appear in well-formed attribute values or paths, so
/// splitting on it after expansion recovers array elements as distinct
/// arguments instead of one joined string.
pub const ARG_SEPARATOR: &str = "\u{1f}";

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("Invalid index {index} for %{{{expr}}}")]
    InvalidIndex { index: usize, expr: String },

    /// A non-numeric segment was used against an array.
    #[error("Invalid reference {segment} for %{{{expr}}}")]
    InvalidReference { segment: String, expr: String },

    #[error("Invalid key {key} for %{{{expr}}}")]
    InvalidKey { key: String, expr: String },

    #[error("No value found for %{{{expr}}}")]
    NoValueFound { expr: String },

    #[error("Unsupported value type {kind} for %{{{expr}}}")]
    Unsupported { kind: &'static str, expr: String },

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))]
    Composite(Vec<VariableError>),
}

impl VariableError {
    /// Collapse accumulated per-token errors into one error value.
    fn aggregate(mut errors: Vec<VariableError>) -> VariableError {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            VariableError::Composite(errors)
        }
    }
}

/// Expansion context: one JSON tree plus the separator used when flattening
/// collection values into a single string.
#[derive(Debug, Clone)]
pub struct Variable {
    pub data: Value,
    pub separator: String,
}

impl Variable {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            separator: " ".to_string(),
        }
    }

    pub fn with_separator(data: Value, separator: impl Into<String>) -> Self {
        Self {
            data,
            separator: separator.into(),
        }
    }

    /// Expand every `%{...}` token in `template`. Text outside tokens is
    /// copied through untouched; an opening `%{` without a closing brace is
    /// left as-is. All token errors are accumulated and returned together.
    pub fn expand(&self, template: &str) -> Result<String, VariableError> {
        let mut out = String::with_capacity(template.len());
        let mut errors = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find("%{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let expr = after[..end].trim();
                    match self.dive(expr) {
                        Ok(value) => out.push_str(&self.flatten(&value)),
                        Err(e) => errors.push(e),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);

        if errors.is_empty() {
            Ok(out)
        } else {
            Err(VariableError::aggregate(errors))
        }
    }

    /// Resolve a dotted expression to its value. A `Null` result is an error:
    /// the token referenced something that was deliberately absent.
    pub fn dive(&self, expr: &str) -> Result<Value, VariableError> {
        let mut current = self.data.clone();
        for segment in expr.split(EXPR_SEPARATOR) {
            current = self.dig(&current, segment, expr)?;
        }
        if current.is_null() {
            return Err(VariableError::NoValueFound { expr: expr.into() });
        }
        Ok(current)
    }

    /// One step of the walk, followed by string-to-JSON auto-coercion so a
    /// JSON-encoded attribute can be navigated like a structured value.
    fn dig(&self, value: &Value, segment: &str, expr: &str) -> Result<Value, VariableError> {
        let result = match value {
            Value::Array(items) => dig_index(items, segment, expr)?,
            Value::Object(map) => dig_key(map, segment, expr)?,
            Value::Null => {
                return Err(VariableError::NoValueFound { expr: expr.into() });
            }
            other => {
                return Err(VariableError::Unsupported {
                    kind: value_kind(other),
                    expr: expr.into(),
                });
            }
        };

        if let Value::String(s) = &result {
            if let Some(parsed) = parse_embedded_json(s) {
                return Ok(parsed);
            }
        }
        Ok(result)
    }

    /// Flatten a resolved value into a single string. Collections join their
    /// scalar leaves recursively with the configured separator.
    pub fn flatten(&self, value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            Value::Array(items) => items
                .iter()
                .map(|v| self.flatten(v))
                .collect::<Vec<_>>()
                .join(&self.separator),
            Value::Object(map) => map
                .values()
                .map(|v| self.flatten(v))
                .collect::<Vec<_>>()
                .join(&self.separator),
        }
    }
}

/// Array access: the segment must be digits only and in range. The two
/// failure shapes stay distinct so callers can tell a bad index from a key
/// used against an array.
fn dig_index(items: &[Value], segment: &str, expr: &str) -> Result<Value, VariableError> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VariableError::InvalidReference {
            segment: segment.into(),
            expr: expr.into(),
        });
    }
    let index: usize = segment.parse().map_err(|_| VariableError::InvalidReference {
        segment: segment.into(),
        expr: expr.into(),
    })?;
    items
        .get(index)
        .cloned()
        .ok_or(VariableError::InvalidIndex {
            index,
            expr: expr.into(),
        })
}

/// Map access by key.
fn dig_key(
    map: &serde_json::Map<String, Value>,
    segment: &str,
    expr: &str,
) -> Result<Value, VariableError> {
    map.get(segment)
        .cloned()
        .ok_or_else(|| VariableError::InvalidKey {
            key: segment.into(),
            expr: expr.into(),
        })
}

/// Parse a string that looks like a JSON array or object. Returns `None` for
/// plain strings and for values that fail to parse, in which case the raw
/// string is used as-is.
pub fn parse_embedded_json(s: &str) -> Option<Value> {
    let trimmed = s;
    let looks_like_json = (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('{') && trimmed.ends_with('}'));
    if !looks_like_json {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
