//! `${path.to.field}` string interpolation against the execution context.
//!
//! Interpolation never raises for missing variables — only an unclosed
//! `${` is an error. See spec §4.1 for the exact algorithm.

use crate::error::EngineError;
use serde_json::Value;
use std::collections::HashMap;

/// Resolve every `${path}` reference in `template` against `data`.
///
/// Missing variables are left in place as the literal `${path}` text (no
/// error, no recursive re-interpolation of the replacement).
pub fn interpolate(template: &str, data: &HashMap<String, Value>) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let start = i + 2;
            match template[start..].find('}') {
                Some(rel_end) => {
                    let end = start + rel_end;
                    let path = &template[start..end];
                    match resolve_path(path, data) {
                        Some(rendered) => out.push_str(&rendered),
                        None => {
                            out.push_str("${");
                            out.push_str(path);
                            out.push('}');
                        }
                    }
                    i = end + 1;
                }
                None => {
                    return Err(EngineError::Template(
                        "unclosed variable reference".to_string(),
                    ));
                }
            }
        } else {
            // Push one char at a time to stay UTF-8 safe.
            let ch = template[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    Ok(out)
}

/// Resolve a single `path` (already stripped of `${`/`}`) against `data`.
/// Returns `None` if the path cannot be resolved (caller leaves the literal).
fn resolve_path(path: &str, data: &HashMap<String, Value>) -> Option<String> {
    if !path.contains('.') {
        return data.get(path).map(stringify);
    }

    let mut parts = path.split('.');
    let root = parts.next()?;
    let mut current = data.get(root)?;

    for segment in parts {
        let obj = current.as_object()?;
        current = obj.get(segment)?;
    }

    Some(stringify(current))
}

/// Stringify a resolved value using the engine's default scalar representation.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "<nil>".to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> HashMap<String, Value> {
        let mut m = HashMap::new();
        m.insert("user_id".to_string(), json!("7"));
        m.insert("count".to_string(), json!(42));
        m.insert("active".to_string(), json!(true));
        m.insert(
            "user".to_string(),
            json!({"name": "Ada", "nested": {"city": "NYC"}}),
        );
        m
    }

    #[test]
    fn passes_through_templates_without_vars() {
        let d = data();
        assert_eq!(interpolate("plain text", &d).unwrap(), "plain text");
    }

    #[test]
    fn resolves_simple_key() {
        let d = data();
        assert_eq!(interpolate("id=${user_id}", &d).unwrap(), "id=7");
    }

    #[test]
    fn leaves_missing_var_literal() {
        let d = data();
        assert_eq!(
            interpolate("/v1/${user_id}/${missing}", &d).unwrap(),
            "/v1/7/${missing}"
        );
    }

    #[test]
    fn resolves_nested_path() {
        let d = data();
        assert_eq!(
            interpolate("${user.name} in ${user.nested.city}", &d).unwrap(),
            "Ada in NYC"
        );
    }

    #[test]
    fn missing_nested_segment_is_literal() {
        let d = data();
        assert_eq!(
            interpolate("${user.nonexistent.field}", &d).unwrap(),
            "${user.nonexistent.field}"
        );
    }

    #[test]
    fn traversal_through_non_mapping_is_literal() {
        let d = data();
        assert_eq!(
            interpolate("${user_id.nested}", &d).unwrap(),
            "${user_id.nested}"
        );
    }

    #[test]
    fn unclosed_brace_is_an_error() {
        let d = data();
        assert!(interpolate("${user_id", &d).is_err());
    }

    #[test]
    fn stringifies_bool_and_number_defaults() {
        let d = data();
        assert_eq!(interpolate("${count}/${active}", &d).unwrap(), "42/true");
    }
}
