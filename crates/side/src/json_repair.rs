//! Tolerant repair pass for model-produced JSON.
//!
//! Models routinely emit argument blobs wrapped in code fences, with
//! trailing commas, raw newlines inside string literals, or truncated at
//! the end of the completion. The repair pass fixes what it can; actual
//! parsing stays with `serde_json`. Unparseable arguments are never fatal
//! to a loop — callers turn the error into an error tool result.

use serde::de::DeserializeOwned;

/// Repair common defects in a raw JSON blob.
///
/// Applied fixes, in order: code-fence stripping, escaping of raw control
/// characters inside string literals, removal of trailing commas, and
/// closing of an unterminated string / unbalanced containers at EOF.
/// An empty blob becomes `{}` (tools with no arguments).
pub fn repair_json(raw: &str) -> String {
    let trimmed = strip_fences(raw.trim());
    if trimmed.is_empty() {
        return "{}".to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // Held-back comma: emitted only once we know a value follows it.
    let mut pending_comma = false;

    for ch in trimmed.chars() {
        if in_string {
            if escaped {
                out.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => {
                    out.push(ch);
                    escaped = true;
                }
                '"' => {
                    out.push(ch);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => {
                    out.push_str(&format!("\\u{:04x}", c as u32));
                }
                c => out.push(c),
            }
            continue;
        }

        match ch {
            '"' => {
                flush_comma(&mut out, &mut pending_comma);
                out.push(ch);
                in_string = true;
            }
            '{' | '[' => {
                flush_comma(&mut out, &mut pending_comma);
                out.push(ch);
                stack.push(if ch == '{' { '}' } else { ']' });
            }
            '}' | ']' => {
                // A comma directly before a closer is dropped.
                pending_comma = false;
                out.push(ch);
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            ',' => {
                pending_comma = true;
            }
            c if c.is_whitespace() => {
                // Whitespace after a held comma is dropped with it or
                // re-emitted after it; either way skip for now.
                if !pending_comma {
                    out.push(c);
                }
            }
            c => {
                flush_comma(&mut out, &mut pending_comma);
                out.push(c);
            }
        }
    }

    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

fn flush_comma(out: &mut String, pending: &mut bool) {
    if *pending {
        out.push(',');
        *pending = false;
    }
}

fn strip_fences(s: &str) -> &str {
    let s = s.trim();
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // Drop an optional language marker on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.trim().strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse `raw` as `T`; on failure repair and parse once more.
pub fn parse_lenient<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    match serde_json::from_str(raw) {
        Ok(v) => Ok(v),
        Err(first) => serde_json::from_str(&repair_json(raw)).map_err(|_| first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn passes_valid_json_through() {
        let v: Value = parse_lenient(r#"{"a": 1, "b": [2, 3]}"#).unwrap();
        assert_eq!(v, json!({"a": 1, "b": [2, 3]}));
    }

    #[test]
    fn strips_code_fences() {
        let v: Value = parse_lenient("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn removes_trailing_commas() {
        let v: Value = parse_lenient(r#"{"a": 1, "b": [2, 3,], }"#).unwrap();
        assert_eq!(v, json!({"a": 1, "b": [2, 3]}));
    }

    #[test]
    fn escapes_raw_newlines_in_strings() {
        let v: Value = parse_lenient("{\"text\": \"line one\nline two\"}").unwrap();
        assert_eq!(v["text"], json!("line one\nline two"));
    }

    #[test]
    fn closes_truncated_blob() {
        let v: Value = parse_lenient(r#"{"a": {"b": "unfinished"#).unwrap();
        assert_eq!(v["a"]["b"], json!("unfinished"));
    }

    #[test]
    fn empty_arguments_become_object() {
        let v: Value = parse_lenient("").unwrap();
        assert_eq!(v, json!({}));
    }

    #[test]
    fn keeps_commas_between_values() {
        let v: Value = parse_lenient("[1 , 2 , 3]").unwrap();
        assert_eq!(v, json!([1, 2, 3]));
    }

    #[test]
    fn genuinely_broken_input_still_errors() {
        assert!(parse_lenient::<Value>("not json at all").is_err());
    }
}
