//! Best-effort parsing of truncated JSON, used while tool-call arguments are
//! still streaming.
//!
//! The scanner walks the input once, tracking open `{`/`[` scopes and string
//! state, and remembers the last byte offset at which the document could be
//! cut and closed cleanly. At end of input it first tries closing everything
//! that is open (terminating an unfinished string value), then falls back to
//! that last clean cut, then to `{}`.

use serde_json::{Map, Value};
use smallvec::SmallVec;

type Closers = SmallVec<[u8; 16]>;

struct Cut {
    len: usize,
    closers: Closers,
}

/// Parse a possibly truncated JSON prefix. Never fails: returns `{}` when no
/// usable prefix exists. Complete input parses exactly as `serde_json` would.
#[must_use]
pub fn parse_partial(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    repair(trimmed).unwrap_or_else(|| Value::Object(Map::new()))
}

/// Like [`parse_partial`], but always yields an object map, which is the
/// shape tool-call arguments must have.
#[must_use]
pub fn parse_partial_object(text: &str) -> Map<String, Value> {
    match parse_partial(text) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn repair(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut stack: Closers = SmallVec::new();
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escape_next = false;
    // Offset of a `\u` escape that has not yet seen all four hex digits.
    let mut unicode_escape_at: Option<usize> = None;
    let mut expect_key = false;
    let mut last_cut: Option<Cut> = None;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if let Some(start) = unicode_escape_at {
                if i - start >= 5 {
                    unicode_escape_at = None;
                }
            }
            if escape_next {
                escape_next = false;
                if b == b'u' {
                    unicode_escape_at = Some(i - 1);
                }
                continue;
            }
            match b {
                b'\\' => escape_next = true,
                b'"' => {
                    in_string = false;
                    if !string_is_key {
                        last_cut = Some(Cut {
                            len: i + 1,
                            closers: stack.clone(),
                        });
                    }
                }
                _ => {}
            }
            continue;
        }

        match b {
            b'"' => {
                in_string = true;
                string_is_key = expect_key && stack.last() == Some(&b'}');
                unicode_escape_at = None;
            }
            b'{' => {
                stack.push(b'}');
                expect_key = true;
                last_cut = Some(Cut {
                    len: i + 1,
                    closers: stack.clone(),
                });
            }
            b'[' => {
                stack.push(b']');
                expect_key = false;
                last_cut = Some(Cut {
                    len: i + 1,
                    closers: stack.clone(),
                });
            }
            b'}' | b']' => {
                stack.pop();
                expect_key = false;
                last_cut = Some(Cut {
                    len: i + 1,
                    closers: stack.clone(),
                });
            }
            b',' => {
                last_cut = Some(Cut {
                    len: i,
                    closers: stack.clone(),
                });
                expect_key = stack.last() == Some(&b'}');
            }
            b':' => expect_key = false,
            _ => {}
        }
    }

    // First attempt: close whatever is open right where the input stops.
    if !(in_string && string_is_key) {
        let mut fixed = String::with_capacity(text.len() + stack.len() + 1);
        if in_string {
            let mut end = text.len();
            if escape_next {
                end -= 1;
            } else if let Some(start) = unicode_escape_at {
                if end - start < 6 {
                    end = start;
                }
            }
            fixed.push_str(&text[..end]);
            fixed.push('"');
        } else {
            fixed.push_str(text);
        }
        push_closers(&mut fixed, &stack);
        if let Ok(value) = serde_json::from_str::<Value>(&fixed) {
            return Some(value);
        }
    }

    // Second attempt: drop the dangling tail back to the last clean cut.
    let cut = last_cut?;
    let mut fixed = String::with_capacity(cut.len + cut.closers.len());
    fixed.push_str(&text[..cut.len]);
    push_closers(&mut fixed, &cut.closers);
    serde_json::from_str::<Value>(&fixed).ok()
}

fn push_closers(out: &mut String, closers: &[u8]) {
    for &closer in closers.iter().rev() {
        out.push(char::from(closer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_json_is_parsed_exactly() {
        let inputs = [
            r#"{"path":"/tmp/a.txt","lines":[1,2,3],"opts":{"force":true,"mode":null}}"#,
            r#"[1, "two", {"three": 3.5}]"#,
            r#""just a string""#,
            "42",
            r#"{"escaped":"quote \" and \\ and é"}"#,
        ];
        for input in inputs {
            let expected: Value = serde_json::from_str(input).unwrap();
            assert_eq!(parse_partial(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_empty_and_garbage_yield_empty_object() {
        assert_eq!(parse_partial(""), json!({}));
        assert_eq!(parse_partial("   "), json!({}));
        assert_eq!(parse_partial("not json"), json!({}));
    }

    #[test]
    fn test_unterminated_string_value_is_closed() {
        assert_eq!(
            parse_partial(r#"{"path": "/tmp/fo"#),
            json!({"path": "/tmp/fo"})
        );
    }

    #[test]
    fn test_dangling_key_is_dropped() {
        assert_eq!(parse_partial(r#"{"a": 1, "pa"#), json!({"a": 1}));
        assert_eq!(parse_partial(r#"{"a": 1, "path""#), json!({"a": 1}));
        assert_eq!(parse_partial(r#"{"a": 1, "path":"#), json!({"a": 1}));
        assert_eq!(parse_partial(r#"{"pa"#), json!({}));
    }

    #[test]
    fn test_trailing_comma_is_dropped() {
        assert_eq!(parse_partial(r#"{"a": 1,"#), json!({"a": 1}));
        assert_eq!(parse_partial("[1, 2,"), json!([1, 2]));
    }

    #[test]
    fn test_nested_scopes_are_closed_in_order() {
        assert_eq!(
            parse_partial(r#"{"a": [1, {"b": "x"#),
            json!({"a": [1, {"b": "x"}]})
        );
        assert_eq!(
            parse_partial(r#"{"a": [1, {"b": tr"#),
            json!({"a": [1, {}]})
        );
    }

    #[test]
    fn test_truncated_number_kept_when_valid() {
        assert_eq!(parse_partial(r#"{"n": 12"#), json!({"n": 12}));
        assert_eq!(parse_partial(r#"{"n": -"#), json!({}));
    }

    #[test]
    fn test_truncated_escape_is_trimmed() {
        assert_eq!(parse_partial(r#"{"s": "ab\"#), json!({"s": "ab"}));
        assert_eq!(parse_partial(r#"{"s": "ab\u00"#), json!({"s": "ab"}));
    }

    #[test]
    fn test_object_wrapper_rejects_non_objects() {
        assert!(parse_partial_object("[1, 2").is_empty());
        assert_eq!(
            parse_partial_object(r#"{"q": "rust"#).get("q"),
            Some(&json!("rust"))
        );
    }

    #[test]
    fn test_every_prefix_is_safe() {
        let full = r#"{"command":"ls -la","cwd":"/home/user","env":{"A":"1"},"args":[1,2.5,true,null]}"#;
        for end in 0..=full.len() {
            if !full.is_char_boundary(end) {
                continue;
            }
            let _ = parse_partial_object(&full[..end]);
        }
        let expected: Value = serde_json::from_str(full).unwrap();
        assert_eq!(parse_partial(full), expected);
    }
}
