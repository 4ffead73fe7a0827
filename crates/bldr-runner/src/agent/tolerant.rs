//! Tolerant reader for JS-ish object literals.
//!
//! Agents embed `TodoWrite({todos: [...]})` calls in assistant text with
//! unquoted keys and single-quoted strings. A regex rewrite is too brittle
//! for nested content; this is a small scanner that emits strict JSON and
//! refuses anything it cannot account for, so extraction either yields a
//! clean object or nothing.

use serde_json::Value;

/// Parse a JS-ish object literal into JSON.
///
/// Accepts unquoted identifier keys and single-quoted strings on top of
/// strict JSON. Returns `None` on anything else; no partial results.
pub fn parse_tolerant_object(src: &str) -> Option<Value> {
    let normalized = normalize_to_json(src)?;
    serde_json::from_str(&normalized).ok()
}

/// Rewrite tolerated JS syntax into strict JSON, or bail.
fn normalize_to_json(src: &str) -> Option<String> {
    let mut out = String::with_capacity(src.len() + 16);
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                let (string, consumed) = read_string(&chars[i..], c)?;
                out.push_str(&string);
                i += consumed;
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();

                // Bare keywords pass through; anything else must be a key.
                if matches!(word.as_str(), "true" | "false" | "null") {
                    out.push_str(&word);
                    continue;
                }

                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    // A bare identifier in value position is not JSON we
                    // can vouch for.
                    return None;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Some(out)
}

/// Read a quoted string starting at `chars[0]` (the quote), returning it as
/// a JSON double-quoted string plus the number of chars consumed.
fn read_string(chars: &[char], quote: char) -> Option<(String, usize)> {
    let mut out = String::from('"');
    let mut i = 1;

    loop {
        if i >= chars.len() {
            // Unterminated string.
            return None;
        }
        let c = chars[i];
        if c == '\\' {
            let next = *chars.get(i + 1)?;
            if quote == '\'' && next == '\'' {
                // Escaped single quote needs no escape in JSON.
                out.push('\'');
            } else {
                out.push('\\');
                out.push(next);
            }
            i += 2;
            continue;
        }
        if c == quote {
            out.push('"');
            return Some((out, i + 1));
        }
        if quote == '\'' && c == '"' {
            out.push('\\');
            out.push('"');
        } else {
            out.push(c);
        }
        i += 1;
    }
}

/// Extract the balanced `{...}` starting at `open` in `src`, respecting
/// strings in both quote styles and escapes. `src[open]` must be `{`.
pub fn extract_balanced(src: &str, open: usize) -> Option<&str> {
    let bytes = src.as_bytes();
    if bytes.get(open) != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;
    for (offset, &b) in bytes[open..].iter().enumerate() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => in_string = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&src[open..open + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_json_passes_through() {
        let value = parse_tolerant_object(r#"{"todos": [{"content": "a", "status": "pending"}]}"#)
            .unwrap();
        assert_eq!(value["todos"][0]["content"], "a");
    }

    #[test]
    fn test_unquoted_keys() {
        let value =
            parse_tolerant_object(r#"{todos: [{content: "Build UI", status: "in_progress"}]}"#)
                .unwrap();
        assert_eq!(value["todos"][0]["content"], "Build UI");
        assert_eq!(value["todos"][0]["status"], "in_progress");
    }

    #[test]
    fn test_single_quoted_strings() {
        let value = parse_tolerant_object(r#"{todos: [{content: 'It\'s done', status: 'done'}]}"#)
            .unwrap();
        assert_eq!(value["todos"][0]["content"], "It's done");
    }

    #[test]
    fn test_double_quote_inside_single_quoted() {
        let value = parse_tolerant_object(r#"{content: 'say "hi"'}"#).unwrap();
        assert_eq!(value["content"], r#"say "hi""#);
    }

    #[test]
    fn test_colon_inside_string_not_treated_as_key() {
        let value = parse_tolerant_object(r#"{content: "ratio 3:1", status: "pending"}"#).unwrap();
        assert_eq!(value["content"], "ratio 3:1");
    }

    #[test]
    fn test_bare_identifier_value_rejected() {
        // Not quoting a value is beyond what we vouch for: reject, no
        // partial todos.
        assert!(parse_tolerant_object("{status: pending}").is_none());
    }

    #[test]
    fn test_unterminated_string_rejected() {
        assert!(parse_tolerant_object(r#"{content: "oops}"#).is_none());
    }

    #[test]
    fn test_keywords_and_numbers() {
        let value = parse_tolerant_object("{done: true, count: 3, missing: null}").unwrap();
        assert_eq!(value, json!({"done": true, "count": 3, "missing": null}));
    }

    #[test]
    fn test_extract_balanced_nested() {
        let src = r#"TodoWrite({todos: [{content: "a {b}"}]}) trailing"#;
        let open = src.find('{').unwrap();
        let extracted = extract_balanced(src, open).unwrap();
        assert_eq!(extracted, r#"{todos: [{content: "a {b}"}]}"#);
    }

    #[test]
    fn test_extract_balanced_unclosed() {
        let src = "{todos: [";
        assert!(extract_balanced(src, 0).is_none());
    }
}
