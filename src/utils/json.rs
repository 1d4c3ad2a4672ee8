use serde_json::Value;

pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }

    None
}

/// Returns the first balanced `{...}` span in `text` that parses as a JSON object.
pub fn extract_json_object(text: &str) -> Option<Value> {
    for (start, _) in text.match_indices('{') {
        let Some(end) = balanced_object_end(text, start) else {
            continue;
        };
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text[start..end]) {
            return Some(value);
        }
    }
    None
}

pub fn parse_json_lenient(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Some(value);
    }
    let unfenced = strip_code_fences(text);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Some(value);
    }
    extract_json_object(text)
}

pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_json_directly() {
        let value = parse_json_lenient(r#"{"placements": []}"#).unwrap();
        assert_eq!(value, json!({ "placements": [] }));
    }

    #[test]
    fn strips_markdown_fences() {
        let value = parse_json_lenient("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value, json!({ "a": 1 }));
    }

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let text = "Sure! Here is the result:\n{\"a\": {\"b\": \"}\"}}\nHope that helps {sic}";
        let value = parse_json_lenient(text).unwrap();
        assert_eq!(value, json!({ "a": { "b": "}" } }));
    }

    #[test]
    fn skips_braces_that_are_not_json() {
        let text = "Using {placeholder} notation, the answer is {\"ok\": true}";
        assert_eq!(extract_json_object(text), Some(json!({ "ok": true })));
    }

    #[test]
    fn truncated_object_yields_nothing() {
        assert!(parse_json_lenient("{\"placements\": [{\"imageIndex\": 0").is_none());
        assert!(parse_json_lenient("no json here at all").is_none());
    }

    #[test]
    fn truncates_long_log_values_by_chars() {
        assert_eq!(truncate_for_log("abc", 5), "abc");
        assert_eq!(truncate_for_log("가나다라마바", 2), "가나... (truncated)");
    }
}
