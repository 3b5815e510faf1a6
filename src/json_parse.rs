//! Tolerant parsing of LLM output into structured JSON (spec §9 "Dynamic JSON
//! parsing"). Strategy, in order: strip markdown code fences if present, then
//! locate the first balanced `{...}` block in what remains, then deserialize.
//! Callers decide how to degrade on failure (empty result vs. rejection);
//! this module only ever returns `Err` — it never panics or throws past a
//! pipeline boundary.

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Strip a leading/trailing markdown code fence (` ```json `, ` ``` `, or
/// no fence at all) and return the inner text.
pub fn strip_markdown_fences(input: &str) -> &str {
    let trimmed = input.trim();

    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    let after_tag = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => return "",
    };

    match after_tag.rfind("```") {
        Some(pos) => after_tag[..pos].trim(),
        None => after_tag.trim(),
    }
}

/// Find the first balanced `{...}` block in `input`, respecting string
/// literals and escapes so braces inside quoted strings don't confuse the
/// scan. Returns `None` if no balanced block exists.
pub fn first_balanced_object(input: &str) -> Option<&str> {
    let bytes = input.as_bytes();
    let start = input.find('{')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&input[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse `raw` LLM output into `T`, tolerating markdown fences and leading/
/// trailing prose around the JSON object. `context` is used only for error
/// messages (e.g. "scanner output", "aggregator output").
pub fn parse_tolerant<T: DeserializeOwned>(raw: &str, context: &str) -> Result<T> {
    let unfenced = strip_markdown_fences(raw);

    if let Ok(value) = serde_json::from_str::<T>(unfenced) {
        return Ok(value);
    }

    let candidate = first_balanced_object(unfenced).ok_or_else(|| Error::Parse {
        context: context.to_string(),
        source: "no JSON object found in output".to_string(),
    })?;

    serde_json::from_str(candidate).map_err(|e| Error::Parse {
        context: context.to_string(),
        source: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        issues: Vec<String>,
    }

    #[test]
    fn strips_json_fence() {
        let input = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(input), r#"{"a": 1}"#);
    }

    #[test]
    fn strips_bare_fence() {
        let input = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(input), r#"{"a": 1}"#);
    }

    #[test]
    fn passthrough_without_fence() {
        assert_eq!(strip_markdown_fences(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn finds_balanced_object_with_leading_prose() {
        let input = "Sure, here you go:\n{\"issues\": [\"x\"]}\nLet me know if you need more.";
        let obj = first_balanced_object(input).unwrap();
        assert_eq!(obj, r#"{"issues": ["x"]}"#);
    }

    #[test]
    fn balanced_object_ignores_braces_inside_strings() {
        let input = r#"{"issues": ["a } weird { string"]}"#;
        let obj = first_balanced_object(input).unwrap();
        assert_eq!(obj, input);
    }

    #[test]
    fn balanced_object_handles_escaped_quotes() {
        let input = r#"{"issues": ["a \"quoted\" } value"]}"#;
        let obj = first_balanced_object(input).unwrap();
        assert_eq!(obj, input);
    }

    #[test]
    fn no_object_returns_none() {
        assert!(first_balanced_object("no json here").is_none());
    }

    #[test]
    fn unbalanced_object_returns_none() {
        assert!(first_balanced_object("{\"a\": 1").is_none());
    }

    #[test]
    fn parse_tolerant_handles_fenced_prose_wrapped_json() {
        let raw = "Here's my analysis:\n```json\n{\"issues\": [\"a\", \"b\"]}\n```\nHope that helps.";
        let parsed: Sample = parse_tolerant(raw, "test").unwrap();
        assert_eq!(parsed.issues, vec!["a", "b"]);
    }

    #[test]
    fn parse_tolerant_degrades_on_garbage() {
        let err = parse_tolerant::<Sample>("not json at all", "scanner output").unwrap_err();
        match err {
            Error::Parse { context, .. } => assert_eq!(context, "scanner output"),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }
}
