//! Redaction pass for error payloads and log lines
//!
//! Applied before any server-side failure is logged. Blanks JSON fields whose
//! key matches a sensitive name at any depth, and applies a regex-based
//! redaction to plain-string errors that might carry a bearer token or API key.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Field names blanked at any depth of a JSON error payload.
const SENSITIVE_KEYS: &[&str] = &["value", "apiKey", "password", "token"];

/// Recursively redact sensitive fields in a JSON value.
///
/// Walks objects and arrays; any object key case-sensitively matching
/// `SENSITIVE_KEYS` has its value replaced with `"[REDACTED]"` regardless of
/// nesting depth.
pub fn redact_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    *val = Value::String("[REDACTED]".to_string());
                } else {
                    redact_json(val);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_json(item);
            }
        }
        _ => {}
    }
}

fn bearer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(bearer\s+|sk-ant-|sk-[A-Za-z0-9]{10,}|rt_[A-Za-z0-9_-]{8,}|at_[A-Za-z0-9_-]{8,})[A-Za-z0-9._-]*")
            .expect("static redaction pattern must compile")
    })
}

/// Redact bearer/API-key-shaped substrings from a plain-string error message.
pub fn redact_string(input: &str) -> String {
    bearer_pattern().replace_all(input, "[REDACTED]").to_string()
}

/// Render an error's `Display` form through the same redaction pass, for use
/// at every server-side failure log site.
pub fn redact_error(err: impl std::fmt::Display) -> String {
    redact_string(&err.to_string())
}

/// Redact a raw response body before logging it. JSON bodies get the
/// field-blanking pass (re-serialized); anything else falls back to the
/// plain-string bearer/API-key pattern.
pub fn redact_body(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(mut value) => {
            redact_json(&mut value);
            serde_json::to_string(&value).unwrap_or_else(|_| redact_string(body))
        }
        Err(_) => redact_string(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_top_level_sensitive_keys() {
        let mut v = json!({"token": "rt_abc123", "name": "ok"});
        redact_json(&mut v);
        assert_eq!(v["token"], "[REDACTED]");
        assert_eq!(v["name"], "ok");
    }

    #[test]
    fn redacts_nested_sensitive_keys() {
        let mut v = json!({"error": {"apiKey": "sk-ant-xyz", "password": "hunter2", "deep": {"value": 42}}});
        redact_json(&mut v);
        assert_eq!(v["error"]["apiKey"], "[REDACTED]");
        assert_eq!(v["error"]["password"], "[REDACTED]");
        assert_eq!(v["error"]["deep"]["value"], "[REDACTED]");
    }

    #[test]
    fn redacts_keys_inside_arrays() {
        let mut v = json!([{"token": "rt_1"}, {"token": "rt_2"}]);
        redact_json(&mut v);
        assert_eq!(v[0]["token"], "[REDACTED]");
        assert_eq!(v[1]["token"], "[REDACTED]");
    }

    #[test]
    fn redact_string_masks_bearer_token() {
        let out = redact_string("failed with Authorization: Bearer sk-ant-abc123DEF");
        assert!(!out.contains("sk-ant-abc123DEF"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn redact_string_preserves_unrelated_text() {
        let out = redact_string("connection refused to upstream");
        assert_eq!(out, "connection refused to upstream");
    }

    #[test]
    fn redact_error_masks_token_in_display_form() {
        #[derive(Debug)]
        struct Oops;
        impl std::fmt::Display for Oops {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "refresh rejected, token rt_abcdefgh123 is invalid")
            }
        }
        let out = redact_error(Oops);
        assert!(!out.contains("rt_abcdefgh123"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn redact_body_blanks_json_fields_at_any_depth() {
        let out = redact_body(r#"{"error": {"apiKey": "sk-ant-xyz", "message": "bad request"}}"#);
        assert!(!out.contains("sk-ant-xyz"));
        assert!(out.contains("bad request"));
    }

    #[test]
    fn redact_body_falls_back_to_string_redaction_for_non_json() {
        let out = redact_body("upstream says: Bearer sk-ant-abc123DEF is invalid");
        assert!(!out.contains("sk-ant-abc123DEF"));
        assert!(out.contains("[REDACTED]"));
    }
}
