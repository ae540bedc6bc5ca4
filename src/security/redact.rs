//! Masking of secrets in JSON that ends up in logs.
//!
//! Matching is by key name, case-insensitive, at any depth. Text that is not
//! JSON passes through unchanged.

use serde_json::{Map, Value};

const SENSITIVE_KEYS: [&str; 10] = [
    "token",
    "password",
    "secret",
    "api_key",
    "credentials",
    "client_secret",
    "authorization",
    "oauth",
    "api_token",
    "apikey",
];

const MASK: &str = "******";

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|candidate| key.contains(candidate))
}

/// Mask every object value whose key looks like a secret, at any depth.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive(k) {
                        Value::String(MASK.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Redact a JSON document held as text. Non-JSON input is returned unchanged.
pub fn redact_str(input: &str) -> String {
    match serde_json::from_str::<Value>(input) {
        Ok(value) => redact(&value).to_string(),
        Err(_) => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_nested_secrets() {
        let redacted = redact(&json!({
            "user": "jdoe",
            "Authorization": "Bearer abc",
            "nested": {"client_secret": "s3cr3t", "keep": 1},
            "list": [{"refresh_token": "r"}],
        }));
        assert_eq!(redacted["user"], "jdoe");
        assert_eq!(redacted["Authorization"], MASK);
        assert_eq!(redacted["nested"]["client_secret"], MASK);
        assert_eq!(redacted["nested"]["keep"], 1);
        assert_eq!(redacted["list"][0]["refresh_token"], MASK);
    }

    #[test]
    fn non_json_text_is_untouched() {
        assert_eq!(redact_str("Stop-Process -Name x"), "Stop-Process -Name x");
        assert_eq!(redact_str(r#"{"password":"p"}"#), r#"{"password":"******"}"#);
    }
}
