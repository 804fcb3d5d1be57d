use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

// Field-name fragments that must never reach a log line, at any depth.
const SENSITIVE_FRAGMENTS: &[&str] = &[
    "password",
    "secret",
    "apikey",
    "api_key",
    "token",
    "_private",
    "coordinates",
    "latitude",
    "longitude",
    "_raw",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Redact sensitive fields from structured metadata, recursively.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if is_sensitive_key(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_value(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_redaction() {
        let v = json!({"password": "hunter2", "name": "amina"});
        let r = redact_value(&v);
        assert_eq!(r["password"], "[REDACTED]");
        assert_eq!(r["name"], "amina");
    }

    #[test]
    fn test_nested_and_array_redaction() {
        let v = json!({
            "driver": {"latitude": -1.3, "longitude": 36.8, "id": "u1"},
            "fixes": [{"coordinates": [1, 2]}, {"zone": "88f2..."}]
        });
        let r = redact_value(&v);
        assert_eq!(r["driver"]["latitude"], "[REDACTED]");
        assert_eq!(r["driver"]["longitude"], "[REDACTED]");
        assert_eq!(r["driver"]["id"], "u1");
        assert_eq!(r["fixes"][0]["coordinates"], "[REDACTED]");
        assert_eq!(r["fixes"][1]["zone"], "88f2...");
    }

    #[test]
    fn test_case_insensitive_fragments() {
        assert!(is_sensitive_key("apiKey"));
        assert!(is_sensitive_key("JWT_TOKEN"));
        assert!(is_sensitive_key("location_raw"));
        assert!(!is_sensitive_key("zone_id"));
    }
}
