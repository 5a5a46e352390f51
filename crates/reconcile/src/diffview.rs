//! Human-readable diffs of normalized forms, with sensitive values masked

use serde_json::Value;
use similar::TextDiff;

/// Replacement for masked values
pub const MASK: &str = "***";

/// Copy of `value` with every key in `sensitive` masked, at any depth
pub fn mask(value: &Value, sensitive: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let masked = if sensitive.contains(&key.as_str()) {
                        Value::String(MASK.to_string())
                    } else {
                        mask(inner, sensitive)
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| mask(v, sensitive)).collect()),
        other => other.clone(),
    }
}

/// Unified diff from the remote form to the local form.
///
/// Both sides are masked first, so a change to a sensitive value shows up
/// as an unchanged `***` line.
pub fn render(local: &Value, remote: &Value, sensitive: &[&str]) -> String {
    let local = pretty(&mask(local, sensitive));
    let remote = pretty(&mask(remote, sensitive));

    let diff = TextDiff::from_lines(&remote, &local);
    let text = diff
        .unified_diff()
        .context_radius(3)
        .header("remote", "local")
        .to_string();
    text
}

fn pretty(value: &Value) -> String {
    let mut text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mask_nested_keys() {
        let value = json!({
            "name": "ingest",
            "authentication": {"clientSecret": "s3cr3t", "clientId": "abc"},
            "list": [{"clientSecret": "x"}]
        });

        let masked = mask(&value, &["clientSecret"]);
        assert_eq!(masked["authentication"]["clientSecret"], json!(MASK));
        assert_eq!(masked["authentication"]["clientId"], json!("abc"));
        assert_eq!(masked["list"][0]["clientSecret"], json!(MASK));
    }

    #[test]
    fn test_render_shows_changed_lines() {
        let local = json!({"id": "X", "value": 2});
        let remote = json!({"id": "X", "value": 1});

        let text = render(&local, &remote, &[]);
        assert!(text.contains("--- remote"));
        assert!(text.contains("+++ local"));
        assert!(text.contains("-  \"value\": 1"));
        assert!(text.contains("+  \"value\": 2"));
    }

    #[test]
    fn test_render_never_leaks_sensitive_values() {
        let local = json!({"id": "X", "secret": "new-value", "value": 2});
        let remote = json!({"id": "X", "secret": "old-value", "value": 1});

        let text = render(&local, &remote, &["secret"]);
        assert!(!text.contains("new-value"));
        assert!(!text.contains("old-value"));
    }
}
