//! Masking of `no_log` values in everything the engine emits.

use serde_json::Value;

pub const MASK: &str = "********";

#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let mut secrets: Vec<String> = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        // Longest first, so a secret containing another is masked whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact_str(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }

    /// Mask every string value in a value tree. Object keys are structure
    /// and stay untouched.
    pub fn redact_value(&self, value: Value) -> Value {
        if self.secrets.is_empty() {
            return value;
        }
        match value {
            Value::String(s) => Value::String(self.redact_str(&s)),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.redact_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_nested_values() {
        let r = Redactor::new(vec!["s3cr3t".to_string(), String::new()]);
        let v = r.redact_value(json!({
            "msg": "login as root/s3cr3t failed",
            "details": { "args": ["s3cr3t", 5, true] }
        }));
        assert_eq!(v["msg"], "login as root/******** failed");
        assert_eq!(v["details"]["args"][0], MASK);
        assert_eq!(v["details"]["args"][1], 5);
    }

    #[test]
    fn test_longest_secret_first() {
        let r = Redactor::new(vec!["abc".to_string(), "abcdef".to_string()]);
        assert_eq!(r.redact_str("x abcdef y"), "x ******** y");
    }

    #[test]
    fn test_short_secret_leaves_keys_alone() {
        let r = Redactor::new(vec!["ang".to_string()]);
        let v = r.redact_value(json!({
            "changed": true,
            "msg": "changed by ang",
            "result": { "vmware_vm_storage_policy": "ang" }
        }));
        assert_eq!(v["changed"], true);
        assert_eq!(v["msg"], "ch********ed by ********");
        assert_eq!(v["result"]["vmware_vm_storage_policy"], MASK);
        assert!(v.get("ch********ed").is_none());
    }
}
