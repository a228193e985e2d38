//! The exit envelope: the one JSON object every invocation prints.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::diff::Diff;
use crate::error::{Error, ErrorKind};
use crate::redact::Redactor;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExitEnvelope {
    pub changed: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Diff>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Module-specific result keys.
    #[serde(flatten)]
    pub result: Map<String, Value>,
}

impl ExitEnvelope {
    pub fn success(changed: bool, msg: Option<String>, result: Map<String, Value>) -> Self {
        Self {
            changed,
            msg,
            result,
            ..Self::default()
        }
    }

    pub fn failure(err: &Error) -> Self {
        Self {
            failed: true,
            msg: Some(err.to_string()),
            kind: Some(err.kind()),
            details: err.details(),
            ..Self::default()
        }
    }

    pub fn with_diff(mut self, diff: Option<Diff>) -> Self {
        self.diff = diff;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Serialise with every secret masked.
    pub fn render(&self, redactor: &Redactor) -> Value {
        let value = match serde_json::to_value(self) {
            Ok(v) => v,
            Err(e) => serde_json::json!({
                "changed": false,
                "failed": true,
                "msg": format!("unable to serialise result: {e}"),
                "kind": ErrorKind::Internal,
            }),
        };
        redactor.redact_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let mut result = Map::new();
        result.insert("result".into(), json!({ "moid": "domain-c7" }));
        let env = ExitEnvelope::success(true, None, result).render(&Redactor::default());
        assert_eq!(
            env,
            json!({ "changed": true, "failed": false, "result": { "moid": "domain-c7" } })
        );
    }

    #[test]
    fn test_failure_has_msg_and_kind() {
        let err = Error::NotFound("unable to find Datacenter named 'DC9'".into());
        let env = ExitEnvelope::failure(&err)
            .with_warnings(vec!["certificate validation disabled".into()])
            .render(&Redactor::default());
        assert_eq!(env["failed"], true);
        assert_eq!(env["kind"], "NotFound");
        assert_eq!(env["msg"], "unable to find Datacenter named 'DC9'");
        assert_eq!(env["warnings"][0], "certificate validation disabled");
        assert!(env.get("diff").is_none());
    }

    #[test]
    fn test_render_masks_secrets() {
        let err = Error::AuthFailed {
            endpoint: "vc:443".into(),
            reason: "bad password hunter2".into(),
        };
        let env = ExitEnvelope::failure(&err).render(&Redactor::new(vec!["hunter2".to_string()]));
        assert!(!env.to_string().contains("hunter2"));
    }
}
