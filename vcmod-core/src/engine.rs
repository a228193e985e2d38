//! One invocation: validate, connect, run, disconnect, one envelope.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::audit::AuditLogger;
use crate::config::{EnvLookup, FileConfig, resolve_connection};
use crate::context::Context;
use crate::envelope::ExitEnvelope;
use crate::error::{Error, Result};
use crate::module::Module;
use crate::redact::Redactor;
use crate::session::Connector;

/// Key the orchestrator wraps module parameters in.
pub const ARGS_KEY: &str = "ANSIBLE_MODULE_ARGS";

/// Module parameters from the input document.
pub fn unwrap_input(input: Value) -> Result<Map<String, Value>> {
    match input {
        Value::Object(mut map) => match map.remove(ARGS_KEY) {
            Some(Value::Object(inner)) => Ok(inner),
            Some(_) => Err(Error::InvalidArgument(format!("{ARGS_KEY} must be an object"))),
            None => Ok(map),
        },
        _ => Err(Error::InvalidArgument(
            "module input must be a JSON object".to_string(),
        )),
    }
}

/// Run `module` against `input` and return the rendered exit envelope.
///
/// Never fails: every error becomes a `failed` envelope. Sessions opened
/// here are closed before returning, also when the module panics or the
/// process is interrupted.
pub async fn execute(
    module: &dyn Module,
    input: Value,
    connector: &dyn Connector,
    file: &FileConfig,
    env: EnvLookup<'_>,
) -> Value {
    let raw = match unwrap_input(input) {
        Ok(raw) => raw,
        Err(e) => return ExitEnvelope::failure(&e).render(&Redactor::default()),
    };

    let spec = module.argument_spec().with_common();
    let params = match spec.validate(module.name(), &raw) {
        Ok(p) => p,
        Err(e) => {
            let redactor = Redactor::new(spec.secrets_in(&raw));
            warn!(module = module.name(), "argument validation failed");
            return ExitEnvelope::failure(&e).render(&redactor);
        }
    };
    let mut secrets: Vec<String> = params.secrets().to_vec();

    let conn = match resolve_connection(&params, file, env) {
        Ok(c) => c,
        Err(e) => return ExitEnvelope::failure(&e).render(&Redactor::new(secrets)),
    };
    secrets.push(conn.password.expose_secret().to_string());
    let redactor = Redactor::new(secrets);

    let mut warnings = Vec::new();
    if !conn.validate_certs {
        let msg = format!(
            "certificate validation is disabled for {}; the server identity is not verified",
            conn.endpoint()
        );
        warn!("{}", msg);
        warnings.push(msg);
    }

    let needs = module.needs(&params);
    info!(module = module.name(), endpoint = %conn.endpoint(), check_mode = params.check_mode, "opening session");
    let session = match connector.open(&conn, needs).await {
        Ok(s) => s,
        Err(e) => {
            return ExitEnvelope::failure(&e)
                .with_warnings(warnings)
                .render(&redactor);
        }
    };

    let ctx = Context::new(
        session,
        params.check_mode,
        params.diff_mode,
        file.task_settings(),
        AuditLogger::new(module.name()),
    );

    let outcome = {
        let run = AssertUnwindSafe(module.run(&ctx, &params)).catch_unwind();
        tokio::select! {
            result = run => match result {
                Ok(r) => r,
                Err(panic) => Err(Error::Internal(panic_message(panic))),
            },
            _ = interrupted() => Err(Error::Internal("interrupted by signal".to_string())),
        }
    };

    let parts = ctx.into_parts();
    warnings.extend(parts.warnings);
    let mut session = parts.session;
    if let Err(e) = session.close().await {
        warn!(error = %e, "logout failed");
        warnings.push(format!("logout failed: {e}"));
    }
    info!(
        module = module.name(),
        mutations = parts.audit.mutation_count(),
        "session closed"
    );

    let envelope = match outcome {
        Ok(outcome) => {
            let diff = if params.diff_mode {
                outcome.diff.or(parts.partial_diff)
            } else {
                None
            };
            ExitEnvelope::success(outcome.changed, outcome.msg, outcome.result).with_diff(diff)
        }
        Err(e) => {
            error!(module = module.name(), kind = %e.kind(), "module failed");
            let diff = if params.diff_mode { parts.partial_diff } else { None };
            ExitEnvelope::failure(&e).with_diff(diff)
        }
    };
    envelope.with_warnings(warnings).render(&redactor)
}

/// Resolves on SIGINT. Never resolves where signals are unavailable.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("module panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_input() {
        let wrapped = json!({ ARGS_KEY: { "cluster_name": "C0" } });
        assert_eq!(unwrap_input(wrapped).unwrap()["cluster_name"], "C0");
        let bare = json!({ "cluster_name": "C0" });
        assert_eq!(unwrap_input(bare).unwrap()["cluster_name"], "C0");
        assert!(unwrap_input(json!([1])).is_err());
        assert!(unwrap_input(json!({ ARGS_KEY: "x" })).is_err());
    }

    #[test]
    fn test_panic_message() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p), "module panicked: boom");
    }
}
