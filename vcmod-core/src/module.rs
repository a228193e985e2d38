//! The contract between the engine and one automation module.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::args::{ArgumentSpec, Params};
use crate::context::Context;
use crate::diff::Diff;
use crate::error::Result;
use crate::reconcile::Reconciled;
use crate::session::Needs;

/// What a successful run reports.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub changed: bool,
    pub msg: Option<String>,
    pub result: Map<String, Value>,
    pub diff: Option<Diff>,
}

impl Outcome {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed(changed: bool) -> Self {
        Self {
            changed,
            ..Self::default()
        }
    }

    /// Outcome of a reconcile, with its result under `key`.
    pub fn from_reconciled(r: Reconciled, key: &str) -> Self {
        let mut out = Self::changed(r.changed).with_diff(r.diff);
        if !r.result.is_null() {
            out.result.insert(key.to_string(), r.result);
        }
        out
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.result.insert(key.to_string(), value);
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    pub fn with_diff(mut self, diff: Diff) -> Self {
        self.diff = Some(diff);
        self
    }
}

#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Module parameters; the connection parameters are added by the engine.
    fn argument_spec(&self) -> ArgumentSpec;

    /// Endpoint surfaces to open for these parameters.
    fn needs(&self, _params: &Params) -> Needs {
        Needs::SOAP
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome>;
}
