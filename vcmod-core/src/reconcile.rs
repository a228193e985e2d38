//! The desired × observed state machine shared by declarative modules.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::Context;
use crate::diff::{CompareRules, Diff, changed_fields};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Present,
    Absent,
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "present" => Ok(State::Present),
            "absent" => Ok(State::Absent),
            other => Err(Error::InvalidArgument(format!(
                "state must be 'present' or 'absent', got '{other}'"
            ))),
        }
    }
}

/// What a reconcile does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Noop,
    Create,
    /// The exact dotted fields that differ.
    Update(Vec<String>),
    Delete,
}

impl Decision {
    pub fn is_change(&self) -> bool {
        !matches!(self, Decision::Noop)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Noop => f.write_str("noop"),
            Decision::Create => f.write_str("create"),
            Decision::Update(fields) => write!(f, "update({})", fields.join(", ")),
            Decision::Delete => f.write_str("delete"),
        }
    }
}

/// The transition table.
///
/// `changed` is the field set that differs between observed and desired;
/// it only matters when both sides are present.
pub fn decide(desired: State, exists: bool, changed: &[String]) -> Decision {
    match (desired, exists) {
        (State::Present, false) => Decision::Create,
        (State::Present, true) if changed.is_empty() => Decision::Noop,
        (State::Present, true) => Decision::Update(changed.to_vec()),
        (State::Absent, true) => Decision::Delete,
        (State::Absent, false) => Decision::Noop,
    }
}

/// A managed entity that can be reconciled.
///
/// `observe` is the single read that feeds the decision; the views are the
/// normalised field sets compared against each other.
#[async_trait]
pub trait Resource: Send + Sync {
    type Observed: Send + Sync;

    /// Read the current state; `None` when the entity does not exist.
    async fn observe(&self, ctx: &Context) -> Result<Option<Self::Observed>>;

    fn observed_view(&self, observed: &Self::Observed) -> Value;

    /// The desired field set. Fails before any mutation when the request
    /// cannot be turned into a valid spec.
    fn desired_view(&self, observed: Option<&Self::Observed>) -> Result<Value>;

    fn rules(&self) -> CompareRules {
        CompareRules::default()
    }

    async fn create(&self, ctx: &Context) -> Result<()>;

    async fn update(&self, ctx: &Context, observed: &Self::Observed, fields: &[String]) -> Result<()>;

    async fn delete(&self, ctx: &Context, observed: &Self::Observed) -> Result<()>;

    /// Module result after the reconcile.
    async fn result_of(&self, _ctx: &Context, _decision: &Decision, _observed: Option<&Self::Observed>) -> Result<Value> {
        Ok(Value::Null)
    }
}

pub struct Reconciled {
    pub decision: Decision,
    pub changed: bool,
    pub diff: Diff,
    pub result: Value,
}

/// Observe, decide, record the diff, then dispatch unless in check mode.
pub async fn reconcile<R: Resource>(ctx: &Context, resource: &R, desired: State) -> Result<Reconciled> {
    let observed = resource.observe(ctx).await?;
    let observed_view = observed.as_ref().map(|o| resource.observed_view(o));

    let desired_view = match desired {
        State::Present => Some(resource.desired_view(observed.as_ref())?),
        State::Absent => None,
    };

    let changed = match (&observed_view, &desired_view) {
        (Some(have), Some(want)) => changed_fields(have, want, &resource.rules()),
        _ => Vec::new(),
    };
    let decision = decide(desired, observed.is_some(), &changed);
    debug!(decision = %decision, "reconcile decision");

    let diff = match (&decision, &observed_view, &desired_view) {
        (Decision::Create, _, Some(want)) => Diff::created(want),
        (Decision::Update(fields), Some(have), Some(want)) => Diff::from_changes(have, want, fields),
        (Decision::Delete, Some(have), _) => Diff::deleted(have),
        _ => Diff::empty(),
    };
    ctx.record_diff(&diff);

    if ctx.check_mode() {
        if decision.is_change() {
            info!(decision = %decision, "check mode: not applying");
        }
    } else {
        match (&decision, &observed) {
            (Decision::Create, _) => resource.create(ctx).await?,
            (Decision::Update(fields), Some(o)) => resource.update(ctx, o, fields).await?,
            (Decision::Delete, Some(o)) => resource.delete(ctx, o).await?,
            _ => {}
        }
    }

    let result = resource.result_of(ctx, &decision, observed.as_ref()).await?;
    Ok(Reconciled {
        changed: decision.is_change(),
        decision,
        diff,
        result,
    })
}

/// Converge an update-only settings object.
///
/// There is nothing to create or delete: the changed fields of `desired`
/// are handed to `apply`, which is skipped in check mode.
pub async fn converge<F, Fut>(
    ctx: &Context,
    observed: &Value,
    desired: &Value,
    rules: &CompareRules,
    apply: F,
) -> Result<Reconciled>
where
    F: FnOnce(Vec<String>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let fields = changed_fields(observed, desired, rules);
    let diff = Diff::from_changes(observed, desired, &fields);
    ctx.record_diff(&diff);
    let decision = if fields.is_empty() {
        Decision::Noop
    } else {
        Decision::Update(fields.clone())
    };
    debug!(decision = %decision, "converge decision");

    if decision.is_change() {
        if ctx.check_mode() {
            info!(decision = %decision, "check mode: not applying");
        } else {
            apply(fields).await?;
        }
    }
    Ok(Reconciled {
        changed: decision.is_change(),
        decision,
        diff,
        result: Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        let none: Vec<String> = Vec::new();
        let some = vec!["drs.enabled".to_string()];
        assert_eq!(decide(State::Present, false, &none), Decision::Create);
        assert_eq!(decide(State::Present, true, &none), Decision::Noop);
        assert_eq!(decide(State::Present, true, &some), Decision::Update(some.clone()));
        assert_eq!(decide(State::Absent, true, &some), Decision::Delete);
        assert_eq!(decide(State::Absent, false, &none), Decision::Noop);
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("absent".parse::<State>().unwrap(), State::Absent);
        assert!("gone".parse::<State>().is_err());
    }
}
