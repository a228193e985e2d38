//! Power operations on a virtual machine.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info};
use vcmod_core::diff::Diff;
use vcmod_core::task::Answer;
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{ArgType, ArgumentSpec, Context, Error, Handle, Module, Outcome, Param, Params, Result, args};

use crate::common;

pub struct VmPowerstate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerVerb {
    On,
    Off,
    Restart,
    Suspend,
    ShutdownGuest,
    RebootGuest,
}

impl PowerVerb {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "powered-on" => PowerVerb::On,
            "powered-off" => PowerVerb::Off,
            "restarted" => PowerVerb::Restart,
            "suspended" => PowerVerb::Suspend,
            "shutdown-guest" => PowerVerb::ShutdownGuest,
            "reboot-guest" => PowerVerb::RebootGuest,
            other => {
                return Err(Error::InvalidArgument(format!("unsupported power state '{other}'")));
            }
        })
    }

    /// Power state after the verb; `None` for verbs that always act.
    fn target(&self) -> Option<&'static str> {
        match self {
            PowerVerb::On => Some("poweredOn"),
            PowerVerb::Off | PowerVerb::ShutdownGuest => Some("poweredOff"),
            PowerVerb::Suspend => Some("suspended"),
            PowerVerb::Restart | PowerVerb::RebootGuest => None,
        }
    }

    /// Power states the verb can start from.
    fn allowed_from(&self) -> &'static [&'static str] {
        match self {
            PowerVerb::On => &["poweredOff", "suspended"],
            PowerVerb::Off => &["poweredOn", "suspended"],
            PowerVerb::Restart | PowerVerb::Suspend | PowerVerb::ShutdownGuest | PowerVerb::RebootGuest => {
                &["poweredOn"]
            }
        }
    }

    fn method(&self) -> &'static str {
        match self {
            PowerVerb::On => "PowerOnVM_Task",
            PowerVerb::Off => "PowerOffVM_Task",
            PowerVerb::Restart => "ResetVM_Task",
            PowerVerb::Suspend => "SuspendVM_Task",
            PowerVerb::ShutdownGuest => "ShutdownGuest",
            PowerVerb::RebootGuest => "RebootGuest",
        }
    }

    fn is_task(&self) -> bool {
        self.method().ends_with("_Task")
    }
}

fn answers(params: &Params) -> Vec<Answer> {
    params
        .list("answer")
        .iter()
        .filter_map(|a| {
            Some(Answer {
                question: a.str_at("question")?.to_string(),
                response: a.str_at("response")?.to_string(),
            })
        })
        .collect()
}

async fn power_state(ctx: &Context, vm: &MoRef) -> Result<String> {
    let props = ctx.properties(vm, &["runtime.powerState"]).await?;
    Ok(props.str_at("runtime.powerState").unwrap_or("poweredOff").to_string())
}

/// Wait for the guest to finish a shutdown it was asked for.
async fn await_state(ctx: &Context, vm: &Handle, want: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let state = power_state(ctx, &vm.moref()).await?;
        if state == want {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(format!(
                "virtual machine {} did not reach {want} within {}s",
                vm.display_name(),
                timeout.as_secs()
            )));
        }
        debug!(vm = %vm.display_name(), state = %state, "waiting for guest power state");
        sleep(ctx.task_settings().poll_interval.min(deadline - now)).await;
    }
}

#[async_trait]
impl Module for VmPowerstate {
    fn name(&self) -> &'static str {
        "vm_powerstate"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::vm_params() {
            spec = spec.param(p);
        }
        spec.param(
            Param::str("state")
                .choices(&["powered-on", "powered-off", "restarted", "suspended", "shutdown-guest", "reboot-guest"])
                .default("powered-on"),
        )
        .param(
            Param::list("answer", ArgType::Dict)
                .options(vec![Param::str("question").required(), Param::str("response").required()])
                .doc("responses to questions that block the power operation"),
        )
        .param(
            Param::int("state_change_timeout")
                .default(0)
                .doc("seconds to wait for a guest shutdown to complete"),
        )
        .param(Param::int("timeout").doc("task timeout in seconds"))
        .required_one_of(&["name", "uuid", "moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let verb = PowerVerb::parse(params.str("state").unwrap_or("powered-on"))?;
        let vm = common::vm(ctx, params).await?;
        let current = power_state(ctx, &vm.moref()).await?;

        if verb.target() == Some(current.as_str()) {
            return Ok(Outcome::unchanged()
                .with("result", json!({ "vm": vm.display_name(), "power_state": current })));
        }
        if !verb.allowed_from().contains(&current.as_str()) {
            return Err(Error::PreconditionFailed(format!(
                "cannot perform {} on virtual machine {} while it is {current}",
                verb.method(),
                vm.display_name()
            )));
        }

        let target = verb.target().unwrap_or("poweredOn");
        let mut diff = Diff::empty();
        common::diff_entry(&mut diff, "power_state", json!(current), json!(target));
        ctx.record_diff(&diff);

        if !ctx.check_mode() {
            info!(vm = %vm.display_name(), method = verb.method(), "changing power state");
            let moref = vm.moref();
            if verb.is_task() {
                let timeout = params
                    .int("timeout")
                    .and_then(|s| u64::try_from(s).ok())
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.task_settings().default_timeout);
                let task = ctx.mutate(&moref, verb.method(), args!()).await?;
                let task = MoRef::from_value(&task)
                    .ok_or_else(|| Error::Internal(format!("{} did not return a task", verb.method())))?;
                ctx.tasks()
                    .wait_answering(&task, Some(&moref), &answers(params), timeout)
                    .await?;
            } else {
                ctx.mutate(&moref, verb.method(), args!()).await?;
                let wait = params.int("state_change_timeout").unwrap_or(0);
                if verb == PowerVerb::ShutdownGuest && wait > 0 {
                    await_state(ctx, &vm, "poweredOff", Duration::from_secs(wait.unsigned_abs())).await?;
                }
            }
        }

        Ok(Outcome::changed(true)
            .with("result", json!({ "vm": vm.display_name(), "power_state": target }))
            .with_diff(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbs() {
        let on = PowerVerb::parse("powered-on").unwrap();
        assert_eq!(on.method(), "PowerOnVM_Task");
        assert!(on.allowed_from().contains(&"suspended"));
        assert!(!PowerVerb::parse("shutdown-guest").unwrap().is_task());
        assert_eq!(PowerVerb::parse("restarted").unwrap().target(), None);
        assert!(PowerVerb::parse("hibernate").is_err());
    }
}
