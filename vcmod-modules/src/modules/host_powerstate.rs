use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::builders::host::PowerAction;
use vcmod_core::diff::Diff;
use vcmod_core::value::ValueExt;
use vcmod_core::{ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result};

use crate::common;

/// Standby, shutdown and reboot of ESXi hosts.
pub struct HostPowerstate;

#[async_trait]
impl Module for HostPowerstate {
    fn name(&self) -> &'static str {
        "host_powerstate"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(
            Param::str("state")
                .choices(&[
                    "power-down-to-standby",
                    "power-up-from-standby",
                    "shutdown-host",
                    "reboot-host",
                ])
                .default("shutdown-host"),
        )
        .param(Param::bool("force").default(false).doc("act even outside maintenance mode"))
        .param(Param::int("timeout").default(600).doc("seconds for the power operation"))
        .required_one_of(&["cluster_name", "esxi_hostname"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let action = PowerAction::parse(params.str("state").unwrap_or("shutdown-host"))?;
        let force = params.flag("force");
        let timeout_secs = params.int("timeout").unwrap_or(600);
        if timeout_secs <= 0 {
            return Err(Error::InvalidArgument(format!(
                "timeout must be positive, got {timeout_secs}"
            )));
        }
        let timeout = Duration::from_secs(timeout_secs.unsigned_abs());

        let mut changed = false;
        let mut results = Map::new();
        let mut diff = Diff::empty();
        for host in common::hosts(ctx, params).await? {
            let props = ctx
                .properties(&host.moref(), &["runtime.powerState", "runtime.inMaintenanceMode"])
                .await?;
            let power = props.str_at("runtime.powerState").unwrap_or("unknown").to_string();
            let in_maintenance = props.bool_at("runtime.inMaintenanceMode").unwrap_or(false);

            if action.target_state() == Some(power.as_str()) {
                results.insert(host.display_name().to_string(), json!({ "power_state": power, "changed": false }));
                continue;
            }
            if matches!(action, PowerAction::Shutdown | PowerAction::Reboot) && !force && !in_maintenance {
                return Err(Error::PreconditionFailed(format!(
                    "host {} is not in maintenance mode; set force to {} it anyway",
                    host.display_name(),
                    if action == PowerAction::Reboot { "reboot" } else { "shut it down" }
                )));
            }

            changed = true;
            let after = action.target_state().unwrap_or(power.as_str()).to_string();
            common::diff_entry(&mut diff, host.display_name(), json!(power), json!(after));
            if !ctx.check_mode() {
                info!(host = %host.display_name(), method = action.method(), "changing host power state");
                ctx.mutate_task_within(&host.moref(), action.method(), action.args(timeout_secs, force), timeout)
                    .await?;
            }
            results.insert(host.display_name().to_string(), json!({ "power_state": after, "changed": true }));
        }
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed).with("result", Value::Object(results)).with_diff(diff))
    }
}
