use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::builders::host::LockdownMode;
use vcmod_core::diff::Diff;
use vcmod_core::value::ValueExt;
use vcmod_core::{ArgumentSpec, Context, Module, Outcome, Param, Params, Result, args};

use crate::common;

/// Lockdown mode of ESXi hosts.
pub struct HostLockdown;

#[async_trait]
impl Module for HostLockdown {
    fn name(&self) -> &'static str {
        "host_lockdown"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(
            Param::str("lockdown_mode")
                .choices(&["disabled", "normal", "strict"])
                .default("normal"),
        )
        .required_one_of(&["cluster_name", "esxi_hostname"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let want = LockdownMode::parse(params.str("lockdown_mode").unwrap_or("normal"))?;

        let mut changed = false;
        let mut results = Map::new();
        let mut diff = Diff::empty();
        for host in common::hosts(ctx, params).await? {
            let props = ctx.properties(&host.moref(), &["config.lockdownMode"]).await?;
            let current = props
                .str_at("config.lockdownMode")
                .and_then(LockdownMode::from_server)
                .unwrap_or(LockdownMode::Disabled);
            if current != want {
                changed = true;
                common::diff_entry(&mut diff, host.display_name(), json!(current.name()), json!(want.name()));
                if !ctx.check_mode() {
                    let manager = common::host_manager(ctx, &host, "hostAccessManager").await?;
                    info!(host = %host.display_name(), mode = want.name(), "changing lockdown mode");
                    ctx.mutate(&manager, "ChangeLockdownMode", args! { "mode" => want.server_name() })
                        .await?;
                }
            }
            results.insert(
                host.display_name().to_string(),
                json!({ "previous_state": current.name(), "current_state": want.name() }),
            );
        }
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed)
            .with("host_lockdown_state", Value::Object(results))
            .with_diff(diff))
    }
}
