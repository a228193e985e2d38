use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::builders::host::AcceptanceLevel;
use vcmod_core::diff::Diff;
use vcmod_core::{ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result, args};

use crate::common;

/// Image acceptance level of ESXi hosts.
pub struct HostAcceptance;

#[async_trait]
impl Module for HostAcceptance {
    fn name(&self) -> &'static str {
        "host_acceptance"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(Param::str("state").choices(&["list", "present"]).default("list"))
            .param(
                Param::str("acceptance_level")
                    .choices(&["community", "partner", "vmware_accepted", "vmware_certified"]),
            )
            .required_one_of(&["cluster_name", "esxi_hostname"])
            .required_if("state", "present", &["acceptance_level"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let desired = match params.str("state").unwrap_or("list") {
            "list" => None,
            "present" => Some(AcceptanceLevel::parse(params.require_str("acceptance_level")?)?),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "state must be 'list' or 'present', got '{other}'"
                )));
            }
        };

        let mut changed = false;
        let mut facts = Map::new();
        let mut diff = Diff::empty();
        for host in common::hosts(ctx, params).await? {
            let manager = common::host_manager(ctx, &host, "imageConfigManager").await?;
            let current = ctx.call(&manager, "HostImageConfigGetAcceptance", args!()).await?;
            let current = current.as_str().unwrap_or_default().to_string();
            let mut level = current.clone();
            if let Some(want) = desired
                && want.as_str() != current
            {
                changed = true;
                common::diff_entry(&mut diff, host.display_name(), json!(current), json!(want.as_str()));
                if !ctx.check_mode() {
                    info!(host = %host.display_name(), level = want.as_str(), "setting acceptance level");
                    ctx.mutate(
                        &manager,
                        "UpdateHostImageAcceptanceLevel",
                        args! { "newAcceptanceLevel" => want.as_str() },
                    )
                    .await?;
                }
                level = want.as_str().to_string();
            }
            facts.insert(host.display_name().to_string(), json!({ "level": level }));
        }
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed)
            .with("facts", Value::Object(facts))
            .with_diff(diff))
    }
}
