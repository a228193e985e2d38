use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::builders::host::{ServicePolicy, ServiceState, service_method};
use vcmod_core::diff::Diff;
use vcmod_core::value::ValueExt;
use vcmod_core::{ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result, args};

use crate::common;

/// Run state and startup policy of a host service (`TSM-SSH`, `ntpd`, ...).
pub struct HostService;

#[async_trait]
impl Module for HostService {
    fn name(&self) -> &'static str {
        "host_service"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(Param::str("service_name").required())
            .param(
                Param::str("state")
                    .choices(&["start", "stop", "restart", "present", "absent", "unchanged"])
                    .default("start"),
            )
            .param(Param::str("service_policy").choices(&["on", "off", "automatic"]))
            .required_one_of(&["cluster_name", "esxi_hostname"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let service = params.require_str("service_name")?;
        let state = ServiceState::parse(params.str("state").unwrap_or("start"))?;
        let policy = common::parse_with(params, "service_policy", ServicePolicy::parse)?;

        let mut changed = false;
        let mut status = Map::new();
        let mut diff = Diff::empty();
        for host in common::hosts(ctx, params).await? {
            let props = ctx.properties(&host.moref(), &["config.service.service"]).await?;
            let found = props
                .list_at("config.service.service")
                .into_iter()
                .find(|s| s.str_at("key") == Some(service))
                .cloned()
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "service '{service}' does not exist on host {}",
                        host.display_name()
                    ))
                })?;
            let running = found.bool_at("running").unwrap_or(false);
            let current_policy = found.str_at("policy").unwrap_or_default().to_string();

            let method = service_method(state, running);
            let new_policy = policy.filter(|p| p.as_str() != current_policy);
            if method.is_some() || new_policy.is_some() {
                changed = true;
                let name = host.display_name();
                common::diff_entry(
                    &mut diff,
                    name,
                    json!({ "running": running, "policy": current_policy }),
                    json!({
                        "running": state.wants_running().unwrap_or(running),
                        "policy": new_policy.map(|p| p.as_str()).unwrap_or(current_policy.as_str()),
                    }),
                );
            }
            if !ctx.check_mode() && (method.is_some() || new_policy.is_some()) {
                let system = common::host_manager(ctx, &host, "serviceSystem").await?;
                if let Some(method) = method {
                    info!(host = %host.display_name(), service, method, "changing service state");
                    ctx.mutate(&system, method, args! { "id" => service }).await?;
                }
                if let Some(p) = new_policy {
                    info!(host = %host.display_name(), service, policy = p.as_str(), "changing service policy");
                    ctx.mutate(&system, "UpdateServicePolicy", args! { "id" => service, "policy" => p.as_str() })
                        .await?;
                }
            }
            status.insert(
                host.display_name().to_string(),
                json!({
                    "service_name": service,
                    "running": state.wants_running().unwrap_or(running),
                    "policy": new_policy.map(|p| p.as_str().to_string()).unwrap_or(current_policy),
                    "changed": method.is_some() || new_policy.is_some(),
                }),
            );
        }
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed)
            .with("host_service_status", Value::Object(status))
            .with_diff(diff))
    }
}
