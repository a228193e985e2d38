use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::builders::host::passthrough_config;
use vcmod_core::diff::Diff;
use vcmod_core::value::ValueExt;
use vcmod_core::{
    ArgType, ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result, args,
};

use super::host_sriov::passthru_info;
use crate::common;

/// PCI device passthrough on ESXi hosts.
pub struct HostPassthrough;

/// A device given as a PCI id (`0000:af:00.0`) or by its device name.
async fn device_id(ctx: &Context, host: &vcmod_core::Handle, device: &str) -> Result<String> {
    if device.matches(':').count() == 2 {
        return Ok(device.to_string());
    }
    let props = ctx.properties(&host.moref(), &["hardware.pciDevice"]).await?;
    props
        .list_at("hardware.pciDevice")
        .into_iter()
        .find(|d| d.str_at("deviceName") == Some(device))
        .and_then(|d| d.str_at("id"))
        .map(str::to_string)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "PCI device '{device}' does not exist on host {}",
                host.display_name()
            ))
        })
}

#[async_trait]
impl Module for HostPassthrough {
    fn name(&self) -> &'static str {
        "host_passthrough"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(
            Param::list("devices", ArgType::Str)
                .required()
                .doc("PCI ids or device names"),
        )
        .param(
            Param::str("state")
                .choices(&["present", "absent"])
                .default("present")
                .doc("present enables passthrough, absent disables it"),
        )
        .required_one_of(&["cluster_name", "esxi_hostname"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let enable = params.str("state").unwrap_or("present") == "present";
        let devices = params.str_list("devices");

        let mut changed = false;
        let mut results = Map::new();
        let mut diff = Diff::empty();
        for host in common::hosts(ctx, params).await? {
            let mut configs = Vec::new();
            let mut host_result = Map::new();
            for device in &devices {
                let id = device_id(ctx, &host, device).await?;
                let info = passthru_info(ctx, &host, &id).await?;
                if info.bool_at("passthruCapable") != Some(true) {
                    return Err(Error::Unsupported(format!(
                        "PCI device {id} on host {} does not support passthrough",
                        host.display_name()
                    )));
                }
                let current = info.bool_at("passthruEnabled").unwrap_or(false);
                if current != enable {
                    configs.push(passthrough_config(&id, enable));
                }
                host_result.insert(
                    id,
                    json!({ "device": device, "previous": current, "current": enable }),
                );
            }
            if !configs.is_empty() {
                changed = true;
                let ids: Vec<&str> = configs.iter().filter_map(|c| c.str_at("id")).collect();
                common::diff_entry(
                    &mut diff,
                    host.display_name(),
                    json!({ "passthru_enabled": !enable, "devices": ids }),
                    json!({ "passthru_enabled": enable, "devices": ids }),
                );
                if !ctx.check_mode() {
                    let system = common::host_manager(ctx, &host, "pciPassthruSystem").await?;
                    info!(host = %host.display_name(), count = configs.len(), enable, "updating passthrough");
                    ctx.mutate(&system, "UpdatePassthruConfig", args! { "config" => configs }).await?;
                }
            }
            results.insert(host.display_name().to_string(), Value::Object(host_result));
        }
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed)
            .with("passthrough_configs", Value::Object(results))
            .with_diff(diff))
    }
}
