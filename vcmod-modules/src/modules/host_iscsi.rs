//! Software iSCSI adapter: enablement, IQN and dynamic-discovery targets.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::builders::host::SendTarget;
use vcmod_core::diff::Diff;
use vcmod_core::value::{Handle, ValueExt};
use vcmod_core::{
    ArgType, ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result, args,
};

use crate::common;

pub struct HostIscsi;

struct Adapter {
    enabled: bool,
    device: Option<String>,
    iscsi_name: Option<String>,
    targets: BTreeSet<SendTarget>,
}

async fn adapter(ctx: &Context, host: &Handle) -> Result<Adapter> {
    let props = ctx
        .properties(
            &host.moref(),
            &[
                "config.storageDevice.softwareInternetScsiEnabled",
                "config.storageDevice.hostBusAdapter",
            ],
        )
        .await?;
    let hba = props
        .list_at("config.storageDevice.hostBusAdapter")
        .into_iter()
        .find(|h| h.type_name() == Some("HostInternetScsiHba"))
        .cloned();
    Ok(Adapter {
        enabled: props
            .bool_at("config.storageDevice.softwareInternetScsiEnabled")
            .unwrap_or(false),
        device: hba.as_ref().and_then(|h| h.str_at("device")).map(str::to_string),
        iscsi_name: hba.as_ref().and_then(|h| h.str_at("iScsiName")).map(str::to_string),
        targets: hba
            .as_ref()
            .map(|h| {
                h.list_at("configuredSendTarget")
                    .into_iter()
                    .map(|t| SendTarget {
                        address: t.str_at("address").unwrap_or_default().to_string(),
                        port: t.i64_at("port").unwrap_or(3260),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn labels(targets: &BTreeSet<SendTarget>) -> Vec<String> {
    targets.iter().map(SendTarget::label).collect()
}

#[async_trait]
impl Module for HostIscsi {
    fn name(&self) -> &'static str {
        "host_iscsi"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(
            Param::str("state")
                .choices(&["enabled", "disabled"])
                .default("enabled"),
        )
        .param(Param::str("iscsi_name").doc("IQN of the software adapter"))
        .param(Param::list("send_targets", ArgType::Str).doc("address[:port] entries"))
        .param(Param::bool("purge_send_targets").default(false))
        .required_one_of(&["cluster_name", "esxi_hostname"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let enable = params.str("state").unwrap_or("enabled") == "enabled";
        let iscsi_name = params.string("iscsi_name");
        let wanted: BTreeSet<SendTarget> = params
            .str_list("send_targets")
            .iter()
            .map(|s| SendTarget::parse(s))
            .collect::<Result<_>>()?;
        let purge = params.flag("purge_send_targets");

        let mut changed = false;
        let mut results = Map::new();
        let mut diff = Diff::empty();
        for host in common::hosts(ctx, params).await? {
            let mut current = adapter(ctx, &host).await?;
            let before = json!({
                "enabled": current.enabled,
                "iscsi_name": current.iscsi_name,
                "send_targets": labels(&current.targets),
            });
            let mut host_changed = false;

            if current.enabled != enable {
                host_changed = true;
                if !ctx.check_mode() {
                    let storage = common::host_manager(ctx, &host, "storageSystem").await?;
                    info!(host = %host.display_name(), enable, "switching software iSCSI");
                    ctx.mutate(&storage, "UpdateSoftwareInternetScsiEnabled", args! { "enabled" => enable })
                        .await?;
                    current = adapter(ctx, &host).await?;
                } else {
                    current.enabled = enable;
                }
            }

            let mut after_name = current.iscsi_name.clone();
            let mut after_targets = current.targets.clone();
            if enable {
                let rename = iscsi_name.as_ref().filter(|n| current.iscsi_name.as_ref() != Some(*n));
                let missing: Vec<&SendTarget> = wanted.difference(&current.targets).collect();
                let extra: Vec<&SendTarget> = if purge {
                    current.targets.difference(&wanted).collect()
                } else {
                    Vec::new()
                };
                host_changed |= rename.is_some() || !missing.is_empty() || !extra.is_empty();

                if !ctx.check_mode() && (rename.is_some() || !missing.is_empty() || !extra.is_empty()) {
                    let storage = common::host_manager(ctx, &host, "storageSystem").await?;
                    let device = current.device.clone().ok_or_else(|| {
                        Error::NotFound(format!(
                            "host {} has no software iSCSI adapter",
                            host.display_name()
                        ))
                    })?;
                    if let Some(name) = rename {
                        info!(host = %host.display_name(), iqn = %name, "renaming iSCSI adapter");
                        ctx.mutate(
                            &storage,
                            "UpdateInternetScsiName",
                            args! { "iScsiHbaDevice" => device.as_str(), "iScsiName" => name.as_str() },
                        )
                        .await?;
                    }
                    if !missing.is_empty() {
                        let targets: Vec<Value> = missing.iter().map(|t| t.to_value()).collect();
                        ctx.mutate(
                            &storage,
                            "AddInternetScsiSendTargets",
                            args! { "iScsiHbaDevice" => device.as_str(), "targets" => targets },
                        )
                        .await?;
                    }
                    if !extra.is_empty() {
                        let targets: Vec<Value> = extra.iter().map(|t| t.to_value()).collect();
                        ctx.mutate(
                            &storage,
                            "RemoveInternetScsiSendTargets",
                            args! { "iScsiHbaDevice" => device.as_str(), "targets" => targets },
                        )
                        .await?;
                    }
                    if !missing.is_empty() || !extra.is_empty() {
                        ctx.mutate(&storage, "RescanAllHba", args!()).await?;
                    }
                }
                if let Some(name) = rename {
                    after_name = Some(name.clone());
                }
                let extra: Vec<SendTarget> = extra.into_iter().cloned().collect();
                after_targets.extend(missing.into_iter().cloned());
                after_targets.retain(|t| !extra.contains(t));
            } else {
                after_name = None;
                after_targets.clear();
            }

            let after = json!({
                "enabled": enable,
                "iscsi_name": after_name,
                "send_targets": labels(&after_targets),
            });
            if host_changed {
                changed = true;
                common::diff_entry(&mut diff, host.display_name(), before, after.clone());
            }
            results.insert(host.display_name().to_string(), after);
        }
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed)
            .with("iscsi_properties", Value::Object(results))
            .with_diff(diff))
    }
}
