//! Installs license keys and assigns them to hosts or clusters.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::diff::Diff;
use vcmod_core::value::{Handle, MoRef, ValueExt};
use vcmod_core::{
    ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result, State, args,
};

use crate::common;

pub struct License;

/// Key of the evaluation license every new entity starts on.
const EVAL_LICENSE: &str = "00000-00000-00000-00000-00000";

struct Managers {
    licenses: MoRef,
    assignments: MoRef,
}

async fn managers(ctx: &Context) -> Result<(Managers, Vec<String>)> {
    let manager = ctx.content().license_manager()?.clone();
    let props = ctx
        .properties(&manager, &["licenses", "licenseAssignmentManager"])
        .await?;
    let assignments = props.moref_at("licenseAssignmentManager").ok_or_else(|| {
        Error::Unsupported("endpoint has no license assignment manager".to_string())
    })?;
    let installed = props
        .list_at("licenses")
        .into_iter()
        .filter_map(|l| l.str_at("licenseKey"))
        .filter(|k| *k != EVAL_LICENSE)
        .map(str::to_string)
        .collect();
    Ok((
        Managers {
            licenses: manager,
            assignments,
        },
        installed,
    ))
}

async fn assigned_key(ctx: &Context, managers: &Managers, entity: &Handle) -> Result<Option<String>> {
    let assigned = ctx
        .call(
            &managers.assignments,
            "QueryAssignedLicenses",
            args! { "entityId" => entity.moid.as_str() },
        )
        .await?;
    Ok(assigned
        .list_at("")
        .into_iter()
        .find_map(|a| a.str_at("assignedLicense.licenseKey"))
        .map(str::to_string))
}

async fn entity(ctx: &Context, params: &Params) -> Result<Option<Handle>> {
    if params.is_set("esxi_hostname") {
        return common::host(ctx, params).await.map(Some);
    }
    if params.is_set("cluster_name") {
        return common::cluster(ctx, params).await.map(Some);
    }
    Ok(None)
}

#[async_trait]
impl Module for License {
    fn name(&self) -> &'static str {
        "license"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("license").required().doc("license key"))
            .param(Param::dict("labels").doc("key/value labels attached when the key is added"))
            .param(Param::str("esxi_hostname").doc("assign the key to this host"))
            .param(Param::str("cluster_name").doc("assign the key to this cluster"))
            .param(Param::str("datacenter"))
            .param(common::state_param())
            .param(common::name_match_param())
            .mutually_exclusive(&["esxi_hostname", "cluster_name"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let key = params.require_str("license")?;
        let state = common::state(params)?;
        let (managers, mut installed) = managers(ctx).await?;
        let is_installed = installed.iter().any(|k| k == key);
        let target = entity(ctx, params).await?;

        let mut changed = false;
        let mut before = json!({ "installed": is_installed });
        let mut after = json!({ "installed": state == State::Present });

        match state {
            State::Present => {
                if !is_installed {
                    changed = true;
                    if !ctx.check_mode() {
                        info!("adding license");
                        let labels: Vec<Value> = params
                            .dict("labels")
                            .map(|l| {
                                l.iter()
                                    .map(|(k, v)| json!({ "_type": "KeyValue", "key": k, "value": v }))
                                    .collect()
                            })
                            .unwrap_or_default();
                        let mut args = args! { "licenseKey" => key };
                        if !labels.is_empty() {
                            args.push(("labels".to_string(), Value::Array(labels)));
                        }
                        ctx.mutate(&managers.licenses, "AddLicense", args).await?;
                    }
                    installed.push(key.to_string());
                }
                if let Some(entity) = &target {
                    let current = assigned_key(ctx, &managers, entity).await?;
                    before["assigned"] = json!(current);
                    after["assigned"] = json!(key);
                    if current.as_deref() != Some(key) {
                        changed = true;
                        if !ctx.check_mode() {
                            info!(entity = %entity.moref(), "assigning license");
                            ctx.mutate(
                                &managers.assignments,
                                "UpdateAssignedLicense",
                                args! { "entity" => entity.moid.as_str(), "licenseKey" => key },
                            )
                            .await?;
                        }
                    }
                }
            }
            State::Absent => {
                if is_installed {
                    changed = true;
                    if !ctx.check_mode() {
                        info!("removing license");
                        ctx.mutate(&managers.licenses, "RemoveLicense", args! { "licenseKey" => key })
                            .await?;
                    }
                    installed.retain(|k| k != key);
                }
            }
        }

        let diff = if changed {
            Diff { before, after }
        } else {
            Diff::empty()
        };
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed).with("licenses", installed).with_diff(diff))
    }
}
