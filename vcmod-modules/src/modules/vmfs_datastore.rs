//! Mount state of a VMFS datastore, including force-mounting an
//! unresolved snapshot volume under its original signature.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};
use vcmod_core::builders::datastore::{extent_paths, force_mount_spec};
use vcmod_core::diff::Diff;
use vcmod_core::value::{Handle, Kind, MoRef, ValueExt};
use vcmod_core::{
    ArgumentSpec, By, Context, Error, Module, NameMatch, Outcome, Param, Params, Result, Scope,
    args,
};

use crate::common;

pub struct VmfsDatastore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountState {
    Mounted,
    Unmounted,
}

impl MountState {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "mounted" | "present" => Ok(MountState::Mounted),
            "unmounted" | "absent" => Ok(MountState::Unmounted),
            other => Err(Error::InvalidArgument(format!(
                "state must be 'mounted' or 'unmounted', got '{other}'"
            ))),
        }
    }
}

/// Hosts to act on: the named one, or every host in the scope.
async fn candidate_hosts(ctx: &Context, params: &Params) -> Result<Vec<Handle>> {
    if params.is_set("esxi_hostname") {
        return Ok(vec![common::host(ctx, params).await?]);
    }
    let scope = Scope {
        datacenter: params.string("datacenter"),
        ..Scope::default()
    };
    ctx.resolver().list(Kind::HostSystem, &scope).await
}

/// Per-host mount flags of an existing datastore.
fn mounts(ds: &Value) -> Vec<(MoRef, bool)> {
    ds.list_at("host")
        .into_iter()
        .filter_map(|m| Some((m.moref_at("key")?, m.bool_at("mountInfo.mounted").unwrap_or(false))))
        .collect()
}

#[async_trait]
impl Module for VmfsDatastore {
    fn name(&self) -> &'static str {
        "vmfs_datastore"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("datastore_name").required().aliases(&["name"]))
            .param(Param::str("esxi_hostname").doc("limit to one host"))
            .param(Param::str("datacenter"))
            .param(
                Param::str("state")
                    .choices(&["mounted", "unmounted"])
                    .default("mounted"),
            )
            .param(common::name_match_param())
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let name = params.require_str("datastore_name")?;
        let state = MountState::parse(params.str("state").unwrap_or("mounted"))?;
        let hosts = candidate_hosts(ctx, params).await?;
        let scope = Scope {
            datacenter: params.string("datacenter"),
            ..Scope::default()
        };
        let existing = ctx
            .resolver()
            .find_optional(Kind::Datastore, &By::Name(name.to_string()), &scope, NameMatch::Unique)
            .await?;

        let mut actions = Vec::new();
        match (&existing, state) {
            (Some(ds), _) => {
                let props = ctx.properties(&ds.moref(), &["info.vmfs.uuid", "host"]).await?;
                let uuid = props
                    .str_at("info.vmfs.uuid")
                    .ok_or_else(|| Error::PreconditionFailed(format!("datastore '{name}' is not a VMFS volume")))?
                    .to_string();
                let want = state == MountState::Mounted;
                for (host_ref, mounted) in mounts(&props) {
                    let Some(host) = hosts.iter().find(|h| h.moid == host_ref.value) else {
                        continue;
                    };
                    if mounted == want {
                        continue;
                    }
                    let method = if want { "MountVmfsVolume" } else { "UnmountVmfsVolume" };
                    actions.push(json!({ "host": host.display_name(), "action": method }));
                    if !ctx.check_mode() {
                        let storage = common::host_manager(ctx, host, "storageSystem").await?;
                        info!(datastore = %name, host = %host.display_name(), method, "changing mount");
                        ctx.mutate(&storage, method, args! { "vmfsUuid" => uuid.as_str() }).await?;
                    }
                }
            }
            (None, MountState::Mounted) => {
                let mut resolved = false;
                for host in &hosts {
                    let storage = common::host_manager(ctx, host, "storageSystem").await?;
                    let unresolved = ctx.call(&storage, "QueryUnresolvedVmfsVolume", args!()).await?;
                    let Some(volume) = unresolved
                        .list_at("")
                        .into_iter()
                        .find(|v| v.str_at("vmfsLabel") == Some(name))
                    else {
                        debug!(host = %host.display_name(), "no unresolved volume with this label");
                        continue;
                    };
                    let paths = extent_paths(volume);
                    actions.push(json!({
                        "host": host.display_name(),
                        "action": "ResolveMultipleUnresolvedVmfsVolumes",
                        "extents": paths,
                    }));
                    if !ctx.check_mode() {
                        info!(datastore = %name, host = %host.display_name(), "force-mounting snapshot volume");
                        ctx.mutate(
                            &storage,
                            "ResolveMultipleUnresolvedVmfsVolumes",
                            args! { "resolutionSpec" => vec![force_mount_spec(&paths)] },
                        )
                        .await?;
                    }
                    resolved = true;
                    break;
                }
                if !resolved {
                    return Err(Error::NotFound(format!(
                        "unable to find datastore or unresolved VMFS volume '{name}'"
                    )));
                }
            }
            (None, MountState::Unmounted) => {}
        }

        let changed = !actions.is_empty();
        let diff = if changed {
            let before = if state == MountState::Mounted { "unmounted" } else { "mounted" };
            let after = if state == MountState::Mounted { "mounted" } else { "unmounted" };
            Diff {
                before: json!({ "state": before }),
                after: json!({ "state": after }),
            }
        } else {
            Diff::empty()
        };
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed)
            .with("result", json!({ "datastore": name, "actions": actions }))
            .with_diff(diff))
    }
}
