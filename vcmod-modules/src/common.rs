//! Lookups and parameters shared by several modules.

use serde_json::Value;
use vcmod_core::diff::Diff;
use vcmod_core::inventory::{By, NameMatch, Scope};
use vcmod_core::value::{Handle, Kind, MoRef, ValueExt};
use vcmod_core::{Context, Error, Param, Params, Result, State};

pub fn state_param() -> Param {
    Param::str("state").choices(&["present", "absent"]).default("present")
}

pub fn state(params: &Params) -> Result<State> {
    params.str("state").unwrap_or("present").parse()
}

pub fn name_match_param() -> Param {
    Param::str("name_match")
        .choices(&["first", "last"])
        .doc("tie-break for by-name lookups")
}

pub fn name_match(params: &Params) -> Result<NameMatch> {
    NameMatch::parse(params.str("name_match"))
}

/// `datacenter` and `cluster_name` as a lookup scope.
pub fn scope(params: &Params) -> Scope {
    Scope {
        datacenter: params.string("datacenter"),
        cluster: params.string("cluster_name"),
        ..Scope::default()
    }
}

pub async fn datacenter(ctx: &Context, params: &Params) -> Result<Handle> {
    ctx.resolver().datacenter(params.require_str("datacenter")?).await
}

/// One of a datacenter's `vmFolder`, `hostFolder`, `datastoreFolder` or
/// `networkFolder`.
pub async fn datacenter_folder(ctx: &Context, dc: &Handle, which: &str) -> Result<MoRef> {
    let props = ctx.properties(&dc.moref(), &[which]).await?;
    props
        .moref_at(which)
        .ok_or_else(|| Error::NotFound(format!("datacenter {} has no {which}", dc.display_name())))
}

pub async fn cluster(ctx: &Context, params: &Params) -> Result<Handle> {
    let name = params.require_str("cluster_name")?;
    let scope = Scope {
        datacenter: params.string("datacenter"),
        ..Scope::default()
    };
    ctx.resolver()
        .find(Kind::ClusterComputeResource, &By::Name(name.to_string()), &scope, name_match(params)?)
        .await
}

/// The host named by `esxi_hostname`, checked against `cluster_name` when
/// both are given.
pub async fn host(ctx: &Context, params: &Params) -> Result<Handle> {
    let name = params.require_str("esxi_hostname")?;
    let scope = Scope {
        datacenter: params.string("datacenter"),
        cluster: params.string("cluster_name"),
        ..Scope::default()
    };
    if scope.cluster.is_some() {
        // Scope resolution enforces cluster membership and lands on the host.
        let with_host = Scope {
            host: Some(name.to_string()),
            ..scope.clone()
        };
        ctx.resolver().scope_root(&with_host).await?;
    }
    let scope = Scope {
        cluster: None,
        ..scope
    };
    ctx.resolver()
        .find(Kind::HostSystem, &By::Name(name.to_string()), &scope, name_match(params)?)
        .await
}

/// `esxi_hostname` alone, or every host of `cluster_name`.
pub async fn hosts(ctx: &Context, params: &Params) -> Result<Vec<Handle>> {
    if params.is_set("esxi_hostname") {
        return Ok(vec![host(ctx, params).await?]);
    }
    let scope = scope(params);
    if scope.cluster.is_none() {
        return Err(Error::InvalidArgument(
            "one of the following is required: cluster_name, esxi_hostname".to_string(),
        ));
    }
    let hosts = ctx.resolver().list(Kind::HostSystem, &scope).await?;
    if hosts.is_empty() {
        return Err(Error::NotFound(format!(
            "cluster '{}' has no hosts",
            scope.cluster.unwrap_or_default()
        )));
    }
    Ok(hosts)
}

pub fn host_params() -> Vec<Param> {
    vec![
        Param::str("cluster_name").doc("every host of this cluster"),
        Param::str("esxi_hostname").doc("a single host"),
        Param::str("datacenter"),
        name_match_param(),
    ]
}

/// A per-host manager from `configManager`.
pub async fn host_manager(ctx: &Context, host: &Handle, which: &str) -> Result<MoRef> {
    let path = format!("configManager.{which}");
    let props = ctx.properties(&host.moref(), &[path.as_str()]).await?;
    props.moref_at(&path).ok_or_else(|| {
        Error::Unsupported(format!("host {} has no {which}", host.display_name()))
    })
}

pub fn vm_params() -> Vec<Param> {
    vec![
        Param::str("name").doc("virtual machine name"),
        Param::str("uuid").doc("BIOS UUID"),
        Param::bool("use_instance_uuid").default(false),
        Param::str("moid"),
        Param::str("folder"),
        Param::str("datacenter"),
        name_match_param(),
    ]
}

pub async fn vm(ctx: &Context, params: &Params) -> Result<Handle> {
    let by = match (params.string("moid"), params.string("uuid"), params.string("name")) {
        (Some(moid), _, _) => By::Moid(moid),
        (None, Some(uuid), _) if params.flag("use_instance_uuid") => By::InstanceUuid(uuid),
        (None, Some(uuid), _) => By::Uuid(uuid),
        (None, None, Some(name)) => By::Name(name),
        (None, None, None) => {
            return Err(Error::InvalidArgument(
                "one of the following is required: name, uuid, moid".to_string(),
            ));
        }
    };
    let scope = Scope {
        datacenter: params.string("datacenter"),
        folder: params.string("folder"),
        ..Scope::default()
    };
    ctx.resolver()
        .find(Kind::VirtualMachine, &by, &scope, name_match(params)?)
        .await
}

/// `config.hardware.device` of a VM.
pub async fn vm_devices(ctx: &Context, vm: &Handle) -> Result<Vec<Value>> {
    let props = ctx
        .properties(&vm.moref(), &["config.hardware.device", "runtime.powerState"])
        .await?;
    Ok(props.list_at("config.hardware.device").into_iter().cloned().collect())
}

/// Apply device changes with one `ReconfigVM_Task`.
pub async fn reconfigure_vm(ctx: &Context, vm: &Handle, changes: Vec<Value>) -> Result<()> {
    let spec = vcmod_core::builders::vm_devices::config_spec(changes);
    ctx.mutate_task(&vm.moref(), "ReconfigVM_Task", vcmod_core::args! { "spec" => spec })
        .await?;
    Ok(())
}

/// Parse an enum-like parameter with its own parser.
pub fn parse_with<T>(params: &Params, key: &str, parse: impl Fn(&str) -> Result<T>) -> Result<Option<T>> {
    params.str(key).map(parse).transpose()
}

/// Record one keyed entry, such as a host name, on both sides of a diff.
pub fn diff_entry(diff: &mut Diff, key: &str, before: Value, after: Value) {
    for (side, value) in [(&mut diff.before, before), (&mut diff.after, after)] {
        if let Value::Object(map) = side {
            map.insert(key.to_string(), value);
        }
    }
}
