//! vim25 method semantics.

use std::collections::BTreeSet;

use serde_json::{Map, Value, json};
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{Error, Result};

use crate::devices;
use crate::world::{World, fault, not_found};

pub(crate) const EVAL_LICENSE: &str = "00000-00000-00000-00000-00000";

fn arg<'a>(args: &'a Value, name: &str) -> Option<&'a Value> {
    args.at(name)
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args.str_at(name)
        .ok_or_else(|| fault("InvalidArgument", format!("missing argument {name}")))
}

fn moref_arg(args: &Value, name: &str) -> Result<MoRef> {
    args.moref_at(name)
        .ok_or_else(|| fault("InvalidArgument", format!("missing argument {name}")))
}

/// Deep-merge `patch` into `base`; `option` arrays merge by key.
fn merge(base: &mut Value, patch: &Value) {
    if !(base.is_object() && patch.is_object()) {
        *base = patch.clone();
        return;
    }
    let (Value::Object(b), Value::Object(p)) = (base, patch) else {
        return;
    };
    for (k, v) in p {
        if k == "_type" {
            continue;
        }
        if k == "option" {
            let mut merged: Vec<Value> = b.get(k).map(|o| o.list_at("")).unwrap_or_default().into_iter().cloned().collect();
            for item in v.list_at("") {
                let key = item.str_at("key");
                match merged.iter_mut().find(|m| m.str_at("key") == key) {
                    Some(slot) => *slot = item.clone(),
                    None => merged.push(item.clone()),
                }
            }
            b.insert(k.clone(), Value::Array(merged));
            continue;
        }
        match b.get_mut(k) {
            Some(existing) if existing.is_object() && v.is_object() => merge(existing, v),
            _ => {
                b.insert(k.clone(), v.clone());
            }
        }
    }
}

/// The host a per-host manager belongs to.
fn owner_host(w: &World, this: &MoRef) -> Result<MoRef> {
    w.prop(this, "host")
        .and_then(|h| MoRef::from_value(&h))
        .ok_or_else(|| not_found(this))
}

fn in_maintenance(w: &World, host: &MoRef) -> bool {
    w.prop(host, "runtime.inMaintenanceMode").and_then(|v| v.as_bool()) == Some(true)
}

fn power_state(w: &World, obj: &MoRef) -> String {
    w.prop(obj, "runtime.powerState")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn invalid_power(state: &str) -> Error {
    fault(
        "InvalidPowerState",
        format!("The attempted operation cannot be performed in the current state ({state})."),
    )
}

pub(crate) fn handle(w: &mut World, this: &MoRef, method: &str, args: &Value) -> Result<Value> {
    if method.ends_with("_Task") {
        return task_method(w, this, method, args);
    }
    match method {
        "CreateClusterEx" => create_cluster(w, this, args),
        "FindAllByUuid" => find_by_uuid(w, args),
        "FindAllByDnsName" => find_by_dns_name(w, args),
        "FindByInventoryPath" => find_by_path(w, str_arg(args, "inventoryPath")?),
        "AddLicense" => add_license(w, this, str_arg(args, "licenseKey")?),
        "RemoveLicense" => remove_license(w, this, str_arg(args, "licenseKey")?),
        "QueryAssignedLicenses" => query_assigned(w, args),
        "UpdateAssignedLicense" => update_assigned(w, args),
        "RetrieveEntityPermissions" => {
            let entity = moref_arg(args, "entity")?;
            w.require(&entity)?;
            Ok(Value::Array(w.permissions.get(&entity.value).cloned().unwrap_or_default()))
        }
        "SetEntityPermissions" => set_permissions(w, this, args),
        "RemoveEntityPermission" => remove_permission(w, args),
        "QueryUnresolvedVmfsVolume" => Ok(w.prop(this, "unresolvedVolume").unwrap_or(json!([]))),
        "ResolveMultipleUnresolvedVmfsVolumes" => resolve_volumes(w, this, args),
        "MountVmfsVolume" => set_mounted(w, this, str_arg(args, "vmfsUuid")?, true),
        "UnmountVmfsVolume" => set_mounted(w, this, str_arg(args, "vmfsUuid")?, false),
        "UpdateSoftwareInternetScsiEnabled" => software_iscsi(w, this, args),
        "AddInternetScsiSendTargets" => send_targets(w, this, args, true),
        "RemoveInternetScsiSendTargets" => send_targets(w, this, args, false),
        "UpdateInternetScsiName" => {
            let host = owner_host(w, this)?;
            let device = str_arg(args, "iScsiHbaDevice")?.to_string();
            let name = str_arg(args, "iScsiName")?.to_string();
            update_hba(w, &host, &device, |hba| hba["iScsiName"] = json!(name))?;
            Ok(Value::Null)
        }
        "RescanAllHba" => Ok(Value::Null),
        "StartService" | "StopService" | "RestartService" => {
            let running = method != "StopService";
            update_service(w, this, str_arg(args, "id")?, |s| s["running"] = json!(running))
        }
        "UpdateServicePolicy" => {
            let policy = str_arg(args, "policy")?.to_string();
            update_service(w, this, str_arg(args, "id")?, |s| s["policy"] = json!(policy))
        }
        "HostImageConfigGetAcceptance" => Ok(w.prop(this, "acceptanceLevel").unwrap_or(json!("partner"))),
        "UpdateHostImageAcceptanceLevel" => {
            let level = str_arg(args, "newAcceptanceLevel")?;
            if !["vmware_certified", "vmware_accepted", "partner", "community"].contains(&level) {
                return Err(fault("InvalidArgument", format!("unknown acceptance level {level}")));
            }
            w.set_prop(this, "acceptanceLevel", json!(level))?;
            Ok(Value::Null)
        }
        "ChangeLockdownMode" => {
            let host = owner_host(w, this)?;
            let mode = str_arg(args, "mode")?;
            w.set_prop(&host, "config.lockdownMode", json!(mode))?;
            Ok(Value::Null)
        }
        "EnableRuleset" | "DisableRuleset" => {
            let enabled = method == "EnableRuleset";
            update_ruleset(w, this, str_arg(args, "id")?, |r| r["enabled"] = json!(enabled))
        }
        "UpdateRuleset" => {
            let allowed = arg(args, "spec")
                .and_then(|s| s.at("allowedHosts"))
                .cloned()
                .ok_or_else(|| fault("InvalidArgument", "missing spec.allowedHosts"))?;
            update_ruleset(w, this, str_arg(args, "id")?, |r| r["allowedHosts"] = allowed)
        }
        "UpdatePassthruConfig" => update_passthru(w, this, args),
        "BackupFirmwareConfiguration" => {
            let host = owner_host(w, this)?;
            let name = w.prop(&host, "name").and_then(|n| n.as_str().map(str::to_string)).unwrap_or_default();
            let url = format!("http://*/downloads/{}/configBundle-{name}.tgz", uuid::Uuid::new_v4());
            w.files.insert(url.replacen('*', &name, 1), format!("config bundle of {name}").into_bytes());
            Ok(json!(url))
        }
        "QueryFirmwareConfigUploadURL" => Ok(json!("http://*/tmp/configBundle.tgz")),
        "RestoreFirmwareConfiguration" => {
            let host = owner_host(w, this)?;
            if !in_maintenance(w, &host) {
                return Err(fault("InvalidState", "host is not in maintenance mode"));
            }
            let name = w.prop(&host, "name").and_then(|n| n.as_str().map(str::to_string)).unwrap_or_default();
            if !w.files.contains_key(&format!("http://{name}/tmp/configBundle.tgz")) {
                return Err(fault("FileNotFound", "no configuration bundle was uploaded"));
            }
            Ok(Value::Null)
        }
        "ResetFirmwareToFactoryDefaults" => {
            let host = owner_host(w, this)?;
            if !in_maintenance(w, &host) {
                return Err(fault("InvalidState", "host is not in maintenance mode"));
            }
            Ok(Value::Null)
        }
        "AnswerVM" => answer(w, this, args),
        "ShutdownGuest" | "RebootGuest" => {
            let state = power_state(w, this);
            if state != "poweredOn" {
                return Err(invalid_power(&state));
            }
            if w.prop(this, "guest.toolsRunningStatus").and_then(|v| v.as_str().map(str::to_string)).as_deref()
                != Some("guestToolsRunning")
            {
                return Err(fault("ToolsUnavailable", "VMware Tools is not running in the guest"));
            }
            if method == "ShutdownGuest" {
                w.set_prop(this, "runtime.powerState", json!("poweredOff"))?;
            }
            Ok(Value::Null)
        }
        other => Err(fault("NotImplemented", format!("{other} is not implemented"))),
    }
}

fn task_method(w: &mut World, this: &MoRef, method: &str, args: &Value) -> Result<Value> {
    if method == "PowerOnVM_Task" && w.prop(this, "runtime.question").is_some() {
        let state = power_state(w, this);
        if state == "poweredOn" {
            return Ok(w.finished_task(method, this, Err(invalid_power(&state))));
        }
        let task = w.running_task(method, this);
        w.pending_power_on.insert(this.value.clone(), task.value.clone());
        return Ok(task.to_value());
    }
    let outcome = run_task(w, this, method, args);
    Ok(w.finished_task(method, this, outcome))
}

fn run_task(w: &mut World, this: &MoRef, method: &str, args: &Value) -> Result<Value> {
    w.require(this)?;
    match method {
        "Destroy_Task" => {
            if this.kind == "VirtualMachine" && power_state(w, this) == "poweredOn" {
                return Err(invalid_power("poweredOn"));
            }
            w.remove_tree(&this.value);
            Ok(Value::Null)
        }
        "Rename_Task" => {
            let new_name = str_arg(args, "newName")?.to_string();
            if let Some(parent) = w.parent_of(&this.value)
                && w.child_named(&parent, &new_name).is_some_and(|o| o.moref != *this)
            {
                return Err(fault("DuplicateName", format!("The name '{new_name}' already exists.")));
            }
            w.set_prop(this, "name", json!(new_name))?;
            Ok(Value::Null)
        }
        "ReconfigureComputeResource_Task" => {
            let spec = arg(args, "spec").cloned().unwrap_or(Value::Null);
            for (from, to) in [
                ("drsConfig", "drsConfig"),
                ("dasConfig", "dasConfig"),
                ("vsanConfig", "vsanConfigInfo"),
            ] {
                if let Some(patch) = spec.at(from) {
                    let path = format!("configurationEx.{to}");
                    let mut current = w.prop(this, &path).unwrap_or(json!({}));
                    merge(&mut current, patch);
                    w.set_prop(this, &path, current)?;
                }
            }
            Ok(Value::Null)
        }
        "ConfigureDatastoreIORM_Task" => {
            let ds = moref_arg(args, "datastore")?;
            let spec = arg(args, "spec").cloned().unwrap_or(Value::Null);
            let mut current = w.prop(&ds, "iormConfiguration").unwrap_or(json!({}));
            merge(&mut current, &spec);
            w.set_prop(&ds, "iormConfiguration", current)?;
            Ok(Value::Null)
        }
        "EnterMaintenanceMode_Task" | "ExitMaintenanceMode_Task" => {
            let enter = method.starts_with("Enter");
            w.set_prop(this, "runtime.inMaintenanceMode", json!(enter))?;
            Ok(Value::Null)
        }
        "ShutdownHost_Task" | "RebootHost_Task" => {
            let force = args.bool_at("force").unwrap_or(false);
            if !force && !in_maintenance(w, this) {
                return Err(fault(
                    "InvalidState",
                    "The operation is not allowed in the current state: host is not in maintenance mode.",
                ));
            }
            if method == "ShutdownHost_Task" {
                w.set_prop(this, "runtime.powerState", json!("poweredOff"))?;
            }
            Ok(Value::Null)
        }
        "PowerDownHostToStandBy_Task" => {
            w.set_prop(this, "runtime.powerState", json!("standBy"))?;
            Ok(Value::Null)
        }
        "PowerUpHostFromStandBy_Task" => {
            w.set_prop(this, "runtime.powerState", json!("poweredOn"))?;
            Ok(Value::Null)
        }
        "ReconfigVM_Task" => {
            let spec = arg(args, "spec").cloned().unwrap_or(Value::Null);
            devices::reconfigure(w, this, &spec)?;
            Ok(Value::Null)
        }
        "PowerOnVM_Task" => {
            let state = power_state(w, this);
            if state == "poweredOn" {
                return Err(invalid_power(&state));
            }
            w.set_prop(this, "runtime.powerState", json!("poweredOn"))?;
            Ok(Value::Null)
        }
        "PowerOffVM_Task" => {
            let state = power_state(w, this);
            if state == "poweredOff" {
                return Err(invalid_power(&state));
            }
            w.set_prop(this, "runtime.powerState", json!("poweredOff"))?;
            Ok(Value::Null)
        }
        "ResetVM_Task" | "SuspendVM_Task" => {
            let state = power_state(w, this);
            if state != "poweredOn" {
                return Err(invalid_power(&state));
            }
            if method == "SuspendVM_Task" {
                w.set_prop(this, "runtime.powerState", json!("suspended"))?;
            }
            Ok(Value::Null)
        }
        other => Err(fault("NotImplemented", format!("{other} is not implemented"))),
    }
}

fn create_cluster(w: &mut World, folder: &MoRef, args: &Value) -> Result<Value> {
    w.require(folder)?;
    let name = str_arg(args, "name")?.to_string();
    if w.child_named(&folder.value, &name).is_some() {
        return Err(fault("DuplicateName", format!("The name '{name}' already exists.")));
    }
    let spec = arg(args, "spec").cloned().unwrap_or(Value::Null);
    let mut config = json!({
        "drsConfig": { "enabled": false, "defaultVmBehavior": "fullyAutomated", "vmotionRate": 3 },
        "dasConfig": { "enabled": false, "hostMonitoring": "enabled", "admissionControlEnabled": true },
        "vsanConfigInfo": { "enabled": false, "defaultConfig": { "autoClaimStorage": false } },
    });
    merge(&mut config, &json!({
        "drsConfig": spec.at("drsConfig").cloned().unwrap_or(json!({})),
        "dasConfig": spec.at("dasConfig").cloned().unwrap_or(json!({})),
    }));
    let cluster = w.insert(
        "ClusterComputeResource",
        None,
        json!({ "name": name, "parent": folder.to_value(), "configurationEx": config, "host": [] }),
    );
    Ok(cluster.to_value())
}

fn datacenter_filter(w: &World, args: &Value) -> Option<String> {
    args.moref_at("datacenter").map(|dc| dc.value).filter(|dc| w.object(dc).is_some())
}

fn find_by_uuid(w: &World, args: &Value) -> Result<Value> {
    let uuid = str_arg(args, "uuid")?.to_ascii_lowercase();
    let vm_search = args.bool_at("vmSearch").unwrap_or(true);
    let instance = args.bool_at("instanceUuid").unwrap_or(false);
    let dc = datacenter_filter(w, args);
    let (kind, path) = match (vm_search, instance) {
        (true, true) => ("VirtualMachine", "config.instanceUuid"),
        (true, false) => ("VirtualMachine", "config.uuid"),
        (false, _) => ("HostSystem", "hardware.systemInfo.uuid"),
    };
    let found: Vec<Value> = w
        .objects
        .iter()
        .filter(|o| o.moref.kind == kind)
        .filter(|o| o.props.str_at(path).map(str::to_ascii_lowercase) == Some(uuid.clone()))
        .filter(|o| dc.as_ref().is_none_or(|dc| w.is_under(&o.moref.value, dc)))
        .map(|o| o.moref.to_value())
        .collect();
    Ok(Value::Array(found))
}

fn find_by_dns_name(w: &World, args: &Value) -> Result<Value> {
    let dns = str_arg(args, "dnsName")?.to_ascii_lowercase();
    let vm_search = args.bool_at("vmSearch").unwrap_or(true);
    let dc = datacenter_filter(w, args);
    let (kind, path) = if vm_search {
        ("VirtualMachine", "guest.hostName")
    } else {
        ("HostSystem", "name")
    };
    let found: Vec<Value> = w
        .objects
        .iter()
        .filter(|o| o.moref.kind == kind)
        .filter(|o| o.props.str_at(path).map(str::to_ascii_lowercase) == Some(dns.clone()))
        .filter(|o| dc.as_ref().is_none_or(|dc| w.is_under(&o.moref.value, dc)))
        .map(|o| o.moref.to_value())
        .collect();
    Ok(Value::Array(found))
}

fn find_by_path(w: &World, path: &str) -> Result<Value> {
    let Some(root) = w.objects.first().map(|o| o.moref.value.clone()) else {
        return Ok(Value::Null);
    };
    let mut cur = root;
    for seg in path.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
        match w.child_named(&cur, seg) {
            Some(o) => cur = o.moref.value.clone(),
            None => return Ok(Value::Null),
        }
    }
    Ok(w.object(&cur).map(|o| o.moref.to_value()).unwrap_or(Value::Null))
}

fn license_manager(w: &World) -> Result<MoRef> {
    w.objects
        .iter()
        .find(|o| o.moref.kind == "LicenseManager")
        .map(|o| o.moref.clone())
        .ok_or_else(|| fault("NotSupported", "no license manager"))
}

fn license_info(key: &str) -> Value {
    let (edition, name) = if key == EVAL_LICENSE {
        ("eval", "Evaluation Mode")
    } else {
        ("esx.enterprisePlus.cpuPackage", "vSphere 7 Enterprise Plus")
    };
    json!({ "licenseKey": key, "editionKey": edition, "name": name, "total": 16, "used": 0 })
}

fn recount_licenses(w: &mut World, manager: &MoRef) -> Result<()> {
    let mut licenses = w.prop(manager, "licenses").unwrap_or(json!([]));
    if let Value::Array(items) = &mut licenses {
        for item in items.iter_mut() {
            let key = item.str_at("licenseKey").unwrap_or_default().to_string();
            let used = w.assignments.values().filter(|k| **k == key).count();
            item["used"] = json!(used);
        }
    }
    w.set_prop(manager, "licenses", licenses)
}

fn add_license(w: &mut World, manager: &MoRef, key: &str) -> Result<Value> {
    let mut licenses = w.prop(manager, "licenses").unwrap_or(json!([]));
    let existing = licenses.list_at("").into_iter().find(|l| l.str_at("licenseKey") == Some(key)).cloned();
    if let Some(found) = existing {
        return Ok(found);
    }
    let info = license_info(key);
    if let Value::Array(items) = &mut licenses {
        items.push(info.clone());
    }
    w.set_prop(manager, "licenses", licenses)?;
    Ok(info)
}

fn remove_license(w: &mut World, manager: &MoRef, key: &str) -> Result<Value> {
    if w.assignments.values().any(|k| k == key) {
        return Err(fault("ResourceInUse", format!("license {key} is in use")));
    }
    let mut licenses = w.prop(manager, "licenses").unwrap_or(json!([]));
    if let Value::Array(items) = &mut licenses {
        items.retain(|l| l.str_at("licenseKey") != Some(key));
    }
    w.set_prop(manager, "licenses", licenses)?;
    Ok(Value::Null)
}

fn query_assigned(w: &World, args: &Value) -> Result<Value> {
    let manager = license_manager(w)?;
    let licenses = w.prop(&manager, "licenses").unwrap_or(json!([]));
    let entities: Vec<String> = match args.str_at("entityId") {
        Some(e) => vec![e.to_string()],
        None => w.assignments.keys().cloned().collect(),
    };
    let out = entities
        .into_iter()
        .map(|entity| {
            let key = w.assignments.get(&entity).cloned().unwrap_or_else(|| EVAL_LICENSE.to_string());
            let info = licenses
                .list_at("")
                .into_iter()
                .find(|l| l.str_at("licenseKey") == Some(key.as_str()))
                .cloned()
                .unwrap_or_else(|| license_info(&key));
            json!({ "entityId": entity, "assignedLicense": info })
        })
        .collect();
    Ok(Value::Array(out))
}

fn update_assigned(w: &mut World, args: &Value) -> Result<Value> {
    let manager = license_manager(w)?;
    let entity = str_arg(args, "entity")?.to_string();
    let key = str_arg(args, "licenseKey")?.to_string();
    let known = w
        .prop(&manager, "licenses")
        .map(|l| l.list_at("").into_iter().any(|l| l.str_at("licenseKey") == Some(key.as_str())))
        .unwrap_or(false);
    if !known && key != EVAL_LICENSE {
        return Err(fault("LicenseEntityNotFound", format!("license {key} is not installed")));
    }
    w.assignments.insert(entity, key.clone());
    recount_licenses(w, &manager)?;
    Ok(license_info(&key))
}

fn role_exists(w: &World, manager: &MoRef, role_id: i64) -> bool {
    w.prop(manager, "roleList")
        .map(|roles| roles.list_at("").into_iter().any(|r| r.i64_at("roleId") == Some(role_id)))
        .unwrap_or(false)
}

fn set_permissions(w: &mut World, manager: &MoRef, args: &Value) -> Result<Value> {
    let entity = moref_arg(args, "entity")?;
    w.require(&entity)?;
    let wanted: Vec<Value> = args.list_at("permission").into_iter().cloned().collect();
    for p in &wanted {
        let role = p.i64_at("roleId").unwrap_or_default();
        if !role_exists(w, manager, role) {
            return Err(fault("InvalidArgument", format!("role {role} does not exist")));
        }
    }
    let stored = w.permissions.entry(entity.value.clone()).or_default();
    for p in wanted {
        let principal = p.str_at("principal").unwrap_or_default().to_string();
        let group = p.bool_at("group").unwrap_or(false);
        let mut record = json!({
            "entity": entity.to_value(),
            "principal": principal,
            "group": group,
            "roleId": p.i64_at("roleId"),
            "propagate": p.bool_at("propagate").unwrap_or(false),
        });
        match stored.iter_mut().find(|s| {
            s.str_at("principal").is_some_and(|x| x.eq_ignore_ascii_case(&principal))
                && s.bool_at("group") == Some(group)
        }) {
            Some(slot) => {
                record["principal"] = slot["principal"].clone();
                *slot = record;
            }
            None => stored.push(record),
        }
    }
    Ok(Value::Null)
}

fn remove_permission(w: &mut World, args: &Value) -> Result<Value> {
    let entity = moref_arg(args, "entity")?;
    let user = str_arg(args, "user")?.to_string();
    let group = args.bool_at("isGroup").unwrap_or(false);
    let stored = w.permissions.entry(entity.value.clone()).or_default();
    let before = stored.len();
    stored.retain(|s| {
        !(s.str_at("principal").is_some_and(|x| x.eq_ignore_ascii_case(&user)) && s.bool_at("group") == Some(group))
    });
    if stored.len() == before {
        return Err(fault("NotFound", format!("no permission for {user} on {entity}")));
    }
    Ok(Value::Null)
}

fn datastore_by_uuid(w: &World, uuid: &str) -> Option<MoRef> {
    w.objects
        .iter()
        .find(|o| o.moref.kind == "Datastore" && o.props.str_at("info.vmfs.uuid") == Some(uuid))
        .map(|o| o.moref.clone())
}

fn set_mounted(w: &mut World, storage: &MoRef, uuid: &str, mounted: bool) -> Result<Value> {
    let host = owner_host(w, storage)?;
    let ds = datastore_by_uuid(w, uuid).ok_or_else(|| fault("NotFound", format!("no VMFS volume {uuid}")))?;
    let mut mounts = w.prop(&ds, "host").unwrap_or(json!([]));
    let entry = match &mut mounts {
        Value::Array(items) => items.iter_mut().find(|m| m.moref_at("key").as_ref() == Some(&host)),
        _ => None,
    };
    let Some(entry) = entry else {
        return Err(fault("NotFound", format!("volume {uuid} is not attached to {host}")));
    };
    if entry.bool_at("mountInfo.mounted") == Some(mounted) {
        let state = if mounted { "mounted" } else { "unmounted" };
        return Err(fault("InvalidState", format!("volume {uuid} is already {state}")));
    }
    entry["mountInfo"]["mounted"] = json!(mounted);
    entry["mountInfo"]["accessible"] = json!(mounted);
    w.set_prop(&ds, "host", mounts)?;
    w.set_prop(&ds, "summary.accessible", json!(mounted))?;
    Ok(Value::Null)
}

fn resolve_volumes(w: &mut World, storage: &MoRef, args: &Value) -> Result<Value> {
    let host = owner_host(w, storage)?;
    let volumes = w.prop(storage, "unresolvedVolume").unwrap_or(json!([]));
    let mut remaining: Vec<Value> = volumes.list_at("").into_iter().cloned().collect();
    let mut results = Vec::new();
    for spec in args.list_at("resolutionSpec") {
        let paths: BTreeSet<&str> = spec.list_at("extentDevicePath").into_iter().filter_map(Value::as_str).collect();
        let idx = remaining.iter().position(|v| {
            v.list_at("extent").into_iter().filter_map(|e| e.str_at("devicePath")).any(|p| paths.contains(p))
        });
        let Some(idx) = idx else {
            return Err(fault("NotFound", "no unresolved volume matches the extents"));
        };
        let volume = remaining.remove(idx);
        let label = volume.str_at("vmfsLabel").unwrap_or_default().to_string();
        let uuid = volume.str_at("vmfsUuid").unwrap_or_default().to_string();
        let folder = datastore_folder_of(w, &host);
        let ds = w.insert(
            "Datastore",
            None,
            datastore_props(&label, &uuid, folder.as_ref(), &[host.clone()]),
        );
        attach_datastore(w, &host, &ds)?;
        results.push(json!({ "vmfs": { "name": label, "uuid": uuid }, "datastore": ds.to_value() }));
    }
    w.set_prop(storage, "unresolvedVolume", Value::Array(remaining))?;
    Ok(Value::Array(results))
}

pub(crate) fn datastore_props(name: &str, uuid: &str, folder: Option<&MoRef>, hosts: &[MoRef]) -> Value {
    let mounts: Vec<Value> = hosts
        .iter()
        .map(|h| json!({ "key": h.to_value(), "mountInfo": { "mounted": true, "accessible": true } }))
        .collect();
    json!({
        "name": name,
        "parent": folder.map(MoRef::to_value),
        "summary": { "name": name, "type": "VMFS", "accessible": true, "capacity": 1099511627776i64 },
        "info": { "name": name, "vmfs": { "name": name, "uuid": uuid } },
        "host": mounts,
        "iormConfiguration": {
            "enabled": false,
            "congestionThresholdMode": "automatic",
            "percentOfPeakThroughput": 90,
            "congestionThreshold": 30,
            "statsCollectionEnabled": false,
        },
    })
}

pub(crate) fn attach_datastore(w: &mut World, host: &MoRef, ds: &MoRef) -> Result<()> {
    let mut list = w.prop(host, "datastore").unwrap_or(json!([]));
    if let Value::Array(items) = &mut list {
        items.push(ds.to_value());
    }
    w.set_prop(host, "datastore", list)
}

/// The datastore folder of the datacenter a host lives in.
fn datastore_folder_of(w: &World, host: &MoRef) -> Option<MoRef> {
    let mut cur = w.parent_of(&host.value);
    while let Some(moid) = cur {
        let obj = w.object(&moid)?;
        if obj.moref.kind == "Datacenter" {
            return w.child_named(&moid, "datastore").map(|o| o.moref.clone());
        }
        cur = w.parent_of(&moid);
    }
    None
}

fn update_hba(w: &mut World, host: &MoRef, device: &str, f: impl FnOnce(&mut Value)) -> Result<()> {
    let mut hbas = w.prop(host, "config.storageDevice.hostBusAdapter").unwrap_or(json!([]));
    let found = match &mut hbas {
        Value::Array(items) => items.iter_mut().find(|h| h.str_at("device") == Some(device)),
        _ => None,
    };
    match found {
        Some(hba) => f(hba),
        None => return Err(fault("NotFound", format!("no host bus adapter {device}"))),
    }
    w.set_prop(host, "config.storageDevice.hostBusAdapter", hbas)
}

fn software_iscsi(w: &mut World, storage: &MoRef, args: &Value) -> Result<Value> {
    let host = owner_host(w, storage)?;
    let enabled = args.bool_at("enabled").unwrap_or(false);
    w.set_prop(&host, "config.storageDevice.softwareInternetScsiEnabled", json!(enabled))?;
    let mut hbas = w.prop(&host, "config.storageDevice.hostBusAdapter").unwrap_or(json!([]));
    if let Value::Array(items) = &mut hbas {
        let has_iscsi = items.iter().any(|h| h.type_name() == Some("HostInternetScsiHba"));
        if enabled && !has_iscsi {
            let name = w.prop(&host, "name").and_then(|n| n.as_str().map(str::to_string)).unwrap_or_default();
            items.push(json!({
                "_type": "HostInternetScsiHba",
                "device": "vmhba65",
                "model": "iSCSI Software Adapter",
                "isSoftwareBased": true,
                "iScsiName": format!("iqn.1998-01.com.vmware:{name}"),
                "configuredSendTarget": [],
            }));
        } else if !enabled {
            items.retain(|h| h.type_name() != Some("HostInternetScsiHba"));
        }
    }
    w.set_prop(&host, "config.storageDevice.hostBusAdapter", hbas)?;
    Ok(Value::Null)
}

fn send_targets(w: &mut World, storage: &MoRef, args: &Value, add: bool) -> Result<Value> {
    let host = owner_host(w, storage)?;
    let device = str_arg(args, "iScsiHbaDevice")?.to_string();
    let targets: Vec<(String, i64)> = args
        .list_at("targets")
        .into_iter()
        .map(|t| (t.str_at("address").unwrap_or_default().to_string(), t.i64_at("port").unwrap_or(3260)))
        .collect();
    update_hba(w, &host, &device, |hba| {
        let mut current: Vec<Value> = hba.list_at("configuredSendTarget").into_iter().cloned().collect();
        let same = |v: &Value, (addr, port): &(String, i64)| {
            v.str_at("address") == Some(addr.as_str()) && v.i64_at("port").unwrap_or(3260) == *port
        };
        for t in &targets {
            if add {
                if !current.iter().any(|c| same(c, t)) {
                    current.push(json!({ "address": t.0, "port": t.1 }));
                }
            } else {
                current.retain(|c| !same(c, t));
            }
        }
        hba["configuredSendTarget"] = Value::Array(current);
    })?;
    Ok(Value::Null)
}

fn update_service(w: &mut World, system: &MoRef, id: &str, f: impl FnOnce(&mut Value)) -> Result<Value> {
    let host = owner_host(w, system)?;
    let mut services = w.prop(&host, "config.service.service").unwrap_or(json!([]));
    let found = match &mut services {
        Value::Array(items) => items.iter_mut().find(|s| s.str_at("key") == Some(id)),
        _ => None,
    };
    match found {
        Some(s) => f(s),
        None => return Err(fault("NotFound", format!("service '{id}' does not exist"))),
    }
    w.set_prop(&host, "config.service.service", services)?;
    Ok(Value::Null)
}

fn update_ruleset(w: &mut World, system: &MoRef, id: &str, f: impl FnOnce(&mut Value)) -> Result<Value> {
    let host = owner_host(w, system)?;
    let mut rulesets = w.prop(&host, "config.firewall.ruleset").unwrap_or(json!([]));
    let found = match &mut rulesets {
        Value::Array(items) => items.iter_mut().find(|r| r.str_at("key") == Some(id)),
        _ => None,
    };
    match found {
        Some(r) => f(r),
        None => return Err(fault("NotFound", format!("ruleset '{id}' does not exist"))),
    }
    w.set_prop(&host, "config.firewall.ruleset", rulesets)?;
    Ok(Value::Null)
}

fn update_passthru(w: &mut World, system: &MoRef, args: &Value) -> Result<Value> {
    let host = owner_host(w, system)?;
    let mut infos = w.prop(&host, "config.pciPassthruInfo").unwrap_or(json!([]));
    for cfg in args.list_at("config") {
        let id = cfg.str_at("id").unwrap_or_default();
        let entry = match &mut infos {
            Value::Array(items) => items.iter_mut().find(|i| i.str_at("id") == Some(id)),
            _ => None,
        };
        let Some(entry) = entry else {
            return Err(fault("NotFound", format!("PCI device {id} does not exist")));
        };
        match cfg.type_name() {
            Some("HostSriovConfig") => {
                if entry.type_name() != Some("HostSriovInfo") {
                    return Err(fault("NotSupported", format!("{id} is not SR-IOV capable")));
                }
                let n = cfg.i64_at("numVirtualFunction").unwrap_or(0);
                entry["sriovEnabled"] = json!(cfg.bool_at("sriovEnabled").unwrap_or(false));
                entry["numVirtualFunctionRequested"] = json!(n);
                entry["numVirtualFunction"] = json!(n);
            }
            _ => {
                if entry.bool_at("passthruCapable") != Some(true) {
                    return Err(fault("NotSupported", format!("{id} does not support passthrough")));
                }
                entry["passthruEnabled"] = json!(cfg.bool_at("passthruEnabled").unwrap_or(false));
            }
        }
    }
    w.set_prop(&host, "config.pciPassthruInfo", infos)?;
    Ok(Value::Null)
}

fn answer(w: &mut World, vm: &MoRef, args: &Value) -> Result<Value> {
    let question = w
        .prop(vm, "runtime.question")
        .ok_or_else(|| fault("InvalidArgument", "the virtual machine has no pending question"))?;
    let qid = str_arg(args, "questionId")?;
    if question.str_at("id") != Some(qid) {
        return Err(fault("InvalidArgument", format!("question {qid} is not pending")));
    }
    let choice = str_arg(args, "answerChoice")?;
    let valid = question
        .list_at("choice.choiceInfo")
        .into_iter()
        .any(|c| c.str_at("key") == Some(choice));
    if !valid {
        return Err(fault("InvalidArgument", format!("'{choice}' is not a valid answer")));
    }
    let o = w.require_mut(vm)?;
    if let Value::Object(runtime) = &mut o.props["runtime"] {
        runtime.remove("question");
    }
    let mut answered = w.prop(vm, "sim.answers").unwrap_or(json!([]));
    if let Value::Array(items) = &mut answered {
        items.push(json!(choice));
    }
    w.set_prop(vm, "sim.answers", answered)?;
    if let Some(task) = w.pending_power_on.remove(&vm.value) {
        w.set_prop(vm, "runtime.powerState", json!("poweredOn"))?;
        w.complete_task(&task, Value::Null)?;
    }
    Ok(Value::Null)
}

/// Default properties of a new host and its managers.
pub(crate) fn host_props(name: &str, parent: &MoRef, uuid: &str, managers: &Map<String, Value>) -> Value {
    json!({
        "name": name,
        "parent": parent.to_value(),
        "runtime": { "powerState": "poweredOn", "inMaintenanceMode": false, "connectionState": "connected" },
        "summary": { "config": { "name": name } },
        "hardware": {
            "systemInfo": { "uuid": uuid, "vendor": "Dell Inc.", "model": "PowerEdge R650" },
            "pciDevice": [
                { "id": "0000:3b:00.0", "deviceName": "Ethernet Controller X710", "vendorName": "Intel Corporation" },
                { "id": "0000:af:00.0", "deviceName": "NVIDIA A40", "vendorName": "NVIDIA Corporation" },
            ],
        },
        "configManager": managers,
        "config": {
            "lockdownMode": "lockdownDisabled",
            "network": { "pnic": [
                { "device": "vmnic0", "pci": "0000:18:00.0", "mac": "3c:ec:ef:00:00:01" },
                { "device": "vmnic4", "pci": "0000:3b:00.0", "mac": "3c:ec:ef:00:00:05" },
            ]},
            "service": { "service": [
                { "key": "TSM-SSH", "label": "SSH", "running": false, "policy": "off", "required": false },
                { "key": "ntpd", "label": "NTP Daemon", "running": true, "policy": "on", "required": false },
                { "key": "TSM", "label": "ESXi Shell", "running": false, "policy": "off", "required": false },
            ]},
            "firewall": { "ruleset": [
                { "key": "sshServer", "label": "SSH Server", "enabled": true, "required": false,
                  "allowedHosts": { "allIp": true, "ipAddress": [], "ipNetwork": [] } },
                { "key": "nfsClient", "label": "NFS Client", "enabled": false, "required": false,
                  "allowedHosts": { "allIp": true, "ipAddress": [], "ipNetwork": [] } },
                { "key": "CIMHttpServer", "label": "CIM Server", "enabled": true, "required": false,
                  "allowedHosts": { "allIp": true, "ipAddress": [], "ipNetwork": [] } },
            ]},
            "storageDevice": {
                "softwareInternetScsiEnabled": false,
                "hostBusAdapter": [
                    { "_type": "HostBlockHba", "device": "vmhba0", "model": "PERC H755" },
                ],
            },
            "pciPassthruInfo": [
                { "_type": "HostSriovInfo", "id": "0000:3b:00.0", "sriovCapable": true, "sriovEnabled": false,
                  "sriovActive": false, "numVirtualFunction": 0, "numVirtualFunctionRequested": 0,
                  "maxVirtualFunctionSupported": 63, "passthruCapable": true, "passthruEnabled": false },
                { "_type": "HostPciPassthruInfo", "id": "0000:af:00.0", "passthruCapable": true,
                  "passthruEnabled": false, "passthruActive": false },
            ],
        },
        "datastore": [],
        "vm": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_options_by_key() {
        let mut base = json!({
            "enabled": false,
            "option": [{ "key": "a", "value": "1" }, { "key": "b", "value": "2" }]
        });
        merge(
            &mut base,
            &json!({ "_type": "ClusterDrsConfigInfo", "enabled": true, "option": [{ "key": "b", "value": "3" }] }),
        );
        assert_eq!(base["enabled"], true);
        assert!(base.get("_type").is_none());
        let options = base.list_at("option");
        assert_eq!(options.len(), 2);
        assert_eq!(options[1]["value"], "3");
    }
}
