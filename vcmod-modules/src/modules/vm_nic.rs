//! Network adapters on standard networks or distributed port groups.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::vm_devices::{self as dev, DeviceClass, NicNetwork, NicSpec, NicType, TempKeys};
use vcmod_core::diff::{CompareRules, Diff, changed_fields};
use vcmod_core::inventory::{By, Scope};
use vcmod_core::value::{Kind, ValueExt};
use vcmod_core::{ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result, State};

use crate::common;

pub struct VmNic;

/// Network identity of a NIC: a network name or a port group key.
fn backing_id(device: &Value) -> Option<&str> {
    device
        .str_at("backing.port.portgroupKey")
        .or_else(|| device.str_at("backing.deviceName"))
}

fn nic_view(device: &Value) -> Value {
    json!({
        "device_type": NicType::of_device(device).map(|t| t.name()),
        "network": backing_id(device),
        "mac_address": device.str_at("macAddress"),
        "connected": device.bool_at("connectable.startConnected").unwrap_or(false),
    })
}

fn result_view(device: &Value) -> Value {
    let mut view = nic_view(device);
    view["label"] = json!(device.str_at("deviceInfo.label"));
    view["key"] = json!(dev::device_key(device));
    view
}

fn network_id(network: &NicNetwork) -> &str {
    match network {
        NicNetwork::Standard { name, .. } => name,
        NicNetwork::Distributed { portgroup_key, .. } => portgroup_key,
    }
}

/// A distributed port group of that name wins over a standard network.
async fn lookup_network(ctx: &Context, params: &Params, name: &str) -> Result<NicNetwork> {
    let scope = Scope {
        datacenter: params.string("datacenter"),
        ..Scope::default()
    };
    let by = By::Name(name.to_string());
    let name_match = common::name_match(params)?;
    if let Some(pg) = ctx
        .resolver()
        .find_optional(Kind::DistributedVirtualPortgroup, &by, &scope, name_match)
        .await?
    {
        let props = ctx
            .properties(&pg.moref(), &["key", "config.distributedVirtualSwitch"])
            .await?;
        let dvs = props.moref_at("config.distributedVirtualSwitch").ok_or_else(|| {
            Error::NotFound(format!("port group '{name}' has no distributed switch"))
        })?;
        let switch = ctx.properties(&dvs, &["uuid"]).await?;
        return Ok(NicNetwork::Distributed {
            switch_uuid: switch.str_at("uuid").unwrap_or_default().to_string(),
            portgroup_key: props.str_at("key").unwrap_or(pg.moid.as_str()).to_string(),
        });
    }
    let network = ctx.resolver().find(Kind::Network, &by, &scope, name_match).await?;
    Ok(NicNetwork::Standard {
        name: name.to_string(),
        network: network.moref(),
    })
}

fn is_nic(device: &Value) -> bool {
    NicType::of_device(device).is_some()
}

#[async_trait]
impl Module for VmNic {
    fn name(&self) -> &'static str {
        "vm_nic"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::vm_params() {
            spec = spec.param(p);
        }
        spec.param(Param::str("network_name").doc("standard network or distributed port group"))
            .param(
                Param::str("device_type")
                    .choices(&["pcnet32", "vmxnet2", "vmxnet3", "e1000", "e1000e", "sriov"])
                    .default("vmxnet3"),
            )
            .param(Param::str("mac_address"))
            .param(Param::str("label").doc("existing adapter, e.g. 'Network adapter 1'"))
            .param(Param::bool("connected").default(true))
            .param(Param::str("physical_function").doc("PCI id backing an SR-IOV adapter"))
            .param(common::state_param())
            .required_if("state", "present", &["network_name"])
            .required_if("device_type", "sriov", &["physical_function"])
            .required_one_of(&["name", "uuid", "moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let present = common::state(params)? == State::Present;
        let mac = params.string("mac_address");
        if let Some(m) = &mac {
            dev::validate_mac(m)?;
        }
        let label = params.str("label");
        if !present && mac.is_none() && label.is_none() {
            return Err(Error::InvalidArgument(
                "one of the following is required to remove an adapter: mac_address, label".to_string(),
            ));
        }

        let vm = common::vm(ctx, params).await?;
        let devices = common::vm_devices(ctx, &vm).await?;
        let nics: Vec<&Value> = devices.iter().filter(|d| is_nic(d)).collect();

        let network = match params.str("network_name") {
            Some(name) if present => Some(lookup_network(ctx, params, name).await?),
            _ => None,
        };
        let existing = nics.iter().copied().find(|d| match (&mac, label, &network) {
            (Some(m), _, _) => d.str_at("macAddress").is_some_and(|x| x.eq_ignore_ascii_case(m)),
            (None, Some(l), _) => d.str_at("deviceInfo.label") == Some(l),
            (None, None, Some(n)) => backing_id(d) == Some(network_id(n)),
            (None, None, None) => false,
        });
        if label.is_some() && mac.is_none() && existing.is_none() && present {
            return Err(Error::NotFound(format!(
                "virtual machine {} has no adapter labelled '{}'",
                vm.display_name(),
                label.unwrap_or_default()
            )));
        }

        let mut changes = Vec::new();
        let diff = match (present, existing, network) {
            (true, found, Some(network)) => {
                let spec = NicSpec {
                    kind: NicType::parse(params.str("device_type").unwrap_or("vmxnet3"))?,
                    mac: mac.clone().or_else(|| found.and_then(|d| d.str_at("macAddress")).map(str::to_string)),
                    connected: params.bool("connected").unwrap_or(true),
                    physical_function: params.string("physical_function"),
                    network,
                };
                let want = json!({
                    "device_type": spec.kind.name(),
                    "network": network_id(&spec.network),
                    "mac_address": spec.mac,
                    "connected": spec.connected,
                });
                match found {
                    Some(device) => {
                        let have = nic_view(device);
                        let fields = changed_fields(&have, &want, &CompareRules::default().case_insensitive("mac_address"));
                        if fields.iter().any(|f| f == "device_type") {
                            // The adapter type of a device cannot be edited in place.
                            let key = TempKeys::new().next(DeviceClass::Nic);
                            changes.push(dev::remove(device.clone(), false));
                            changes.push(dev::add(dev::nic(&spec, key)?));
                        } else if !fields.is_empty() {
                            let mut edited = dev::nic(&spec, dev::device_key(device).unwrap_or_default())?;
                            for keep in ["controllerKey", "unitNumber", "deviceInfo"] {
                                if let Some(v) = device.get(keep) {
                                    edited[keep] = v.clone();
                                }
                            }
                            changes.push(dev::edit(edited));
                        }
                        Diff::from_changes(&have, &want, &fields)
                    }
                    None => {
                        let key = TempKeys::new().next(DeviceClass::Nic);
                        changes.push(dev::add(dev::nic(&spec, key)?));
                        Diff::created(&want)
                    }
                }
            }
            (false, Some(device), _) => {
                changes.push(dev::remove(device.clone(), false));
                Diff::deleted(&nic_view(device))
            }
            _ => Diff::empty(),
        };

        let changed = !changes.is_empty();
        ctx.record_diff(&diff);
        if changed && !ctx.check_mode() {
            info!(vm = %vm.display_name(), changes = changes.len(), "reconfiguring network adapters");
            common::reconfigure_vm(ctx, &vm, changes).await?;
        }

        let after = if changed && !ctx.check_mode() {
            common::vm_devices(ctx, &vm).await?
        } else {
            devices
        };
        let data: Vec<Value> = after.iter().filter(|d| is_nic(d)).map(result_view).collect();
        Ok(Outcome::changed(changed).with("network_data", data).with_diff(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_id_prefers_port_group() {
        let standard = json!({ "backing": { "deviceName": "VM Network" } });
        let distributed = json!({ "backing": { "port": { "portgroupKey": "dvportgroup-7" } } });
        assert_eq!(backing_id(&standard), Some("VM Network"));
        assert_eq!(backing_id(&distributed), Some("dvportgroup-7"));
    }
}
