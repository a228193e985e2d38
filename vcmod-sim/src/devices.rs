//! `ReconfigVM_Task` device changes.

use std::collections::HashMap;

use serde_json::{Value, json};
use vcmod_core::builders::vm_devices::{ControllerType, device_key};
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{Error, Result};

use crate::world::{World, fault};

/// Device types that can only be added or removed while powered off.
const COLD_ONLY: &[&str] = &["VirtualTPM", "VirtualPCIPassthrough"];

fn invalid_spec(message: impl Into<String>) -> Error {
    fault("InvalidDeviceSpec", message)
}

fn is_controller(device: &Value) -> bool {
    ControllerType::of_device(device).is_some()
}

pub(crate) fn reconfigure(w: &mut World, vm: &MoRef, spec: &Value) -> Result<()> {
    let obj = w.require(vm)?;
    let power = obj.props.str_at("runtime.powerState").unwrap_or("poweredOff").to_string();
    let name = obj.props.str_at("name").unwrap_or_default().to_string();
    let mut devices: Vec<Value> = obj.props.list_at("config.hardware.device").into_iter().cloned().collect();

    let mut next_key = devices.iter().filter_map(device_key).max().unwrap_or(0).max(16000) + 1;
    let mut temp_keys: HashMap<i64, i64> = HashMap::new();
    let disks_before = devices.iter().filter(|d| d.type_name() == Some("VirtualDisk")).count();
    let mut new_disks = 0;

    for change in spec.list_at("deviceChange") {
        let operation = change.str_at("operation").unwrap_or_default();
        let mut device = change
            .at("device")
            .cloned()
            .ok_or_else(|| invalid_spec("device change without a device"))?;
        let kind = device.type_name().unwrap_or_default().to_string();
        if COLD_ONLY.contains(&kind.as_str()) && operation != "edit" && power != "poweredOff" {
            return Err(fault(
                "InvalidPowerState",
                format!("{kind} changes require the virtual machine to be powered off ({power})"),
            ));
        }

        if let Some(ck) = device.i64_at("controllerKey")
            && ck < 0
        {
            let real = temp_keys
                .get(&ck)
                .copied()
                .ok_or_else(|| invalid_spec(format!("unknown controller key {ck}")))?;
            device["controllerKey"] = json!(real);
        }

        match operation {
            "add" => {
                let key = next_key;
                next_key += 1;
                if let Some(temp) = device_key(&device) {
                    temp_keys.insert(temp, key);
                }
                device["key"] = json!(key);
                if let Some(ck) = device.i64_at("controllerKey") {
                    if !devices.iter().any(|d| device_key(d) == Some(ck) && is_controller(d)) {
                        return Err(invalid_spec(format!("controller {ck} does not exist")));
                    }
                    let unit = device.i64_at("unitNumber");
                    if unit.is_some()
                        && devices
                            .iter()
                            .any(|d| d.i64_at("controllerKey") == Some(ck) && d.i64_at("unitNumber") == unit)
                    {
                        return Err(invalid_spec(format!(
                            "unit {} on controller {ck} is already in use",
                            unit.unwrap_or_default()
                        )));
                    }
                }
                if is_controller(&device) {
                    let bus = device.i64_at("busNumber");
                    let bus_kind = ControllerType::of_device(&device).map(|c| c.bus());
                    let clash = devices.iter().any(|d| {
                        ControllerType::of_device(d).map(|c| c.bus()) == bus_kind && d.i64_at("busNumber") == bus
                    });
                    if clash {
                        return Err(invalid_spec(format!(
                            "a {kind} on bus {} already exists",
                            bus.unwrap_or_default()
                        )));
                    }
                }
                if kind == "VirtualDisk" && change.str_at("fileOperation") == Some("create") {
                    new_disks += 1;
                    let index = disks_before + new_disks - 1;
                    device["backing"]["fileName"] = json!(format!("[datastore1] {name}/{name}_{index}.vmdk"));
                }
                if device.str_at("addressType") == Some("generated") {
                    device["macAddress"] = json!(format!("00:50:56:{:02x}:{:02x}:{:02x}", (key >> 16) & 0xff, (key >> 8) & 0xff, key & 0xff));
                }
                devices.push(device);
            }
            "edit" => {
                let key = device_key(&device).ok_or_else(|| invalid_spec("edit without a device key"))?;
                let slot = devices
                    .iter_mut()
                    .find(|d| device_key(d) == Some(key))
                    .ok_or_else(|| invalid_spec(format!("device {key} does not exist")))?;
                if kind == "VirtualDisk"
                    && device.i64_at("capacityInKB") < slot.i64_at("capacityInKB")
                {
                    return Err(invalid_spec("virtual disks cannot be shrunk"));
                }
                *slot = device;
            }
            "remove" => {
                let key = device_key(&device).ok_or_else(|| invalid_spec("remove without a device key"))?;
                if !devices.iter().any(|d| device_key(d) == Some(key)) {
                    return Err(invalid_spec(format!("device {key} does not exist")));
                }
                if devices.iter().any(|d| d.i64_at("controllerKey") == Some(key)) {
                    return Err(invalid_spec(format!("controller {key} still has devices attached")));
                }
                devices.retain(|d| device_key(d) != Some(key));
            }
            other => return Err(invalid_spec(format!("unknown operation '{other}'"))),
        }
    }

    w.set_prop(vm, "config.hardware.device", Value::Array(devices))
}

/// The devices a new VM starts with.
pub(crate) fn default_devices(vm_name: &str) -> Value {
    json!([
        { "_type": "VirtualIDEController", "key": 200, "busNumber": 0, "deviceInfo": { "label": "IDE 0" } },
        { "_type": "VirtualIDEController", "key": 201, "busNumber": 1, "deviceInfo": { "label": "IDE 1" } },
        { "_type": "ParaVirtualSCSIController", "key": 1000, "busNumber": 0, "sharedBus": "noSharing",
          "deviceInfo": { "label": "SCSI controller 0" } },
        { "_type": "VirtualDisk", "key": 2000, "controllerKey": 1000, "unitNumber": 0,
          "capacityInKB": 16777216,
          "deviceInfo": { "label": "Hard disk 1" },
          "backing": { "_type": "VirtualDiskFlatVer2BackingInfo",
                       "fileName": format!("[datastore1] {vm_name}/{vm_name}.vmdk"),
                       "diskMode": "persistent", "thinProvisioned": true } },
        { "_type": "VirtualVmxnet3", "key": 4000, "macAddress": "00:50:56:aa:bb:01", "addressType": "assigned",
          "deviceInfo": { "label": "Network adapter 1" },
          "backing": { "_type": "VirtualEthernetCardNetworkBackingInfo", "deviceName": "VM Network" },
          "connectable": { "startConnected": true, "connected": true, "allowGuestControl": true } },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcmod_core::builders::vm_devices::{self as dev, Bus, ControllerType, DiskSpec, Provisioning};

    fn world() -> (World, MoRef) {
        let mut w = World::default();
        let vm = w.insert(
            "VirtualMachine",
            Some("vm-42"),
            json!({
                "name": "web",
                "runtime": { "powerState": "poweredOff" },
                "config": { "hardware": { "device": default_devices("web") } }
            }),
        );
        (w, vm)
    }

    fn devices(w: &World, vm: &MoRef) -> Vec<Value> {
        w.prop(vm, "config.hardware.device").unwrap().as_array().unwrap().clone()
    }

    #[test]
    fn test_disk_on_new_controller_resolves_temp_key() {
        let (mut w, vm) = world();
        let mut keys = dev::TempKeys::new();
        let ck = keys.next(dev::DeviceClass::Controller);
        let controller = dev::controller(ControllerType::Paravirtual, 1, ck).unwrap();
        let disk = dev::disk(
            &DiskSpec {
                size_kb: 1024,
                controller_key: ck,
                unit: 0,
                provisioning: Provisioning::Thin,
                mode: "persistent".into(),
                datastore: None,
            },
            Bus::Scsi,
            keys.next(dev::DeviceClass::Disk),
        )
        .unwrap();
        let spec = dev::config_spec(vec![dev::add(controller), dev::add_with_file(disk)]);
        reconfigure(&mut w, &vm, &spec).unwrap();

        let all = devices(&w, &vm);
        let new_controller = all
            .iter()
            .find(|d| d.type_name() == Some("ParaVirtualSCSIController") && d.i64_at("busNumber") == Some(1))
            .unwrap();
        let new_disk = all.last().unwrap();
        assert_eq!(new_disk.i64_at("controllerKey"), device_key(new_controller));
        assert_eq!(new_disk.str_at("backing.fileName"), Some("[datastore1] web/web_1.vmdk"));
    }

    #[test]
    fn test_occupied_unit_is_rejected() {
        let (mut w, vm) = world();
        let disk = json!({ "_type": "VirtualDisk", "key": -200, "controllerKey": 1000, "unitNumber": 0, "capacityInKB": 1 });
        let err = reconfigure(&mut w, &vm, &dev::config_spec(vec![dev::add(disk)])).unwrap_err();
        assert_eq!(err.fault().unwrap().name, "InvalidDeviceSpec");
        assert_eq!(devices(&w, &vm).len(), 5);
    }

    #[test]
    fn test_tpm_requires_power_off() {
        let (mut w, vm) = world();
        w.set_prop(&vm, "runtime.powerState", json!("poweredOn")).unwrap();
        let err = reconfigure(&mut w, &vm, &dev::config_spec(vec![dev::add(dev::tpm(-500))])).unwrap_err();
        assert_eq!(err.fault().unwrap().name, "InvalidPowerState");
    }

    #[test]
    fn test_controller_with_devices_cannot_be_removed() {
        let (mut w, vm) = world();
        let controller = devices(&w, &vm)[2].clone();
        let err = reconfigure(&mut w, &vm, &dev::config_spec(vec![dev::remove(controller, false)])).unwrap_err();
        assert_eq!(err.fault().unwrap().name, "InvalidDeviceSpec");
    }
}
