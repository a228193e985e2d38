//! Virtual hard disks, addressed by controller and unit number.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::vm_devices::{self as dev, Bus, ControllerType, DeviceClass, DiskSpec, Provisioning, TempKeys};
use vcmod_core::diff::Diff;
use vcmod_core::inventory::{By, Scope};
use vcmod_core::value::{Kind, ValueExt};
use vcmod_core::{ArgType, ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result};

use crate::common;

pub struct VmDisk;

fn disk_options() -> Vec<Param> {
    vec![
        Param::str("size").doc("e.g. 10gb, 512mb; required when adding or growing"),
        Param::int("size_kb"),
        Param::str("type")
            .choices(&["thin", "thick", "eagerzeroedthick"])
            .default("thin"),
        Param::str("controller_type")
            .choices(&["lsilogic", "lsilogicsas", "buslogic", "paravirtual", "sata", "nvme"])
            .default("paravirtual"),
        Param::int("controller_number").default(0),
        Param::int("unit_number").required(),
        Param::str("datastore"),
        Param::str("disk_mode")
            .choices(&["persistent", "independent_persistent", "independent_nonpersistent"])
            .default("persistent"),
        Param::str("state").choices(&["present", "absent"]).default("present"),
        Param::bool("destroy").default(true).doc("delete the backing file on removal"),
    ]
}

/// Address of a disk slot, e.g. `scsi0:1`.
fn slot_label(bus: Bus, controller: i64, unit: i64) -> String {
    let prefix = match bus {
        Bus::Scsi => "scsi",
        Bus::Sata => "sata",
        Bus::Nvme => "nvme",
        Bus::Ide => "ide",
    };
    format!("{prefix}{controller}:{unit}")
}

fn disk_view(disk: &Value) -> Value {
    json!({
        "label": disk.str_at("deviceInfo.label"),
        "key": dev::device_key(disk),
        "unit_number": disk.i64_at("unitNumber"),
        "capacity_in_kb": disk.i64_at("capacityInKB"),
        "backing_filename": disk.str_at("backing.fileName"),
        "backing_thinprovisioned": disk.bool_at("backing.thinProvisioned"),
        "backing_diskmode": disk.str_at("backing.diskMode"),
    })
}

struct Request {
    bus: Bus,
    controller_type: ControllerType,
    controller_number: i64,
    unit: i64,
    size_kb: Option<i64>,
    provisioning: Provisioning,
    mode: String,
    datastore: Option<String>,
    present: bool,
    destroy: bool,
}

impl Request {
    fn parse(item: &Value) -> Result<Self> {
        let controller_type = ControllerType::parse(item.str_at("controller_type").unwrap_or("paravirtual"))?;
        let bus = controller_type.bus();
        let unit = item
            .i64_at("unit_number")
            .ok_or_else(|| Error::InvalidArgument("disk unit_number is required".to_string()))?;
        bus.check_unit(unit)?;
        let controller_number = item.i64_at("controller_number").unwrap_or(0);
        if !(0..bus.max_controllers()).contains(&controller_number) {
            return Err(Error::InvalidArgument(format!(
                "controller_number must be between 0 and {}",
                bus.max_controllers() - 1
            )));
        }
        let size_kb = match (item.str_at("size"), item.i64_at("size_kb")) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidArgument(
                    "parameters are mutually exclusive: size|size_kb".to_string(),
                ));
            }
            (Some(s), None) => Some(dev::parse_size_kb(s)?),
            (None, Some(kb)) if kb > 0 => Some(kb),
            (None, Some(kb)) => {
                return Err(Error::InvalidArgument(format!("disk size must be positive, got {kb}")));
            }
            (None, None) => None,
        };
        Ok(Self {
            bus,
            controller_type,
            controller_number,
            unit,
            size_kb,
            provisioning: Provisioning::parse(item.str_at("type").unwrap_or("thin"))?,
            mode: item.str_at("disk_mode").unwrap_or("persistent").to_string(),
            datastore: item.str_at("datastore").map(str::to_string),
            present: item.str_at("state") != Some("absent"),
            destroy: item.bool_at("destroy").unwrap_or(true),
        })
    }

    fn label(&self) -> String {
        slot_label(self.bus, self.controller_number, self.unit)
    }
}

/// One `ReconfigVM_Task` worth of disk changes.
struct Plan {
    keys: TempKeys,
    /// Controllers added by this plan, by bus and bus number.
    new_controllers: BTreeMap<(u8, i64), i64>,
    changes: Vec<Value>,
    diff: Diff,
}

fn bus_ord(bus: Bus) -> u8 {
    match bus {
        Bus::Scsi => 0,
        Bus::Sata => 1,
        Bus::Nvme => 2,
        Bus::Ide => 3,
    }
}

impl Plan {
    fn new() -> Self {
        Self {
            keys: TempKeys::new(),
            new_controllers: BTreeMap::new(),
            changes: Vec::new(),
            diff: Diff::empty(),
        }
    }

    /// Key of the controller for `req`, adding one when the bus is empty.
    fn controller_key(&mut self, devices: &[&Value], req: &Request) -> Result<i64> {
        if let Some(existing) = dev::find_controller(devices, req.bus, req.controller_number) {
            return dev::device_key(existing)
                .ok_or_else(|| Error::Internal("controller without a device key".to_string()));
        }
        let slot = (bus_ord(req.bus), req.controller_number);
        if let Some(key) = self.new_controllers.get(&slot) {
            return Ok(*key);
        }
        let key = self.keys.next(DeviceClass::Controller);
        self.changes
            .push(dev::add(dev::controller(req.controller_type, req.controller_number, key)?));
        self.new_controllers.insert(slot, key);
        Ok(key)
    }
}

#[async_trait]
impl Module for VmDisk {
    fn name(&self) -> &'static str {
        "vm_disk"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::vm_params() {
            spec = spec.param(p);
        }
        spec.param(Param::list("disk", ArgType::Dict).required().options(disk_options()))
            .required_one_of(&["name", "uuid", "moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let requests = params
            .list("disk")
            .iter()
            .map(Request::parse)
            .collect::<Result<Vec<_>>>()?;
        let vm = common::vm(ctx, params).await?;
        let devices = common::vm_devices(ctx, &vm).await?;
        let refs: Vec<&Value> = devices.iter().collect();

        let mut plan = Plan::new();
        for req in &requests {
            let label = req.label();
            let existing = dev::find_controller(&refs, req.bus, req.controller_number)
                .and_then(dev::device_key)
                .and_then(|ck| dev::device_at(&refs, ck, req.unit));
            if let Some(device) = existing
                && device.type_name() != Some("VirtualDisk")
            {
                return Err(Error::InvalidArgument(format!(
                    "{label} is occupied by a {}",
                    device.type_name().unwrap_or("device")
                )));
            }

            match (req.present, existing) {
                (true, Some(disk)) => {
                    let current = disk.i64_at("capacityInKB").unwrap_or(0);
                    let Some(want) = req.size_kb else { continue };
                    if want < current {
                        return Err(Error::InvalidArgument(format!(
                            "disk {label} cannot shrink from {current} KB to {want} KB"
                        )));
                    }
                    if want > current {
                        let mut grown = disk.clone();
                        grown["capacityInKB"] = json!(want);
                        plan.changes.push(dev::edit(grown));
                        common::diff_entry(&mut plan.diff, &label, json!({ "capacity_in_kb": current }), json!({ "capacity_in_kb": want }));
                    }
                }
                (true, None) => {
                    let size_kb = req.size_kb.ok_or_else(|| {
                        Error::InvalidArgument(format!("size is required to add disk {label}"))
                    })?;
                    let datastore = match &req.datastore {
                        Some(name) => Some(
                            ctx.resolver()
                                .find(
                                    Kind::Datastore,
                                    &By::Name(name.clone()),
                                    &Scope {
                                        datacenter: params.string("datacenter"),
                                        ..Scope::default()
                                    },
                                    common::name_match(params)?,
                                )
                                .await?
                                .moref(),
                        ),
                        None => None,
                    };
                    let controller_key = plan.controller_key(&refs, req)?;
                    let key = plan.keys.next(DeviceClass::Disk);
                    let disk = dev::disk(
                        &DiskSpec {
                            size_kb,
                            controller_key,
                            unit: req.unit,
                            provisioning: req.provisioning,
                            mode: req.mode.clone(),
                            datastore,
                        },
                        req.bus,
                        key,
                    )?;
                    plan.changes.push(dev::add_with_file(disk));
                    common::diff_entry(&mut plan.diff, &label, Value::Null, json!({ "capacity_in_kb": size_kb }));
                }
                (false, Some(disk)) => {
                    plan.changes.push(dev::remove(disk.clone(), req.destroy));
                    common::diff_entry(&mut plan.diff, &label, disk_view(disk), Value::Null);
                }
                (false, None) => {}
            }
        }

        let changed = !plan.changes.is_empty();
        ctx.record_diff(&plan.diff);
        if changed && !ctx.check_mode() {
            info!(vm = %vm.display_name(), changes = plan.changes.len(), "reconfiguring disks");
            common::reconfigure_vm(ctx, &vm, plan.changes).await?;
        }

        let after = if changed && !ctx.check_mode() {
            common::vm_devices(ctx, &vm).await?
        } else {
            devices
        };
        let disks: Vec<Value> = after
            .iter()
            .filter(|d| d.type_name() == Some("VirtualDisk"))
            .map(disk_view)
            .collect();
        Ok(Outcome::changed(changed)
            .with("disk_data", disks)
            .with_diff(plan.diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_rejects_reserved_scsi_unit() {
        let item = json!({ "unit_number": 7, "controller_type": "paravirtual", "size": "1gb" });
        assert!(Request::parse(&item).is_err());
    }

    #[test]
    fn test_request_size_forms() {
        let item = json!({ "unit_number": 1, "size": "2gb" });
        assert_eq!(Request::parse(&item).unwrap().size_kb, Some(2 * 1024 * 1024));
        let item = json!({ "unit_number": 1, "size": "2gb", "size_kb": 10 });
        assert!(Request::parse(&item).is_err());
        let item = json!({ "unit_number": 29, "controller_type": "sata" });
        assert_eq!(Request::parse(&item).unwrap().label(), "sata0:29");
    }
}
