//! CD-ROM drives on IDE or SATA controllers.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::vm_devices::{self as dev, CdromBacking, ControllerType, DeviceClass, TempKeys};
use vcmod_core::diff::{CompareRules, Diff, changed_fields};
use vcmod_core::value::ValueExt;
use vcmod_core::{ArgumentSpec, Context, Error, Module, Outcome, Param, Params, Result, State};

use crate::common;

pub struct VmCdrom;

fn cdrom_view(device: &Value) -> Value {
    let backing = CdromBacking::of_device(device);
    let iso = match &backing {
        CdromBacking::Iso(path) => Some(path.clone()),
        _ => None,
    };
    json!({
        "type": backing.name(),
        "iso_path": iso,
        "start_connected": device.bool_at("connectable.startConnected").unwrap_or(false),
    })
}

fn desired_view(backing: &CdromBacking, connected: bool) -> Value {
    let iso = match backing {
        CdromBacking::Iso(path) => Some(path.clone()),
        _ => None,
    };
    json!({
        "type": backing.name(),
        "iso_path": iso,
        "start_connected": connected && *backing != CdromBacking::None,
    })
}

#[async_trait]
impl Module for VmCdrom {
    fn name(&self) -> &'static str {
        "vm_cdrom"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::vm_params() {
            spec = spec.param(p);
        }
        spec.param(Param::str("controller_type").choices(&["ide", "sata"]).default("ide"))
            .param(Param::int("controller_number").default(0))
            .param(Param::int("unit_number").default(0))
            .param(Param::str("type").choices(&["none", "client", "iso"]).default("client"))
            .param(Param::str("iso_path").doc("datastore path, e.g. '[ds1] iso/os.iso'"))
            .param(Param::bool("start_connected").default(true))
            .param(common::state_param())
            .required_if("type", "iso", &["iso_path"])
            .required_one_of(&["name", "uuid", "moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let controller_type = ControllerType::parse(params.str("controller_type").unwrap_or("ide"))?;
        let bus = controller_type.bus();
        let controller_number = params.int("controller_number").unwrap_or(0);
        let unit = params.int("unit_number").unwrap_or(0);
        bus.check_unit(unit)?;
        let backing = CdromBacking::parse(params.str("type").unwrap_or("client"), params.str("iso_path"))?;
        let connected = params.bool("start_connected").unwrap_or(true);
        let present = common::state(params)? == State::Present;

        let vm = common::vm(ctx, params).await?;
        let devices = common::vm_devices(ctx, &vm).await?;
        let refs: Vec<&Value> = devices.iter().collect();
        let controller = dev::find_controller(&refs, bus, controller_number);
        let existing = controller
            .and_then(dev::device_key)
            .and_then(|ck| dev::device_at(&refs, ck, unit));
        if let Some(device) = existing
            && device.type_name() != Some("VirtualCdrom")
        {
            return Err(Error::InvalidArgument(format!(
                "{}{controller_number}:{unit} is occupied by a {}",
                controller_type.name(),
                device.type_name().unwrap_or("device")
            )));
        }

        let want = desired_view(&backing, connected);
        let mut changes = Vec::new();
        let diff = match (present, existing) {
            (true, Some(device)) => {
                let have = cdrom_view(device);
                let fields = changed_fields(&have, &want, &CompareRules::default());
                if !fields.is_empty() {
                    changes.push(dev::edit(dev::cdrom_rebacked(device, &backing, connected)));
                }
                Diff::from_changes(&have, &want, &fields)
            }
            (true, None) => {
                let mut keys = TempKeys::new();
                let controller_key = match controller.and_then(dev::device_key) {
                    Some(key) => key,
                    None => {
                        let key = keys.next(DeviceClass::Controller);
                        changes.push(dev::add(dev::controller(controller_type, controller_number, key)?));
                        key
                    }
                };
                let cdrom = dev::cdrom(
                    keys.next(DeviceClass::Cdrom),
                    controller_key,
                    unit,
                    bus,
                    &backing,
                    connected,
                )?;
                changes.push(dev::add(cdrom));
                Diff::created(&want)
            }
            (false, Some(device)) => {
                changes.push(dev::remove(device.clone(), false));
                Diff::deleted(&cdrom_view(device))
            }
            (false, None) => Diff::empty(),
        };

        let changed = !changes.is_empty();
        ctx.record_diff(&diff);
        if changed && !ctx.check_mode() {
            info!(vm = %vm.display_name(), backing = backing.name(), "reconfiguring CD-ROM");
            common::reconfigure_vm(ctx, &vm, changes).await?;
        }

        let status = if present {
            let mut view = want;
            view["controller_type"] = json!(controller_type.name());
            view["controller_number"] = json!(controller_number);
            view["unit_number"] = json!(unit);
            view
        } else {
            Value::Null
        };
        Ok(Outcome::changed(changed).with("cdrom_status", status).with_diff(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_agree_for_iso() {
        let backing = CdromBacking::Iso("[ds1] iso/os.iso".into());
        let device = dev::cdrom(-300, 200, 0, dev::Bus::Ide, &backing, true).unwrap();
        assert_eq!(cdrom_view(&device), desired_view(&backing, true));
    }

    #[test]
    fn test_none_backing_is_never_connected() {
        assert_eq!(desired_view(&CdromBacking::None, true)["start_connected"], false);
    }
}
