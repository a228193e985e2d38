//! Disk controllers of a virtual machine.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::vm_devices::{self as dev, ControllerType, DeviceClass, TempKeys};
use vcmod_core::value::ValueExt;
use vcmod_core::{
    ArgumentSpec, Context, Decision, Error, Handle, Module, Outcome, Param, Params, Resource,
    Result, reconcile,
};

use crate::common;

pub struct VmController;

/// Every controller of a VM with the number of devices hanging off it.
pub(crate) fn controller_views(devices: &[Value]) -> Vec<Value> {
    devices
        .iter()
        .filter_map(|d| {
            let kind = ControllerType::of_device(d)?;
            let key = dev::device_key(d)?;
            let attached = devices
                .iter()
                .filter(|x| x.i64_at("controllerKey") == Some(key))
                .count();
            Some(json!({
                "controller_type": kind.name(),
                "bus_number": d.i64_at("busNumber"),
                "key": key,
                "label": d.str_at("deviceInfo.label"),
                "attached_devices": attached,
            }))
        })
        .collect()
}

struct ControllerResource {
    vm: Handle,
    kind: ControllerType,
    bus_number: i64,
}

#[async_trait]
impl Resource for ControllerResource {
    type Observed = (Value, usize);

    async fn observe(&self, ctx: &Context) -> Result<Option<(Value, usize)>> {
        let devices = common::vm_devices(ctx, &self.vm).await?;
        let refs: Vec<&Value> = devices.iter().collect();
        let Some(found) = dev::find_controller(&refs, self.kind.bus(), self.bus_number) else {
            return Ok(None);
        };
        let attached = dev::device_key(found)
            .map(|key| refs.iter().filter(|d| d.i64_at("controllerKey") == Some(key)).count())
            .unwrap_or(0);
        Ok(Some((found.clone(), attached)))
    }

    fn observed_view(&self, (device, _): &(Value, usize)) -> Value {
        json!({
            "controller_type": ControllerType::of_device(device).map(|c| c.name()),
            "bus_number": device.i64_at("busNumber"),
        })
    }

    fn desired_view(&self, observed: Option<&(Value, usize)>) -> Result<Value> {
        if let Some((device, _)) = observed
            && let Some(existing) = ControllerType::of_device(device)
            && existing != self.kind
        {
            return Err(Error::InvalidArgument(format!(
                "bus {} already holds a {} controller; remove it before adding a {} controller",
                self.bus_number,
                existing.name(),
                self.kind.name()
            )));
        }
        Ok(json!({ "controller_type": self.kind.name(), "bus_number": self.bus_number }))
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        let key = TempKeys::new().next(DeviceClass::Controller);
        let controller = dev::controller(self.kind, self.bus_number, key)?;
        info!(vm = %self.vm.display_name(), kind = self.kind.name(), bus = self.bus_number, "adding controller");
        common::reconfigure_vm(ctx, &self.vm, vec![dev::add(controller)]).await
    }

    async fn update(&self, _ctx: &Context, _observed: &(Value, usize), _fields: &[String]) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, ctx: &Context, (device, attached): &(Value, usize)) -> Result<()> {
        if *attached > 0 {
            return Err(Error::PreconditionFailed(format!(
                "{} controller {} still has {attached} device(s) attached",
                self.kind.name(),
                self.bus_number
            )));
        }
        info!(vm = %self.vm.display_name(), kind = self.kind.name(), bus = self.bus_number, "removing controller");
        common::reconfigure_vm(ctx, &self.vm, vec![dev::remove(device.clone(), false)]).await
    }

    async fn result_of(&self, ctx: &Context, _decision: &Decision, _observed: Option<&(Value, usize)>) -> Result<Value> {
        let devices = common::vm_devices(ctx, &self.vm).await?;
        Ok(Value::Array(controller_views(&devices)))
    }
}

#[async_trait]
impl Module for VmController {
    fn name(&self) -> &'static str {
        "vm_controller"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::vm_params() {
            spec = spec.param(p);
        }
        spec.param(
            Param::str("controller_type")
                .required()
                .choices(&["lsilogic", "lsilogicsas", "buslogic", "paravirtual", "sata", "nvme", "ide"]),
        )
        .param(Param::int("bus_number").default(0))
        .param(common::state_param())
        .required_one_of(&["name", "uuid", "moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let kind = ControllerType::parse(params.require_str("controller_type")?)?;
        let bus_number = params.int("bus_number").unwrap_or(0);
        let max = kind.bus().max_controllers();
        if !(0..max).contains(&bus_number) {
            return Err(Error::InvalidArgument(format!(
                "bus_number must be between 0 and {} for {} controllers",
                max - 1,
                kind.name()
            )));
        }
        let resource = ControllerResource {
            vm: common::vm(ctx, params).await?,
            kind,
            bus_number,
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "disk_controller_data"))
    }
}
