//! NVIDIA vGPU profiles attached to a VM as PCI passthrough devices.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::vm_devices::{self as dev, DeviceClass, TempKeys};
use vcmod_core::value::ValueExt;
use vcmod_core::{
    ArgumentSpec, Context, Decision, Error, Handle, Module, Outcome, Param, Params, Resource,
    Result, reconcile,
};

use crate::common;

pub struct VmVgpu;

struct VgpuResource {
    vm: Handle,
    profile: String,
}

impl VgpuResource {
    async fn power_state(&self, ctx: &Context) -> Result<String> {
        let props = ctx.properties(&self.vm.moref(), &["runtime.powerState"]).await?;
        Ok(props.str_at("runtime.powerState").unwrap_or("poweredOff").to_string())
    }

    async fn require_powered_off(&self, ctx: &Context) -> Result<()> {
        let state = self.power_state(ctx).await?;
        if state != "poweredOff" {
            return Err(Error::PreconditionFailed(format!(
                "virtual machine {} must be powered off to change vGPU profiles (currently {state})",
                self.vm.display_name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for VgpuResource {
    type Observed = Value;

    async fn observe(&self, ctx: &Context) -> Result<Option<Value>> {
        let devices = common::vm_devices(ctx, &self.vm).await?;
        Ok(devices
            .into_iter()
            .find(|d| dev::vgpu_profile(d) == Some(self.profile.as_str())))
    }

    fn observed_view(&self, device: &Value) -> Value {
        json!({ "profile": dev::vgpu_profile(device) })
    }

    fn desired_view(&self, _observed: Option<&Value>) -> Result<Value> {
        Ok(json!({ "profile": self.profile }))
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        self.require_powered_off(ctx).await?;
        let key = TempKeys::new().next(DeviceClass::Vgpu);
        info!(vm = %self.vm.display_name(), profile = %self.profile, "adding vGPU");
        common::reconfigure_vm(ctx, &self.vm, vec![dev::add(dev::vgpu(key, &self.profile)?)]).await
    }

    async fn update(&self, _ctx: &Context, _observed: &Value, _fields: &[String]) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, ctx: &Context, device: &Value) -> Result<()> {
        self.require_powered_off(ctx).await?;
        info!(vm = %self.vm.display_name(), profile = %self.profile, "removing vGPU");
        common::reconfigure_vm(ctx, &self.vm, vec![dev::remove(device.clone(), false)]).await
    }

    async fn result_of(&self, ctx: &Context, _decision: &Decision, _observed: Option<&Value>) -> Result<Value> {
        let devices = common::vm_devices(ctx, &self.vm).await?;
        let profiles: Vec<&str> = devices.iter().filter_map(dev::vgpu_profile).collect();
        Ok(json!({
            "vm": self.vm.display_name(),
            "profile": self.profile,
            "attached_profiles": profiles,
        }))
    }
}

#[async_trait]
impl Module for VmVgpu {
    fn name(&self) -> &'static str {
        "vm_vgpu"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::vm_params() {
            spec = spec.param(p);
        }
        spec.param(Param::str("vgpu").required().doc("profile name, e.g. grid_a40-4q"))
            .param(common::state_param())
            .required_one_of(&["name", "uuid", "moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let profile = params.require_str("vgpu")?.trim().to_string();
        if profile.is_empty() {
            return Err(Error::InvalidArgument("vgpu profile must not be empty".to_string()));
        }
        let resource = VgpuResource {
            vm: common::vm(ctx, params).await?,
            profile,
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "vgpu_info"))
    }
}
