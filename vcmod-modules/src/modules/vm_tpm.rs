use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::vm_devices::{self as dev, DeviceClass, TempKeys};
use vcmod_core::value::ValueExt;
use vcmod_core::{
    ArgumentSpec, Context, Decision, Error, Handle, Module, Outcome, Params, Resource, Result,
    reconcile,
};

use crate::common;

/// Virtual TPM of a VM. Adding or removing one needs the VM powered off.
pub struct VmTpm;

struct TpmResource {
    vm: Handle,
}

impl TpmResource {
    async fn require_powered_off(&self, ctx: &Context) -> Result<()> {
        let props = ctx.properties(&self.vm.moref(), &["runtime.powerState"]).await?;
        match props.str_at("runtime.powerState") {
            Some("poweredOff") | None => Ok(()),
            Some(state) => Err(Error::PreconditionFailed(format!(
                "virtual machine {} must be powered off to change its TPM (currently {state})",
                self.vm.display_name()
            ))),
        }
    }
}

#[async_trait]
impl Resource for TpmResource {
    type Observed = Value;

    async fn observe(&self, ctx: &Context) -> Result<Option<Value>> {
        let devices = common::vm_devices(ctx, &self.vm).await?;
        Ok(devices.into_iter().find(|d| d.type_name() == Some("VirtualTPM")))
    }

    fn observed_view(&self, device: &Value) -> Value {
        json!({ "tpm": true, "key": dev::device_key(device) })
    }

    fn desired_view(&self, observed: Option<&Value>) -> Result<Value> {
        Ok(match observed {
            Some(device) => self.observed_view(device),
            None => json!({ "tpm": true }),
        })
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        self.require_powered_off(ctx).await?;
        info!(vm = %self.vm.display_name(), "adding virtual TPM");
        let key = TempKeys::new().next(DeviceClass::Tpm);
        common::reconfigure_vm(ctx, &self.vm, vec![dev::add(dev::tpm(key))]).await
    }

    async fn update(&self, _ctx: &Context, _observed: &Value, _fields: &[String]) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, ctx: &Context, device: &Value) -> Result<()> {
        self.require_powered_off(ctx).await?;
        info!(vm = %self.vm.display_name(), "removing virtual TPM");
        common::reconfigure_vm(ctx, &self.vm, vec![dev::remove(device.clone(), false)]).await
    }

    async fn result_of(&self, _ctx: &Context, decision: &Decision, observed: Option<&Value>) -> Result<Value> {
        let present = match decision {
            Decision::Create => true,
            Decision::Delete => false,
            _ => observed.is_some(),
        };
        Ok(json!({ "vm": self.vm.display_name(), "tpm_present": present }))
    }
}

#[async_trait]
impl Module for VmTpm {
    fn name(&self) -> &'static str {
        "vm_tpm"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::vm_params() {
            spec = spec.param(p);
        }
        spec.param(common::state_param())
            .required_one_of(&["name", "uuid", "moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let resource = TpmResource {
            vm: common::vm(ctx, params).await?,
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "tpm_info"))
    }
}
