use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::builders::host::SriovRequest;
use vcmod_core::diff::{Diff, changed_fields};
use vcmod_core::value::{Handle, ValueExt};
use vcmod_core::{
    ArgumentSpec, CompareRules, Context, Error, Module, Outcome, Param, Params, Result, args,
};

use crate::common;

/// SR-IOV virtual functions on a physical NIC.
pub struct HostSriov;

/// The PCI id behind a `vmnicN` name.
pub(crate) async fn pnic_pci_id(ctx: &Context, host: &Handle, vmnic: &str) -> Result<String> {
    let props = ctx.properties(&host.moref(), &["config.network.pnic"]).await?;
    props
        .list_at("config.network.pnic")
        .into_iter()
        .find(|p| p.str_at("device") == Some(vmnic))
        .and_then(|p| p.str_at("pci"))
        .map(str::to_string)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "physical NIC {vmnic} does not exist on host {}",
                host.display_name()
            ))
        })
}

/// `config.pciPassthruInfo` entry of one PCI device.
pub(crate) async fn passthru_info(ctx: &Context, host: &Handle, pci_id: &str) -> Result<Value> {
    let props = ctx.properties(&host.moref(), &["config.pciPassthruInfo"]).await?;
    props
        .list_at("config.pciPassthruInfo")
        .into_iter()
        .find(|i| i.str_at("id") == Some(pci_id))
        .cloned()
        .ok_or_else(|| {
            Error::NotFound(format!(
                "PCI device {pci_id} on host {} has no passthrough information",
                host.display_name()
            ))
        })
}

#[async_trait]
impl Module for HostSriov {
    fn name(&self) -> &'static str {
        "host_sriov"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(Param::str("vmnic").required().doc("physical NIC, e.g. vmnic4"))
            .param(Param::bool("sriov_on").required())
            .param(Param::int("num_virt_func").required())
            .required_one_of(&["cluster_name", "esxi_hostname"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let vmnic = params.require_str("vmnic")?;
        let request = SriovRequest {
            sriov_on: params.flag("sriov_on"),
            num_virt_func: params.int("num_virt_func").unwrap_or_default(),
        };
        // The upper bound is per adapter; the pairing rules hold everywhere.
        request.validate(i64::MAX)?;

        let mut changed = false;
        let mut results = Map::new();
        let mut diff = Diff::empty();
        for host in common::hosts(ctx, params).await? {
            let pci_id = pnic_pci_id(ctx, &host, vmnic).await?;
            let info = passthru_info(ctx, &host, &pci_id).await?;
            if info.type_name() != Some("HostSriovInfo") || info.bool_at("sriovCapable") == Some(false) {
                return Err(Error::Unsupported(format!(
                    "{vmnic} on host {} is not SR-IOV capable",
                    host.display_name()
                )));
            }
            let max = info.i64_at("maxVirtualFunctionSupported").unwrap_or_default();
            request.validate(max)?;

            let observed = SriovRequest {
                sriov_on: info.bool_at("sriovEnabled").unwrap_or(false),
                num_virt_func: info.i64_at("numVirtualFunction").unwrap_or_default(),
            };
            let fields = changed_fields(&observed.view(), &request.view(), &CompareRules::default());
            if !fields.is_empty() {
                changed = true;
                let d = Diff::from_changes(&observed.view(), &request.view(), &fields);
                common::diff_entry(&mut diff, host.display_name(), d.before, d.after);
                if !ctx.check_mode() {
                    let system = common::host_manager(ctx, &host, "pciPassthruSystem").await?;
                    info!(host = %host.display_name(), vmnic, num_virt_func = request.num_virt_func, "updating SR-IOV");
                    ctx.mutate(&system, "UpdatePassthruConfig", args! { "config" => vec![request.config(&pci_id)] })
                        .await?;
                }
            }
            results.insert(
                host.display_name().to_string(),
                json!({
                    "vmnic": vmnic,
                    "pci_id": pci_id,
                    "max_virt_func_supported": max,
                    "previous": observed.view(),
                    "current": request.view(),
                    "changed": !fields.is_empty(),
                }),
            );
        }
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed).with("host_sriov_diff", Value::Object(results)).with_diff(diff))
    }
}
