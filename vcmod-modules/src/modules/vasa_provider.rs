//! VASA storage provider registration on the storage monitoring service.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::task::{LONG_TIMEOUT, retry_on_cert_trust};
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{
    ArgumentSpec, Context, Decision, Error, Module, Needs, Outcome, Param, Params, Resource, Result,
    Surface, args, reconcile,
};

use crate::common;

pub struct VasaProvider;

async fn storage_manager(ctx: &Context) -> Result<MoRef> {
    let service = MoRef::new("SmsServiceInstance", "ServiceInstance");
    let manager = ctx
        .call_on(Surface::Sms, &service, "QueryStorageManager", args!())
        .await?;
    MoRef::from_value(&manager)
        .ok_or_else(|| Error::Unsupported("the storage monitoring service has no storage manager".to_string()))
}

/// Info of every registered provider.
async fn providers(ctx: &Context, manager: &MoRef) -> Result<Vec<Value>> {
    let refs = ctx.call_on(Surface::Sms, manager, "QueryProvider", args!()).await?;
    let mut infos = Vec::new();
    for provider in refs.as_array().map(Vec::as_slice).unwrap_or_default() {
        if let Some(provider) = MoRef::from_value(provider) {
            infos.push(
                ctx.call_on(Surface::Sms, &provider, "QueryProviderInfo", args!())
                    .await?,
            );
        }
    }
    Ok(infos)
}

fn view(info: &Value) -> Value {
    json!({
        "name": info.str_at("name").unwrap_or_default(),
        "url": info.str_at("url").unwrap_or_default(),
    })
}

struct ProviderResource {
    manager: MoRef,
    name: String,
    url: String,
    certificate: Option<String>,
}

impl ProviderResource {
    async fn register(&self, ctx: &Context) -> Result<()> {
        info!(provider = %self.name, url = %self.url, "registering VASA provider");
        retry_on_cert_trust(|presented| async move {
            let certificate = presented.or_else(|| self.certificate.clone());
            let task = ctx
                .mutate_on(
                    Surface::Sms,
                    &self.manager,
                    "RegisterProvider_Task",
                    args! {
                        "providerSpec" => json!({
                            "_type": "VasaProviderSpec",
                            "name": self.name,
                            "url": self.url,
                            "certificate": certificate,
                        }),
                    },
                )
                .await?;
            let task = MoRef::from_value(&task)
                .ok_or_else(|| Error::Internal("registration did not return a task".to_string()))?;
            ctx.tasks().wait_sms(&task, LONG_TIMEOUT).await
        })
        .await?;
        Ok(())
    }

    async fn unregister(&self, ctx: &Context, observed: &Value) -> Result<()> {
        let uid = observed
            .str_at("uid")
            .ok_or_else(|| Error::Internal("provider without a uid".to_string()))?;
        info!(provider = %self.name, uid, "unregistering VASA provider");
        let task = ctx
            .mutate_on(
                Surface::Sms,
                &self.manager,
                "UnregisterProvider_Task",
                args! { "providerId" => uid },
            )
            .await?;
        let task = MoRef::from_value(&task)
            .ok_or_else(|| Error::Internal("unregistration did not return a task".to_string()))?;
        ctx.tasks().wait_sms(&task, LONG_TIMEOUT).await?;
        Ok(())
    }
}

#[async_trait]
impl Resource for ProviderResource {
    type Observed = Value;

    async fn observe(&self, ctx: &Context) -> Result<Option<Value>> {
        let all = providers(ctx, &self.manager).await?;
        let by_name = all.iter().find(|p| p.str_at("name") == Some(self.name.as_str()));
        let by_url = all.iter().find(|p| p.str_at("url") == Some(self.url.as_str()));
        Ok(by_name.or(by_url).cloned())
    }

    fn observed_view(&self, observed: &Value) -> Value {
        view(observed)
    }

    fn desired_view(&self, _observed: Option<&Value>) -> Result<Value> {
        Ok(json!({ "name": self.name, "url": self.url }))
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        self.register(ctx).await
    }

    /// Providers cannot be edited in place; they are registered again.
    async fn update(&self, ctx: &Context, observed: &Value, fields: &[String]) -> Result<()> {
        info!(provider = %self.name, fields = ?fields, "re-registering VASA provider");
        self.unregister(ctx, observed)
            .await
            .map_err(|e| e.in_step("unregistering the previous provider"))?;
        self.register(ctx)
            .await
            .map_err(|e| e.in_step("registering the provider again"))
    }

    async fn delete(&self, ctx: &Context, observed: &Value) -> Result<()> {
        self.unregister(ctx, observed).await
    }

    async fn result_of(&self, ctx: &Context, decision: &Decision, observed: Option<&Value>) -> Result<Value> {
        let info = match decision {
            Decision::Delete => None,
            Decision::Noop => observed.cloned(),
            _ if ctx.check_mode() => None,
            _ => self.observe(ctx).await?,
        };
        let present = !matches!(decision, Decision::Delete) && (info.is_some() || decision.is_change());
        Ok(json!({
            "name": self.name,
            "url": self.url,
            "uid": info.as_ref().and_then(|i| i.str_at("uid")),
            "status": info.as_ref().and_then(|i| i.str_at("status")),
            "state": if present { "present" } else { "absent" },
        }))
    }
}

#[async_trait]
impl Module for VasaProvider {
    fn name(&self) -> &'static str {
        "vasa_provider"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("name").required().aliases(&["vasa_name"]))
            .param(Param::str("url").aliases(&["vasa_url"]).doc("e.g. https://array.example.com:8443/vasa/version.xml"))
            .param(Param::str("certificate").aliases(&["vasa_certificate"]).doc("PEM; taken from the provider when omitted"))
            .param(common::state_param())
            .required_if("state", "present", &["url"])
    }

    fn needs(&self, _params: &Params) -> Needs {
        Needs {
            sms: true,
            ..Needs::SOAP
        }
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let resource = ProviderResource {
            manager: storage_manager(ctx).await?,
            name: params.require_str("name")?.to_string(),
            url: params.string("url").unwrap_or_default(),
            certificate: params.string("certificate"),
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "vasa_provider"))
    }
}
