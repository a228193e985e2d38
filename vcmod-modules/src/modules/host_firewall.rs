//! Firewall rulesets of ESXi hosts: enabled flag and allowed hosts.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::builders::host::FirewallRule;
use vcmod_core::diff::{Diff, changed_fields};
use vcmod_core::value::ValueExt;
use vcmod_core::{
    ArgType, ArgumentSpec, CompareRules, Context, Error, Module, Outcome, Param, Params, Result,
    args,
};

use crate::common;

pub struct HostFirewall;

fn rule_options() -> Vec<Param> {
    vec![
        Param::str("name").required().doc("ruleset key, e.g. sshServer"),
        Param::bool("enabled").required(),
        Param::dict("allowed_hosts").options(vec![
            Param::bool("all_ip").required(),
            Param::list("ip_address", ArgType::Str),
            Param::list("ip_network", ArgType::Str).doc("networks in CIDR notation"),
        ]),
    ]
}

fn strings(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn desired_rules(params: &Params) -> Result<Vec<FirewallRule>> {
    params
        .list("rules")
        .iter()
        .map(|r| {
            let allowed = r.get("allowed_hosts").filter(|a| a.is_object());
            let rule = FirewallRule {
                name: r.str_at("name").unwrap_or_default().to_string(),
                enabled: r.bool_at("enabled").unwrap_or(false),
                all_ip: allowed.and_then(|a| a.bool_at("all_ip")),
                ip_addresses: strings(allowed.and_then(|a| a.get("ip_address"))),
                ip_networks: strings(allowed.and_then(|a| a.get("ip_network"))),
            };
            rule.validate()?;
            Ok(rule)
        })
        .collect()
}

fn rules() -> CompareRules {
    CompareRules::default()
        .unordered("allowed_hosts.ip_address")
        .unordered("allowed_hosts.ip_network")
}

#[async_trait]
impl Module for HostFirewall {
    fn name(&self) -> &'static str {
        "host_firewall"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(Param::list("rules", ArgType::Dict).required().options(rule_options()))
            .required_one_of(&["cluster_name", "esxi_hostname"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let wanted = desired_rules(params)?;

        let mut changed = false;
        let mut results = Map::new();
        let mut diff = Diff::empty();
        for host in common::hosts(ctx, params).await? {
            let props = ctx.properties(&host.moref(), &["config.firewall.ruleset"]).await?;
            let rulesets = props.list_at("config.firewall.ruleset");
            let mut host_result = Map::new();
            let mut host_before = Map::new();
            let mut host_after = Map::new();
            for want in &wanted {
                let current = rulesets
                    .iter()
                    .find(|r| r.str_at("key") == Some(want.name.as_str()))
                    .map(|r| FirewallRule::from_ruleset(r))
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "firewall ruleset '{}' does not exist on host {}",
                            want.name,
                            host.display_name()
                        ))
                    })?;
                let (have, desired) = (current.view(), want.view());
                let fields = changed_fields(&have, &desired, &rules());
                if !fields.is_empty() {
                    changed = true;
                    let d = Diff::from_changes(&have, &desired, &fields);
                    host_before.insert(want.name.clone(), d.before);
                    host_after.insert(want.name.clone(), d.after);
                }
                if !fields.is_empty() && !ctx.check_mode() {
                    let system = common::host_manager(ctx, &host, "firewallSystem").await?;
                    if fields.iter().any(|f| f == "enabled") {
                        let method = if want.enabled { "EnableRuleset" } else { "DisableRuleset" };
                        info!(host = %host.display_name(), ruleset = %want.name, method, "toggling ruleset");
                        ctx.mutate(&system, method, args! { "id" => want.name.as_str() }).await?;
                    }
                    if fields.iter().any(|f| f.starts_with("allowed_hosts")) {
                        info!(host = %host.display_name(), ruleset = %want.name, "updating allowed hosts");
                        ctx.mutate(
                            &system,
                            "UpdateRuleset",
                            args! { "id" => want.name.as_str(), "spec" => want.ruleset_spec()? },
                        )
                        .await?;
                    }
                }
                host_result.insert(
                    want.name.clone(),
                    json!({ "previous": have, "current": desired, "changed": !fields.is_empty() }),
                );
            }
            if !host_before.is_empty() {
                common::diff_entry(&mut diff, host.display_name(), Value::Object(host_before), Value::Object(host_after));
            }
            results.insert(host.display_name().to_string(), Value::Object(host_result));
        }
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed)
            .with("rule_set_state", Value::Object(results))
            .with_diff(diff))
    }
}
