//! Host configuration specs.

use serde_json::{Value, json};

use super::one_of;
use crate::error::{Error, Result};
use crate::value::{ValueExt, typed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Start,
    Stop,
    Restart,
    /// Running, without restarting a running service.
    Present,
    /// Stopped.
    Absent,
    /// Leave the run state alone; only the policy is managed.
    Unchanged,
}

impl ServiceState {
    pub fn parse(s: &str) -> Result<Self> {
        one_of(
            "state",
            s,
            &[
                ("start", ServiceState::Start),
                ("stop", ServiceState::Stop),
                ("restart", ServiceState::Restart),
                ("present", ServiceState::Present),
                ("absent", ServiceState::Absent),
                ("unchanged", ServiceState::Unchanged),
            ],
        )
    }

    /// Whether the service should be running afterwards.
    pub fn wants_running(&self) -> Option<bool> {
        match self {
            ServiceState::Start | ServiceState::Restart | ServiceState::Present => Some(true),
            ServiceState::Stop | ServiceState::Absent => Some(false),
            ServiceState::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePolicy {
    On,
    Off,
    Automatic,
}

impl ServicePolicy {
    pub fn parse(s: &str) -> Result<Self> {
        one_of(
            "service_policy",
            s,
            &[
                ("on", ServicePolicy::On),
                ("off", ServicePolicy::Off),
                ("automatic", ServicePolicy::Automatic),
            ],
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServicePolicy::On => "on",
            ServicePolicy::Off => "off",
            ServicePolicy::Automatic => "automatic",
        }
    }
}

/// The host service method that moves `running` towards `state`, if any.
pub fn service_method(state: ServiceState, running: bool) -> Option<&'static str> {
    match (state, running) {
        (ServiceState::Restart, true) => Some("RestartService"),
        (ServiceState::Start | ServiceState::Present | ServiceState::Restart, false) => {
            Some("StartService")
        }
        (ServiceState::Stop | ServiceState::Absent, true) => Some("StopService"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownMode {
    Disabled,
    Normal,
    Strict,
}

const LOCKDOWN_MODES: &[(&str, LockdownMode)] = &[
    ("disabled", LockdownMode::Disabled),
    ("normal", LockdownMode::Normal),
    ("strict", LockdownMode::Strict),
];

impl LockdownMode {
    pub fn parse(s: &str) -> Result<Self> {
        one_of("lockdown_mode", s, LOCKDOWN_MODES)
    }

    pub fn server_name(&self) -> &'static str {
        match self {
            LockdownMode::Disabled => "lockdownDisabled",
            LockdownMode::Normal => "lockdownNormal",
            LockdownMode::Strict => "lockdownStrict",
        }
    }

    pub fn from_server(s: &str) -> Option<Self> {
        [LockdownMode::Disabled, LockdownMode::Normal, LockdownMode::Strict]
            .into_iter()
            .find(|m| m.server_name() == s)
    }

    pub fn name(&self) -> &'static str {
        LOCKDOWN_MODES
            .iter()
            .find(|(_, m)| m == self)
            .map(|(n, _)| *n)
            .unwrap_or("disabled")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptanceLevel {
    VmwareCertified,
    VmwareAccepted,
    PartnerSupported,
    CommunitySupported,
}

const ACCEPTANCE_LEVELS: &[(&str, AcceptanceLevel)] = &[
    ("vmware_certified", AcceptanceLevel::VmwareCertified),
    ("vmware_accepted", AcceptanceLevel::VmwareAccepted),
    ("partner", AcceptanceLevel::PartnerSupported),
    ("community", AcceptanceLevel::CommunitySupported),
];

impl AcceptanceLevel {
    pub fn parse(s: &str) -> Result<Self> {
        one_of("acceptance_level", s, ACCEPTANCE_LEVELS)
    }

    pub fn as_str(&self) -> &'static str {
        ACCEPTANCE_LEVELS
            .iter()
            .find(|(_, l)| l == self)
            .map(|(n, _)| *n)
            .unwrap_or("partner")
    }
}

/// Desired state of one firewall ruleset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub enabled: bool,
    pub all_ip: Option<bool>,
    pub ip_addresses: Vec<String>,
    pub ip_networks: Vec<String>,
}

impl FirewallRule {
    pub fn validate(&self) -> Result<()> {
        for net in &self.ip_networks {
            split_network(net)?;
        }
        if self.all_ip == Some(true) && !(self.ip_addresses.is_empty() && self.ip_networks.is_empty()) {
            return Err(Error::InvalidArgument(format!(
                "ruleset '{}': ip_address and ip_network require all_ip to be false",
                self.name
            )));
        }
        Ok(())
    }

    /// Comparable view; allowed hosts are sets.
    pub fn view(&self) -> Value {
        let mut v = json!({ "enabled": self.enabled });
        if let Some(all) = self.all_ip {
            v["allowed_hosts"] = json!({
                "all_ip": all,
                "ip_address": self.ip_addresses,
                "ip_network": self.ip_networks,
            });
        }
        v
    }

    /// Observed state of a `HostFirewallRuleset`.
    pub fn from_ruleset(ruleset: &Value) -> Self {
        let networks = ruleset
            .list_at("allowedHosts.ipNetwork")
            .into_iter()
            .filter_map(|n| Some(format!("{}/{}", n.str_at("network")?, n.i64_at("prefixLength")?)))
            .collect();
        Self {
            name: ruleset.str_at("key").unwrap_or_default().to_string(),
            enabled: ruleset.bool_at("enabled").unwrap_or(false),
            all_ip: ruleset.bool_at("allowedHosts.allIp"),
            ip_addresses: ruleset
                .list_at("allowedHosts.ipAddress")
                .into_iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect(),
            ip_networks: networks,
        }
    }

    pub fn ruleset_spec(&self) -> Result<Value> {
        self.validate()?;
        let mut networks = Vec::new();
        for net in &self.ip_networks {
            let (network, prefix) = split_network(net)?;
            networks.push(typed(
                "HostFirewallRulesetIpNetwork",
                json!({ "network": network, "prefixLength": prefix }),
            ));
        }
        Ok(typed(
            "HostFirewallRulesetRulesetSpec",
            json!({
                "allowedHosts": typed("HostFirewallRulesetIpList", json!({
                    "ipAddress": self.ip_addresses,
                    "ipNetwork": networks,
                    "allIp": self.all_ip.unwrap_or(true),
                }))
            }),
        ))
    }
}

fn split_network(net: &str) -> Result<(&str, i64)> {
    let invalid = || Error::InvalidArgument(format!("'{net}' is not a network in CIDR notation"));
    let (addr, prefix) = net.split_once('/').ok_or_else(invalid)?;
    let prefix: i64 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.contains(':') { 128 } else { 32 };
    if addr.is_empty() || !(0..=max).contains(&prefix) {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

/// SR-IOV request for one physical NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SriovRequest {
    pub sriov_on: bool,
    pub num_virt_func: i64,
}

impl SriovRequest {
    pub fn validate(&self, max_supported: i64) -> Result<()> {
        if self.num_virt_func < 0 {
            return Err(Error::InvalidArgument(format!(
                "num_virt_func must not be negative, got {}",
                self.num_virt_func
            )));
        }
        if self.sriov_on && self.num_virt_func == 0 {
            return Err(Error::InvalidArgument(
                "sriov_on is true but num_virt_func is 0".to_string(),
            ));
        }
        if !self.sriov_on && self.num_virt_func > 0 {
            return Err(Error::InvalidArgument(format!(
                "sriov_on is false but num_virt_func is {}",
                self.num_virt_func
            )));
        }
        if self.num_virt_func > max_supported {
            return Err(Error::InvalidArgument(format!(
                "num_virt_func {} exceeds the {} virtual functions the adapter supports",
                self.num_virt_func, max_supported
            )));
        }
        Ok(())
    }

    pub fn view(&self) -> Value {
        json!({ "sriov_on": self.sriov_on, "num_virt_func": self.num_virt_func })
    }

    pub fn config(&self, device_id: &str) -> Value {
        typed(
            "HostSriovConfig",
            json!({
                "id": device_id,
                "passThruEnabled": false,
                "sriovEnabled": self.sriov_on,
                "numVirtualFunction": self.num_virt_func,
            }),
        )
    }
}

pub fn passthrough_config(device_id: &str, enabled: bool) -> Value {
    typed(
        "HostPciPassthroughConfig",
        json!({ "id": device_id, "passthruEnabled": enabled }),
    )
}

/// An iSCSI send target (`address[:port]`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SendTarget {
    pub address: String,
    pub port: i64,
}

impl SendTarget {
    pub fn parse(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((address, port)) if !address.contains(':') => {
                let port = port
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("invalid iSCSI port in '{s}'")))?;
                Ok(Self {
                    address: address.to_string(),
                    port,
                })
            }
            _ => Ok(Self {
                address: s.to_string(),
                port: 3260,
            }),
        }
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn to_value(&self) -> Value {
        typed(
            "HostInternetScsiHbaSendTarget",
            json!({ "address": self.address, "port": self.port }),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    PowerDownToStandby,
    PowerUpFromStandby,
    Shutdown,
    Reboot,
}

impl PowerAction {
    pub fn parse(s: &str) -> Result<Self> {
        one_of(
            "state",
            s,
            &[
                ("power-down-to-standby", PowerAction::PowerDownToStandby),
                ("power-up-from-standby", PowerAction::PowerUpFromStandby),
                ("shutdown-host", PowerAction::Shutdown),
                ("reboot-host", PowerAction::Reboot),
                ("shutdown", PowerAction::Shutdown),
                ("reboot", PowerAction::Reboot),
            ],
        )
    }

    pub fn method(&self) -> &'static str {
        match self {
            PowerAction::PowerDownToStandby => "PowerDownHostToStandBy_Task",
            PowerAction::PowerUpFromStandby => "PowerUpHostFromStandBy_Task",
            PowerAction::Shutdown => "ShutdownHost_Task",
            PowerAction::Reboot => "RebootHost_Task",
        }
    }

    /// The host power state that means the action already happened.
    pub fn target_state(&self) -> Option<&'static str> {
        match self {
            PowerAction::PowerDownToStandby => Some("standBy"),
            PowerAction::PowerUpFromStandby => Some("poweredOn"),
            PowerAction::Shutdown => Some("poweredOff"),
            PowerAction::Reboot => None,
        }
    }

    pub fn args(&self, timeout_secs: i64, force: bool) -> Vec<(String, Value)> {
        match self {
            PowerAction::PowerDownToStandby => vec![
                ("timeoutSec".to_string(), json!(timeout_secs)),
                ("evacuatePoweredOffVms".to_string(), json!(false)),
            ],
            PowerAction::PowerUpFromStandby => vec![("timeoutSec".to_string(), json!(timeout_secs))],
            PowerAction::Shutdown | PowerAction::Reboot => vec![("force".to_string(), json!(force))],
        }
    }

    pub fn needs_maintenance(&self) -> bool {
        matches!(self, PowerAction::Shutdown | PowerAction::Reboot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sriov_rules() {
        let ok = SriovRequest { sriov_on: true, num_virt_func: 8 };
        assert!(ok.validate(16).is_ok());
        assert!(ok.validate(4).is_err());
        assert!(SriovRequest { sriov_on: true, num_virt_func: 0 }.validate(16).is_err());
        assert!(SriovRequest { sriov_on: false, num_virt_func: 2 }.validate(16).is_err());
        assert!(SriovRequest { sriov_on: false, num_virt_func: 0 }.validate(16).is_ok());
        assert!(SriovRequest { sriov_on: false, num_virt_func: -1 }.validate(16).is_err());
    }

    #[test]
    fn test_service_transitions() {
        assert_eq!(service_method(ServiceState::Start, false), Some("StartService"));
        assert_eq!(service_method(ServiceState::Start, true), None);
        assert_eq!(service_method(ServiceState::Restart, true), Some("RestartService"));
        assert_eq!(service_method(ServiceState::Absent, true), Some("StopService"));
        assert_eq!(service_method(ServiceState::Unchanged, true), None);
    }

    #[test]
    fn test_firewall_ruleset_reads_back() {
        let rule = FirewallRule {
            name: "sshServer".into(),
            enabled: true,
            all_ip: Some(false),
            ip_addresses: vec!["10.0.0.5".into()],
            ip_networks: vec!["192.168.0.0/24".into()],
        };
        let spec = rule.ruleset_spec().unwrap();
        let observed = json!({
            "key": "sshServer",
            "enabled": true,
            "allowedHosts": spec.at("allowedHosts").cloned().unwrap()
        });
        assert_eq!(FirewallRule::from_ruleset(&observed), rule);

        let bad = FirewallRule { ip_networks: vec!["192.168.0.0".into()], ..rule };
        assert!(bad.ruleset_spec().is_err());
    }

    #[test]
    fn test_send_target_parse() {
        assert_eq!(SendTarget::parse("10.1.1.1").unwrap().port, 3260);
        assert_eq!(SendTarget::parse("10.1.1.1:3261").unwrap().port, 3261);
        assert!(SendTarget::parse("10.1.1.1:x").is_err());
    }

    #[test]
    fn test_lockdown_names() {
        assert_eq!(LockdownMode::parse("strict").unwrap().server_name(), "lockdownStrict");
        assert_eq!(LockdownMode::from_server("lockdownNormal"), Some(LockdownMode::Normal));
        assert!(LockdownMode::parse("paranoid").is_err());
    }
}
