//! Cluster configuration: DRS, HA and vSAN.

use serde_json::{Map, Value, json};

use super::{one_of, option_values, options_map};
use crate::error::{Error, Result};
use crate::value::{ValueExt, typed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrsBehavior {
    Manual,
    PartiallyAutomated,
    FullyAutomated,
}

const DRS_BEHAVIORS: &[(&str, DrsBehavior)] = &[
    ("manual", DrsBehavior::Manual),
    ("partiallyAutomated", DrsBehavior::PartiallyAutomated),
    ("fullyAutomated", DrsBehavior::FullyAutomated),
];

impl DrsBehavior {
    pub fn parse(s: &str) -> Result<Self> {
        one_of("drs_default_vm_behavior", s, DRS_BEHAVIORS)
    }

    pub fn as_str(&self) -> &'static str {
        DRS_BEHAVIORS
            .iter()
            .find(|(_, b)| b == self)
            .map(|(n, _)| *n)
            .unwrap_or("fullyAutomated")
    }
}

/// User scale 1 (conservative) .. 5 (aggressive); the server counts the
/// other way round.
pub fn vmotion_rate_to_server(rate: i64) -> Result<i64> {
    if !(1..=5).contains(&rate) {
        return Err(Error::InvalidArgument(format!(
            "drs_vmotion_rate must be between 1 and 5, got {rate}"
        )));
    }
    Ok(6 - rate)
}

pub fn vmotion_rate_from_server(rate: i64) -> i64 {
    6 - rate
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrsSettings {
    pub enabled: bool,
    pub default_vm_behavior: Option<DrsBehavior>,
    /// User scale.
    pub vmotion_rate: Option<i64>,
    pub advanced: Map<String, Value>,
}

impl DrsSettings {
    /// Read from `configurationEx.drsConfig`.
    pub fn from_config(drs: &Value) -> Self {
        Self {
            enabled: drs.bool_at("enabled").unwrap_or(false),
            default_vm_behavior: drs
                .str_at("defaultVmBehavior")
                .and_then(|b| DrsBehavior::parse(b).ok()),
            vmotion_rate: drs.i64_at("vmotionRate").map(vmotion_rate_from_server),
            advanced: options_map(&drs.list_at("option")),
        }
    }

    /// Comparable view on the user scale. Unset fields are left out.
    pub fn view(&self) -> Value {
        let mut v = json!({ "enabled": self.enabled });
        if let Some(b) = self.default_vm_behavior {
            v["default_vm_behavior"] = json!(b.as_str());
        }
        if let Some(rate) = self.vmotion_rate {
            v["vmotion_rate"] = json!(rate);
        }
        if !self.advanced.is_empty() {
            v["advanced_settings"] = Value::Object(self.advanced.clone());
        }
        v
    }

    pub fn drs_config(&self) -> Result<Value> {
        let mut cfg = json!({ "enabled": self.enabled });
        if let Some(b) = self.default_vm_behavior {
            cfg["defaultVmBehavior"] = json!(b.as_str());
        }
        if let Some(rate) = self.vmotion_rate {
            cfg["vmotionRate"] = json!(vmotion_rate_to_server(rate)?);
        }
        if !self.advanced.is_empty() {
            cfg["option"] = Value::Array(option_values(&self.advanced));
        }
        Ok(typed("ClusterDrsConfigInfo", cfg))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HaSettings {
    pub enabled: bool,
    pub host_monitoring: Option<bool>,
    pub admission_control: Option<bool>,
    pub failover_level: Option<i64>,
    pub vm_monitoring: Option<String>,
    pub isolation_response: Option<String>,
    pub advanced: Map<String, Value>,
}

const VM_MONITORING: &[(&str, &str)] = &[
    ("vmMonitoringDisabled", "vmMonitoringDisabled"),
    ("vmMonitoringOnly", "vmMonitoringOnly"),
    ("vmAndAppMonitoring", "vmAndAppMonitoring"),
];

const ISOLATION_RESPONSES: &[(&str, &str)] = &[
    ("none", "none"),
    ("powerOff", "powerOff"),
    ("shutdown", "shutdown"),
];

impl HaSettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(m) = &self.vm_monitoring {
            one_of("ha_vm_monitoring", m, VM_MONITORING)?;
        }
        if let Some(r) = &self.isolation_response {
            one_of("ha_host_isolation_response", r, ISOLATION_RESPONSES)?;
        }
        if let Some(level) = self.failover_level
            && !(1..=31).contains(&level)
        {
            return Err(Error::InvalidArgument(format!(
                "slot_based_admission_control failover_level must be 1-31, got {level}"
            )));
        }
        Ok(())
    }

    /// Read from `configurationEx.dasConfig`.
    pub fn from_config(das: &Value) -> Self {
        Self {
            enabled: das.bool_at("enabled").unwrap_or(false),
            host_monitoring: das.str_at("hostMonitoring").map(|m| m == "enabled"),
            admission_control: das.bool_at("admissionControlEnabled"),
            failover_level: das.i64_at("admissionControlPolicy.failoverLevel"),
            vm_monitoring: das.str_at("vmMonitoring").map(str::to_string),
            isolation_response: das
                .str_at("defaultVmSettings.isolationResponse")
                .map(str::to_string),
            advanced: options_map(&das.list_at("option")),
        }
    }

    pub fn view(&self) -> Value {
        let mut v = json!({ "enabled": self.enabled });
        if let Some(m) = self.host_monitoring {
            v["host_monitoring"] = json!(m);
        }
        if let Some(a) = self.admission_control {
            v["admission_control"] = json!(a);
        }
        if let Some(l) = self.failover_level {
            v["failover_level"] = json!(l);
        }
        if let Some(m) = &self.vm_monitoring {
            v["vm_monitoring"] = json!(m);
        }
        if let Some(r) = &self.isolation_response {
            v["isolation_response"] = json!(r);
        }
        if !self.advanced.is_empty() {
            v["advanced_settings"] = Value::Object(self.advanced.clone());
        }
        v
    }

    pub fn das_config(&self) -> Result<Value> {
        self.validate()?;
        let mut cfg = json!({ "enabled": self.enabled });
        if let Some(m) = &self.vm_monitoring {
            cfg["vmMonitoring"] = json!(m);
        }
        if let Some(m) = self.host_monitoring {
            cfg["hostMonitoring"] = json!(if m { "enabled" } else { "disabled" });
        }
        if let Some(r) = &self.isolation_response {
            cfg["defaultVmSettings"] = typed(
                "ClusterDasVmSettings",
                json!({ "isolationResponse": r }),
            );
        }
        if let Some(a) = self.admission_control {
            cfg["admissionControlEnabled"] = json!(a);
        }
        if let Some(level) = self.failover_level {
            cfg["admissionControlPolicy"] = typed(
                "ClusterFailoverLevelAdmissionControlPolicy",
                json!({ "failoverLevel": level }),
            );
        }
        if !self.advanced.is_empty() {
            cfg["option"] = Value::Array(option_values(&self.advanced));
        }
        Ok(typed("ClusterDasConfigInfo", cfg))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VsanSettings {
    pub enabled: bool,
    pub auto_claim_storage: Option<bool>,
    /// Extended options that live on the vSAN surface.
    pub object_repair_timer: Option<i64>,
    pub disable_site_read_locality: Option<bool>,
    pub large_cluster_support: Option<bool>,
}

impl VsanSettings {
    pub fn from_config(vsan: &Value, extended: Option<&Value>) -> Self {
        Self {
            enabled: vsan.bool_at("enabled").unwrap_or(false),
            auto_claim_storage: vsan.bool_at("defaultConfig.autoClaimStorage"),
            object_repair_timer: extended.and_then(|e| e.i64_at("objectRepairTimer")),
            disable_site_read_locality: extended.and_then(|e| e.bool_at("disableSiteReadLocality")),
            large_cluster_support: extended.and_then(|e| e.bool_at("largeScaleClusterSupport")),
        }
    }

    pub fn view(&self) -> Value {
        let mut v = json!({ "enabled": self.enabled });
        if let Some(a) = self.auto_claim_storage {
            v["auto_claim_storage"] = json!(a);
        }
        let mut adv = Map::new();
        if let Some(t) = self.object_repair_timer {
            adv.insert("object_repair_timer".into(), json!(t));
        }
        if let Some(d) = self.disable_site_read_locality {
            adv.insert("disable_site_read_locality".into(), json!(d));
        }
        if let Some(l) = self.large_cluster_support {
            adv.insert("large_cluster_support".into(), json!(l));
        }
        if !adv.is_empty() {
            v["advanced_options"] = Value::Object(adv);
        }
        v
    }

    pub fn has_extended(&self) -> bool {
        self.object_repair_timer.is_some()
            || self.disable_site_read_locality.is_some()
            || self.large_cluster_support.is_some()
    }

    pub fn vsan_config(&self) -> Value {
        let mut cfg = json!({ "enabled": self.enabled });
        if let Some(a) = self.auto_claim_storage {
            cfg["defaultConfig"] = typed(
                "VsanClusterConfigInfoHostDefaultInfo",
                json!({ "autoClaimStorage": a }),
            );
        }
        typed("VsanClusterConfigInfo", cfg)
    }

    /// `VimVsanReconfigSpec` for the vSAN cluster config system.
    pub fn reconfig_spec(&self) -> Result<Value> {
        if let Some(t) = self.object_repair_timer
            && t < 0
        {
            return Err(Error::InvalidArgument(format!(
                "object_repair_timer must not be negative, got {t}"
            )));
        }
        let mut spec = json!({ "vsanClusterConfig": self.vsan_config() });
        if self.has_extended() {
            let mut ext = Map::new();
            if let Some(t) = self.object_repair_timer {
                ext.insert("objectRepairTimer".into(), json!(t));
            }
            if let Some(d) = self.disable_site_read_locality {
                ext.insert("disableSiteReadLocality".into(), json!(d));
            }
            if let Some(l) = self.large_cluster_support {
                ext.insert("largeScaleClusterSupport".into(), json!(l));
            }
            spec["extendedConfig"] = typed("VsanExtendedConfig", Value::Object(ext));
        }
        spec["modify"] = json!(true);
        Ok(typed("VimVsanReconfigSpec", spec))
    }
}

/// `ClusterConfigSpecEx` carrying any of the three sections.
pub fn config_spec_ex(drs: Option<Value>, das: Option<Value>, vsan: Option<Value>) -> Value {
    let mut spec = Map::new();
    if let Some(d) = das {
        spec.insert("dasConfig".into(), d);
    }
    if let Some(d) = drs {
        spec.insert("drsConfig".into(), d);
    }
    if let Some(v) = vsan {
        spec.insert("vsanConfig".into(), v);
    }
    typed("ClusterConfigSpecEx", Value::Object(spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmotion_rate_inversion() {
        assert_eq!(vmotion_rate_to_server(1).unwrap(), 5);
        assert_eq!(vmotion_rate_to_server(3).unwrap(), 3);
        assert_eq!(vmotion_rate_to_server(5).unwrap(), 1);
        assert!(vmotion_rate_to_server(0).is_err());
        assert!(vmotion_rate_to_server(6).is_err());
        for rate in 1..=5 {
            assert_eq!(vmotion_rate_from_server(vmotion_rate_to_server(rate).unwrap()), rate);
        }
    }

    #[test]
    fn test_drs_config_parses_back() {
        let mut advanced = Map::new();
        advanced.insert("TryBalanceVmsPerHost".into(), json!("1"));
        let drs = DrsSettings {
            enabled: true,
            default_vm_behavior: Some(DrsBehavior::PartiallyAutomated),
            vmotion_rate: Some(2),
            advanced,
        };
        let cfg = drs.drs_config().unwrap();
        assert_eq!(cfg.i64_at("vmotionRate"), Some(4));
        assert_eq!(DrsSettings::from_config(&cfg), drs);
    }

    #[test]
    fn test_ha_validation() {
        let ha = HaSettings {
            enabled: true,
            vm_monitoring: Some("sometimes".into()),
            ..HaSettings::default()
        };
        assert!(ha.das_config().is_err());
        let ha = HaSettings {
            enabled: true,
            host_monitoring: Some(true),
            failover_level: Some(1),
            isolation_response: Some("powerOff".into()),
            ..HaSettings::default()
        };
        let cfg = ha.das_config().unwrap();
        assert_eq!(cfg.str_at("hostMonitoring"), Some("enabled"));
        assert_eq!(HaSettings::from_config(&cfg), ha);
    }

    #[test]
    fn test_vsan_reconfig_spec() {
        let vsan = VsanSettings {
            enabled: true,
            object_repair_timer: Some(120),
            ..VsanSettings::default()
        };
        let spec = vsan.reconfig_spec().unwrap();
        assert_eq!(spec.bool_at("vsanClusterConfig.enabled"), Some(true));
        assert_eq!(spec.i64_at("extendedConfig.objectRepairTimer"), Some(120));
        assert_eq!(spec.bool_at("modify"), Some(true));
    }
}
