//! Datastore specs: Storage I/O Control and VMFS resolution.

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::value::{ValueExt, typed};

/// How the congestion threshold is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Congestion {
    /// Percent of peak throughput, 50-100.
    Percentage(i64),
    /// Latency in milliseconds, 5-100.
    Manual(i64),
}

impl Congestion {
    pub fn from_params(percentage: Option<i64>, manual: Option<i64>) -> Result<Option<Self>> {
        match (percentage, manual) {
            (Some(_), Some(_)) => Err(Error::InvalidArgument(
                "parameters are mutually exclusive: congestion_threshold_percentage|congestion_threshold_manual"
                    .to_string(),
            )),
            (Some(p), None) if !(50..=100).contains(&p) => Err(Error::InvalidArgument(format!(
                "congestion_threshold_percentage must be between 50 and 100, got {p}"
            ))),
            (None, Some(ms)) if !(5..=100).contains(&ms) => Err(Error::InvalidArgument(format!(
                "congestion_threshold_manual must be between 5 and 100 ms, got {ms}"
            ))),
            (Some(p), None) => Ok(Some(Congestion::Percentage(p))),
            (None, Some(ms)) => Ok(Some(Congestion::Manual(ms))),
            (None, None) => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IormSettings {
    pub enabled: bool,
    pub congestion: Option<Congestion>,
    pub stats_collection: Option<bool>,
}

impl IormSettings {
    /// Read from `iormConfiguration`.
    pub fn from_config(cfg: &Value) -> Self {
        let congestion = match cfg.str_at("congestionThresholdMode") {
            Some("manual") => cfg.i64_at("congestionThreshold").map(Congestion::Manual),
            Some("automatic") => cfg
                .i64_at("percentOfPeakThroughput")
                .map(Congestion::Percentage),
            _ => None,
        };
        Self {
            enabled: cfg.bool_at("enabled").unwrap_or(false),
            congestion,
            stats_collection: cfg.bool_at("statsCollectionEnabled"),
        }
    }

    pub fn view(&self) -> Value {
        let mut v = json!({ "enabled": self.enabled });
        match self.congestion {
            Some(Congestion::Percentage(p)) => {
                v["congestion_threshold_mode"] = json!("automatic");
                v["congestion_threshold_percentage"] = json!(p);
            }
            Some(Congestion::Manual(ms)) => {
                v["congestion_threshold_mode"] = json!("manual");
                v["congestion_threshold_manual"] = json!(ms);
            }
            None => {}
        }
        if let Some(s) = self.stats_collection {
            v["statistic_collection"] = json!(s);
        }
        v
    }

    pub fn spec(&self) -> Value {
        let mut spec = json!({ "enabled": self.enabled });
        match self.congestion {
            Some(Congestion::Percentage(p)) => {
                spec["congestionThresholdMode"] = json!("automatic");
                spec["percentOfPeakThroughput"] = json!(p);
            }
            Some(Congestion::Manual(ms)) => {
                spec["congestionThresholdMode"] = json!("manual");
                spec["congestionThreshold"] = json!(ms);
            }
            None => {}
        }
        if let Some(s) = self.stats_collection {
            spec["statsCollectionEnabled"] = json!(s);
        }
        typed("StorageIORMConfigSpec", spec)
    }
}

/// Force-mount a snapshot volume keeping its signature.
pub fn force_mount_spec(extent_paths: &[String]) -> Value {
    typed(
        "HostUnresolvedVmfsResolutionSpec",
        json!({
            "extentDevicePath": extent_paths,
            "uuidResolution": "forceMount",
        }),
    )
}

/// Device paths of an unresolved VMFS volume's extents.
pub fn extent_paths(volume: &Value) -> Vec<String> {
    volume
        .list_at("extent")
        .into_iter()
        .filter_map(|e| e.str_at("devicePath").map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_congestion_bounds() {
        assert!(Congestion::from_params(Some(49), None).is_err());
        assert!(Congestion::from_params(Some(101), None).is_err());
        assert_eq!(
            Congestion::from_params(Some(50), None).unwrap(),
            Some(Congestion::Percentage(50))
        );
        assert!(Congestion::from_params(None, Some(4)).is_err());
        assert!(Congestion::from_params(Some(90), Some(30)).is_err());
        assert_eq!(Congestion::from_params(None, None).unwrap(), None);
    }

    #[test]
    fn test_iorm_spec_reads_back() {
        let iorm = IormSettings {
            enabled: true,
            congestion: Some(Congestion::Manual(30)),
            stats_collection: Some(true),
        };
        assert_eq!(IormSettings::from_config(&iorm.spec()), iorm);
    }

    #[test]
    fn test_force_mount_spec() {
        let volume = json!({
            "vmfsLabel": "snap_ds",
            "extent": [{ "devicePath": "/vmfs/devices/disks/naa.600a:1", "isHeadExtent": true }]
        });
        let spec = force_mount_spec(&extent_paths(&volume));
        assert_eq!(spec.str_at("uuidResolution"), Some("forceMount"));
        assert_eq!(spec.list_at("extentDevicePath")[0], "/vmfs/devices/disks/naa.600a:1");
    }
}
