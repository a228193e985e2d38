//! The SPBM, SMS and vSAN surfaces.

use serde_json::{Value, json};
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{Error, Fault, Result};

use crate::world::{World, fault};

pub(crate) const PROFILE_MANAGER: &str = "ProfileManager";
pub(crate) const STORAGE_MANAGER: &str = "StorageManager";

/// A profile id argument: `PbmProfileId` or a bare string.
fn profile_id(v: &Value) -> Option<String> {
    v.str_at("uniqueId").or_else(|| v.as_str()).map(str::to_string)
}

fn profile_index(w: &World, id: &str) -> Option<usize> {
    w.profiles.iter().position(|p| p.str_at("profileId.uniqueId") == Some(id))
}

pub(crate) fn pbm(w: &mut World, _this: &MoRef, method: &str, args: &Value) -> Result<Value> {
    match method {
        "PbmRetrieveServiceContent" => Ok(json!({
            "profileManager": MoRef::new("PbmProfileProfileManager", PROFILE_MANAGER).to_value(),
            "aboutInfo": { "name": "PBM", "version": "2.0" },
        })),
        "PbmQueryProfile" => Ok(Value::Array(
            w.profiles
                .iter()
                .map(|p| json!({ "_type": "PbmProfileId", "uniqueId": p.str_at("profileId.uniqueId") }))
                .collect(),
        )),
        "PbmRetrieveContent" => {
            let wanted: Vec<String> = args.list_at("profileIds").into_iter().filter_map(profile_id).collect();
            Ok(Value::Array(
                w.profiles
                    .iter()
                    .filter(|p| {
                        p.str_at("profileId.uniqueId")
                            .is_some_and(|id| wanted.iter().any(|x| x == id))
                    })
                    .cloned()
                    .collect(),
            ))
        }
        "PbmCreate" => {
            let spec = args.at("createSpec").cloned().unwrap_or(Value::Null);
            let name = spec.str_at("name").unwrap_or_default().to_string();
            if w.profiles.iter().any(|p| p.str_at("name") == Some(name.as_str())) {
                return Err(fault("PbmDuplicateName", format!("a profile named '{name}' already exists")));
            }
            let id = uuid::Uuid::new_v4().to_string();
            w.profiles.push(json!({
                "_type": "PbmCapabilityProfile",
                "profileId": { "_type": "PbmProfileId", "uniqueId": id },
                "name": name,
                "description": spec.str_at("description").unwrap_or_default(),
                "profileCategory": spec.str_at("category").unwrap_or("REQUIREMENT"),
                "resourceType": { "resourceType": "STORAGE" },
                "constraints": spec.at("constraints").cloned().unwrap_or(Value::Null),
            }));
            Ok(json!({ "_type": "PbmProfileId", "uniqueId": id }))
        }
        "PbmUpdate" => {
            let id = args.at("profileId").and_then(profile_id).unwrap_or_default();
            let idx = profile_index(w, &id).ok_or_else(|| fault("PbmFault", format!("profile {id} not found")))?;
            let spec = args.at("updateSpec").cloned().unwrap_or(Value::Null);
            let profile = &mut w.profiles[idx];
            for key in ["name", "description", "constraints"] {
                if let Some(v) = spec.at(key) {
                    profile[key] = v.clone();
                }
            }
            Ok(Value::Null)
        }
        "PbmDelete" => {
            let ids: Vec<String> = args.list_at("profileId").into_iter().filter_map(profile_id).collect();
            let mut outcomes = Vec::new();
            for id in ids {
                match profile_index(w, &id) {
                    Some(idx) => {
                        w.profiles.remove(idx);
                    }
                    None => outcomes.push(json!({
                        "profileId": { "uniqueId": id },
                        "fault": { "_type": "PbmFault", "localizedMessage": "profile not found" },
                    })),
                }
            }
            Ok(Value::Array(outcomes))
        }
        other => Err(fault("NotImplemented", format!("{other} is not implemented"))),
    }
}

fn provider_info(w: &World, provider: &MoRef) -> Result<Value> {
    w.prop(provider, "info")
        .ok_or_else(|| fault("NotFound", format!("provider {} not found", provider.value)))
}

pub(crate) fn sms(w: &mut World, this: &MoRef, method: &str, args: &Value) -> Result<Value> {
    match method {
        "QueryStorageManager" => Ok(MoRef::new("SmsStorageManager", STORAGE_MANAGER).to_value()),
        "QueryProvider" => Ok(Value::Array(
            w.objects
                .iter()
                .filter(|o| o.moref.kind == "VasaProvider")
                .map(|o| o.moref.to_value())
                .collect(),
        )),
        "QueryProviderInfo" => provider_info(w, this),
        "RegisterProvider_Task" => {
            let outcome = register_provider(w, args);
            Ok(w.finished_sms_task(outcome))
        }
        "UnregisterProvider_Task" => {
            let uid = args.str_at("providerId").unwrap_or_default().to_string();
            let found = w
                .objects
                .iter()
                .find(|o| o.moref.kind == "VasaProvider" && o.props.str_at("info.uid") == Some(uid.as_str()))
                .map(|o| o.moref.value.clone());
            let outcome = match found {
                Some(moid) => {
                    w.remove_tree(&moid);
                    Ok(Value::Null)
                }
                None => Err(fault("NotFound", format!("provider {uid} is not registered"))),
            };
            Ok(w.finished_sms_task(outcome))
        }
        "QuerySmsTaskInfo" => w
            .prop(this, "info")
            .ok_or_else(|| fault("NotFound", format!("task {} not found", this.value))),
        "QuerySmsTaskResult" => Ok(w.prop(this, "info.result").unwrap_or(Value::Null)),
        other => Err(fault("NotImplemented", format!("{other} is not implemented"))),
    }
}

fn register_provider(w: &mut World, args: &Value) -> Result<Value> {
    let spec = args.at("providerSpec").cloned().unwrap_or(Value::Null);
    let url = spec.str_at("url").unwrap_or_default().to_string();
    if let Some(expected) = &w.provider_certificate
        && spec.str_at("certificate") != Some(expected.as_str())
    {
        return Err(Error::Remote(
            Fault::new("CertificateNotTrusted", format!("certificate of {url} is not trusted"))
                .with_detail(json!({ "certificate": expected })),
        ));
    }
    let duplicate = w
        .objects
        .iter()
        .any(|o| o.moref.kind == "VasaProvider" && o.props.str_at("info.url") == Some(url.as_str()));
    if duplicate {
        return Err(fault("AlreadyExists", format!("a provider for {url} is already registered")));
    }
    let uid = uuid::Uuid::new_v4().to_string();
    let provider = w.insert(
        "VasaProvider",
        None,
        json!({ "info": {
            "_type": "VasaProviderInfo",
            "uid": uid,
            "name": spec.str_at("name").unwrap_or_default(),
            "url": url,
            "certificate": spec.str_at("certificate"),
            "status": "online",
        }}),
    );
    Ok(provider.to_value())
}

pub(crate) fn vsan(w: &mut World, _this: &MoRef, method: &str, args: &Value) -> Result<Value> {
    let cluster = args
        .moref_at("cluster")
        .ok_or_else(|| fault("InvalidArgument", "missing argument cluster"))?;
    w.require(&cluster)?;
    match method {
        "VsanClusterGetConfig" => {
            let info = w.prop(&cluster, "configurationEx.vsanConfigInfo").unwrap_or(json!({}));
            Ok(json!({
                "enabled": info.bool_at("enabled").unwrap_or(false),
                "defaultConfig": info.at("defaultConfig").cloned().unwrap_or(json!({})),
                "extendedConfig": w.prop(&cluster, "vsanExtendedConfig").unwrap_or(json!({
                    "objectRepairTimer": 60,
                    "disableSiteReadLocality": false,
                    "largeScaleClusterSupport": false,
                })),
            }))
        }
        "VsanClusterReconfig" => {
            let spec = args.at("vsanReconfigSpec").cloned().unwrap_or(Value::Null);
            let outcome = (|| -> Result<Value> {
                if let Some(cfg) = spec.at("vsanClusterConfig") {
                    let mut info = w.prop(&cluster, "configurationEx.vsanConfigInfo").unwrap_or(json!({}));
                    if let Some(enabled) = cfg.bool_at("enabled") {
                        info["enabled"] = json!(enabled);
                    }
                    if let Some(claim) = cfg.bool_at("defaultConfig.autoClaimStorage") {
                        info["defaultConfig"] = json!({ "autoClaimStorage": claim });
                    }
                    w.set_prop(&cluster, "configurationEx.vsanConfigInfo", info)?;
                }
                if let Some(ext) = spec.at("extendedConfig") {
                    let mut current = w.prop(&cluster, "vsanExtendedConfig").unwrap_or(json!({
                        "objectRepairTimer": 60,
                        "disableSiteReadLocality": false,
                        "largeScaleClusterSupport": false,
                    }));
                    if let Value::Object(fields) = ext {
                        for (k, v) in fields.iter().filter(|(k, _)| k.as_str() != "_type") {
                            current[k.as_str()] = v.clone();
                        }
                    }
                    w.set_prop(&cluster, "vsanExtendedConfig", current)?;
                }
                Ok(Value::Null)
            })();
            Ok(w.finished_task("VsanClusterReconfig", &cluster, outcome))
        }
        other => Err(fault("NotImplemented", format!("{other} is not implemented"))),
    }
}
