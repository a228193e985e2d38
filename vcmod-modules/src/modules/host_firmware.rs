//! Configuration bundle backup, restore and factory reset of ESXi hosts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::info;
use vcmod_core::task::UPLOAD_TIMEOUT;
use vcmod_core::transfer::firmware_url;
use vcmod_core::value::{Handle, ValueExt};
use vcmod_core::{ArgumentSpec, Context, Error, Module, Needs, Outcome, Param, Params, Result, args};

use crate::common;

pub struct HostFirmware;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Backup,
    Restore,
    Reset,
}

impl Action {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "saved" | "backup" => Ok(Action::Backup),
            "loaded" | "restore" => Ok(Action::Restore),
            "absent" | "reset" => Ok(Action::Reset),
            other => Err(Error::InvalidArgument(format!(
                "state must be one of saved, loaded, absent, got '{other}'"
            ))),
        }
    }
}

async fn require_maintenance(ctx: &Context, host: &Handle) -> Result<()> {
    let props = ctx.properties(&host.moref(), &["runtime.inMaintenanceMode"]).await?;
    if props.bool_at("runtime.inMaintenanceMode") != Some(true) {
        return Err(Error::PreconditionFailed(format!(
            "host {} must be in maintenance mode",
            host.display_name()
        )));
    }
    Ok(())
}

/// Where a bundle for `host` lands: `dest` itself, or a timestamped file
/// inside it when it is a directory.
fn backup_target(dest: &Path, host: &str) -> PathBuf {
    if dest.is_dir() {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        dest.join(format!("configBundle-{host}-{stamp}.tgz"))
    } else {
        dest.to_path_buf()
    }
}

#[async_trait]
impl Module for HostFirmware {
    fn name(&self) -> &'static str {
        "host_firmware"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        let mut spec = ArgumentSpec::new();
        for p in common::host_params() {
            spec = spec.param(p);
        }
        spec.param(
            Param::str("state")
                .required()
                .choices(&["saved", "loaded", "absent"])
                .doc("saved backs up, loaded restores, absent resets to factory defaults"),
        )
        .param(Param::path("dest").doc("directory or file for state=saved"))
        .param(Param::path("src").doc("bundle to restore for state=loaded"))
        .param(Param::bool("force").default(false).doc("restore even if the bundle UUID differs"))
        .required_one_of(&["cluster_name", "esxi_hostname"])
        .required_if("state", "saved", &["dest"])
        .required_if("state", "loaded", &["src", "esxi_hostname"])
    }

    fn needs(&self, _params: &Params) -> Needs {
        Needs {
            files: true,
            ..Needs::SOAP
        }
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let action = Action::parse(params.require_str("state")?)?;
        let hosts = common::hosts(ctx, params).await?;
        let mut results = Map::new();

        for host in &hosts {
            let name = host.display_name();
            let firmware = common::host_manager(ctx, host, "firmwareSystem").await?;
            let entry = match action {
                Action::Backup => {
                    let dest = backup_target(Path::new(params.require_str("dest")?), name);
                    if ctx.check_mode() {
                        json!({ "dest": dest })
                    } else {
                        let url = ctx.call(&firmware, "BackupFirmwareConfiguration", args!()).await?;
                        let url = url
                            .as_str()
                            .ok_or_else(|| Error::Internal("backup did not return a URL".to_string()))?;
                        let url = firmware_url(url, name);
                        let size = ctx
                            .files()?
                            .download(&url, &dest)
                            .await
                            .map_err(|e| e.in_step("downloading the configuration bundle"))?;
                        info!(host = name, dest = %dest.display(), size, "saved configuration bundle");
                        json!({ "url": url, "dest": dest, "size": size })
                    }
                }
                Action::Restore => {
                    let src = PathBuf::from(params.require_str("src")?);
                    if !src.is_file() {
                        return Err(Error::InvalidArgument(format!(
                            "src {} is not a readable file",
                            src.display()
                        )));
                    }
                    require_maintenance(ctx, host).await?;
                    if !ctx.check_mode() {
                        let url = ctx.call(&firmware, "QueryFirmwareConfigUploadURL", args!()).await?;
                        let url = firmware_url(url.as_str().unwrap_or_default(), name);
                        ctx.file_upload(&url, &src, UPLOAD_TIMEOUT)
                            .await
                            .map_err(|e| e.in_step("uploading the configuration bundle"))?;
                        info!(host = name, "restoring configuration bundle");
                        ctx.mutate(
                            &firmware,
                            "RestoreFirmwareConfiguration",
                            args! { "force" => params.flag("force") },
                        )
                        .await
                        .map_err(|e| e.in_step("restoring the configuration bundle"))?;
                    }
                    json!({ "src": src })
                }
                Action::Reset => {
                    require_maintenance(ctx, host).await?;
                    if !ctx.check_mode() {
                        info!(host = name, "resetting configuration to factory defaults");
                        ctx.mutate(&firmware, "ResetFirmwareToFactoryDefaults", args!()).await?;
                    }
                    json!({ "reset": true })
                }
            };
            results.insert(name.to_string(), entry);
        }
        Ok(Outcome::changed(!hosts.is_empty()).with("results", Value::Object(results)))
    }
}
