//! Files on a datastore through the `/folder` HTTP interface.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use vcmod_core::diff::Diff;
use vcmod_core::transfer::datastore_url;
use vcmod_core::value::Kind;
use vcmod_core::{
    ArgumentSpec, By, Context, Error, Module, Needs, Outcome, Param, Params, Result, Scope,
};

use crate::common;

pub struct DatastoreFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    File,
    Absent,
    Touch,
    Upload,
}

impl FileState {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(FileState::File),
            "absent" => Ok(FileState::Absent),
            "touch" => Ok(FileState::Touch),
            "upload" => Ok(FileState::Upload),
            other => Err(Error::InvalidArgument(format!(
                "state must be one of file, absent, touch, upload, got '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl Module for DatastoreFile {
    fn name(&self) -> &'static str {
        "datastore_file"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("datacenter").required().aliases(&["datacenter_name"]))
            .param(Param::str("datastore").required())
            .param(Param::str("path").required().aliases(&["dest"]).doc("path on the datastore"))
            .param(Param::path("src").doc("local file for state=upload"))
            .param(Param::bool("force").default(false).doc("overwrite an existing file on upload"))
            .param(
                Param::str("state")
                    .choices(&["file", "absent", "touch", "upload"])
                    .default("file"),
            )
            .required_if("state", "upload", &["src"])
    }

    fn needs(&self, _params: &Params) -> Needs {
        Needs {
            files: true,
            ..Needs::SOAP
        }
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let state = FileState::parse(params.str("state").unwrap_or("file"))?;
        let datacenter = params.require_str("datacenter")?;
        let datastore = params.require_str("datastore")?;
        let path = params.require_str("path")?;

        ctx.resolver()
            .find(
                Kind::Datastore,
                &By::Name(datastore.to_string()),
                &Scope::datacenter(datacenter),
                common::name_match(params)?,
            )
            .await?;

        let url = datastore_url(datastore, datacenter, path, false);
        let exists = ctx.files()?.exists(&url).await?;
        let shown = format!("[{datastore}] {}", path.trim_start_matches('/'));

        let changed = match state {
            FileState::File if !exists => {
                return Err(Error::NotFound(format!("file {shown} does not exist")));
            }
            FileState::File => false,
            FileState::Absent => {
                if exists && !ctx.check_mode() {
                    info!(file = %shown, "deleting");
                    ctx.file_delete(&url).await?;
                }
                exists
            }
            FileState::Touch => {
                if !exists && !ctx.check_mode() {
                    info!(file = %shown, "creating empty file");
                    ctx.file_put_bytes(&url, Vec::new()).await?;
                }
                !exists
            }
            FileState::Upload => {
                let src = PathBuf::from(params.require_str("src")?);
                if !src.is_file() {
                    return Err(Error::InvalidArgument(format!(
                        "src {} is not a readable file",
                        src.display()
                    )));
                }
                let write = !exists || params.flag("force");
                if write && !ctx.check_mode() {
                    info!(file = %shown, src = %src.display(), "uploading");
                    ctx.file_upload(&url, &src, ctx.task_settings().default_timeout).await?;
                }
                write
            }
        };

        let present_after = state != FileState::Absent;
        let diff = if changed {
            Diff {
                before: json!({ "path": shown, "exists": exists }),
                after: json!({ "path": shown, "exists": present_after }),
            }
        } else {
            Diff::empty()
        };
        ctx.record_diff(&diff);
        Ok(Outcome::changed(changed)
            .with("result", json!({ "path": shown, "url": url, "exists": present_after }))
            .with_diff(diff))
    }
}
