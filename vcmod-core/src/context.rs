//! Per-invocation context threaded through every component.
//!
//! The context owns the session. Reads go straight to the endpoints;
//! every mutating call goes through a `mutate*` method, which refuses to
//! run in check mode and records the call with the audit logger.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::api::{
    Args, FileTransfer, GlobalPermission, GlobalPermissionApi, Method, ObjectContent, RestApi,
    RetrieveSpec, ServiceContent, VimApi,
};
use crate::audit::{AuditLogger, Surface};
use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::inventory::Resolver;
use crate::session::Session;
use crate::task::{TaskRunner, TaskSettings};
use crate::value::MoRef;

pub struct Context {
    session: Session,
    check_mode: bool,
    diff_mode: bool,
    tasks: TaskSettings,
    audit: AuditLogger,
    warnings: Mutex<Vec<String>>,
    partial_diff: Mutex<Option<Diff>>,
}

/// What is left of a context once the module has finished.
pub struct ContextParts {
    pub session: Session,
    pub warnings: Vec<String>,
    pub partial_diff: Option<Diff>,
    pub audit: AuditLogger,
}

impl Context {
    pub fn new(session: Session, check_mode: bool, diff_mode: bool, tasks: TaskSettings, audit: AuditLogger) -> Self {
        Self {
            session,
            check_mode,
            diff_mode,
            tasks,
            audit,
            warnings: Mutex::new(Vec::new()),
            partial_diff: Mutex::new(None),
        }
    }

    pub fn check_mode(&self) -> bool {
        self.check_mode
    }

    pub fn diff_mode(&self) -> bool {
        self.diff_mode
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn task_settings(&self) -> TaskSettings {
        self.tasks
    }

    pub fn content(&self) -> &ServiceContent {
        &self.session.endpoints().content
    }

    pub fn vim(&self) -> &dyn VimApi {
        self.session.endpoints().vim.as_ref()
    }

    pub fn rest(&self) -> Result<&dyn RestApi> {
        self.session
            .endpoints()
            .rest
            .as_deref()
            .ok_or_else(|| undeclared("REST"))
    }

    pub fn global_permissions(&self) -> Result<&dyn GlobalPermissionApi> {
        self.session
            .endpoints()
            .mob
            .as_deref()
            .ok_or_else(|| undeclared("MOB"))
    }

    pub fn files(&self) -> Result<&dyn FileTransfer> {
        self.session
            .endpoints()
            .files
            .as_deref()
            .ok_or_else(|| undeclared("file transfer"))
    }

    /// The SOAP client for a surface.
    pub fn soap(&self, surface: Surface) -> Result<&dyn VimApi> {
        let endpoints = self.session.endpoints();
        let api = match surface {
            Surface::Soap => Some(endpoints.vim.as_ref()),
            Surface::Pbm => endpoints.pbm.as_deref(),
            Surface::Sms => endpoints.sms.as_deref(),
            Surface::Vsan => endpoints.vsan.as_deref(),
            other => return Err(Error::Internal(format!("{other:?} is not a SOAP surface"))),
        };
        api.ok_or_else(|| undeclared(&format!("{surface:?}")))
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self.vim(), self.content())
    }

    pub fn tasks(&self) -> TaskRunner<'_> {
        TaskRunner::new(self)
    }

    // === Reads ===

    /// Invoke a non-mutating vim25 method.
    pub async fn call(&self, this: &MoRef, method: &str, args: Args) -> Result<Value> {
        self.vim().invoke(this, method, args).await
    }

    /// Invoke a non-mutating method on another SOAP surface.
    pub async fn call_on(&self, surface: Surface, this: &MoRef, method: &str, args: Args) -> Result<Value> {
        self.soap(surface)?.invoke(this, method, args).await
    }

    pub async fn retrieve(&self, spec: &RetrieveSpec) -> Result<Vec<ObjectContent>> {
        self.vim().retrieve(self.content(), spec).await
    }

    /// Read properties of one object as a nested value.
    pub async fn properties(&self, obj: &MoRef, props: &[&str]) -> Result<Value> {
        let spec = RetrieveSpec::object(obj, props);
        let mut found = self.retrieve(&spec).await?;
        match found.pop() {
            Some(oc) => Ok(oc.as_value()),
            None => Err(Error::NotFound(format!("{obj} no longer exists"))),
        }
    }

    pub async fn rest_get(&self, path: &str) -> Result<Value> {
        self.rest()?.get(path).await
    }

    // === Writes ===

    fn guard(&self, what: &str) -> Result<()> {
        if self.check_mode {
            return Err(Error::Internal(format!(
                "refusing mutating call {what} in check mode"
            )));
        }
        Ok(())
    }

    /// Invoke a mutating vim25 method.
    pub async fn mutate(&self, this: &MoRef, method: &str, args: Args) -> Result<Value> {
        self.mutate_on(Surface::Soap, this, method, args).await
    }

    pub async fn mutate_on(&self, surface: Surface, this: &MoRef, method: &str, args: Args) -> Result<Value> {
        self.guard(method)?;
        let api = self.soap(surface)?;
        self.audit.method_invoked(surface, this, method);
        api.invoke(this, method, args).await
    }

    /// Invoke a task-returning method and wait with the default timeout.
    pub async fn mutate_task(&self, this: &MoRef, method: &str, args: Args) -> Result<Value> {
        self.mutate_task_within(this, method, args, self.tasks.default_timeout).await
    }

    pub async fn mutate_task_within(&self, this: &MoRef, method: &str, args: Args, timeout: Duration) -> Result<Value> {
        let task = self.mutate(this, method, args).await?;
        let task = MoRef::from_value(&task)
            .ok_or_else(|| Error::Internal(format!("{method} did not return a task")))?;
        self.tasks().wait(&task, timeout).await
    }

    pub async fn rest_mutate(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>> {
        let verb = format!("{method:?}").to_uppercase();
        self.guard(&format!("{verb} {path}"))?;
        let rest = self.rest()?;
        self.audit.rest_call(&verb, path);
        rest.request(method, path, body).await
    }

    pub async fn add_global_permission(&self, permission: &GlobalPermission) -> Result<()> {
        self.guard("AddGlobalAccessControlList")?;
        let mob = self.global_permissions()?;
        self.audit.global_permission("add", &permission.principal);
        mob.add(permission).await
    }

    pub async fn remove_global_permission(&self, principal: &str, group: bool) -> Result<()> {
        self.guard("RemoveGlobalAccess")?;
        let mob = self.global_permissions()?;
        self.audit.global_permission("remove", principal);
        mob.remove(principal, group).await
    }

    pub async fn file_upload(&self, url: &str, source: &Path, timeout: Duration) -> Result<()> {
        self.guard("PUT")?;
        let files = self.files()?;
        self.audit.file_transfer("PUT", url);
        files.upload(url, source, timeout).await
    }

    pub async fn file_put_bytes(&self, url: &str, bytes: Vec<u8>) -> Result<()> {
        self.guard("PUT")?;
        let files = self.files()?;
        self.audit.file_transfer("PUT", url);
        files.put_bytes(url, bytes).await
    }

    pub async fn file_delete(&self, url: &str) -> Result<()> {
        self.guard("DELETE")?;
        let files = self.files()?;
        self.audit.file_transfer("DELETE", url);
        files.delete(url).await
    }

    // === Envelope bookkeeping ===

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        match self.warnings.lock() {
            Ok(mut w) => w.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }

    /// Remember the diff computed so far, surfaced if a later step fails.
    pub fn record_diff(&self, diff: &Diff) {
        match self.partial_diff.lock() {
            Ok(mut d) => *d = Some(diff.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(diff.clone()),
        }
    }

    pub fn into_parts(self) -> ContextParts {
        let warnings = self.warnings.into_inner().unwrap_or_else(|p| p.into_inner());
        let partial_diff = self.partial_diff.into_inner().unwrap_or_else(|p| p.into_inner());
        ContextParts {
            session: self.session,
            warnings,
            partial_diff,
            audit: self.audit,
        }
    }
}

fn undeclared(surface: &str) -> Error {
    Error::Internal(format!("module did not declare the {surface} endpoint"))
}
