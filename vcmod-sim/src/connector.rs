//! A [`Connector`] that opens sessions against a [`Sim`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::debug;
use vcmod_core::api::{Args, FileTransfer, GlobalPermission, GlobalPermissionApi, Method, ObjectContent, RestApi, RetrieveSpec, ServiceContent, VimApi};
use vcmod_core::audit::Surface;
use vcmod_core::session::{Connector, ConnectionParams, Endpoints, Needs, Session, Teardown};
use vcmod_core::value::MoRef;
use vcmod_core::{Error, Result};

use crate::Sim;
use crate::world::fault;

#[derive(Clone)]
pub struct SimConnector {
    sim: Sim,
}

impl SimConnector {
    pub fn new(sim: Sim) -> Self {
        Self { sim }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn open(&self, params: &ConnectionParams, needs: Needs) -> Result<Session> {
        let endpoint = params.endpoint();
        self.sim.with(|w| {
            if w.unreachable {
                return Err(Error::ConnectError {
                    endpoint: endpoint.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            if params.password.expose_secret() != w.password {
                return Err(Error::AuthFailed {
                    endpoint: endpoint.clone(),
                    reason: "Cannot complete login due to an incorrect user name or password.".to_string(),
                });
            }
            w.opens += 1;
            Ok(())
        })?;
        debug!(endpoint = %endpoint, needs = ?needs.labels(), "simulated session opened");

        let surface = |surface: Surface| -> Arc<dyn VimApi> {
            Arc::new(SimSurface {
                sim: self.sim.clone(),
                surface,
            })
        };
        let endpoints = Endpoints {
            vim: surface(Surface::Soap),
            content: self.sim.content(),
            rest: needs
                .rest
                .then(|| Arc::new(SimRest { sim: self.sim.clone() }) as Arc<dyn RestApi>),
            pbm: needs.pbm.then(|| surface(Surface::Pbm)),
            sms: needs.sms.then(|| surface(Surface::Sms)),
            vsan: needs.vsan.then(|| surface(Surface::Vsan)),
            mob: needs
                .mob
                .then(|| Arc::new(SimMob { sim: self.sim.clone() }) as Arc<dyn GlobalPermissionApi>),
            files: needs
                .files
                .then(|| Arc::new(SimFiles { sim: self.sim.clone() }) as Arc<dyn FileTransfer>),
        };
        Ok(Session::new(endpoints, Box::new(SimTeardown { sim: self.sim.clone() })))
    }
}

struct SimSurface {
    sim: Sim,
    surface: Surface,
}

#[async_trait]
impl VimApi for SimSurface {
    async fn invoke(&self, this: &MoRef, method: &str, args: Args) -> Result<Value> {
        self.sim.dispatch(self.surface, this, method, args)
    }

    async fn retrieve(&self, _content: &ServiceContent, spec: &RetrieveSpec) -> Result<Vec<ObjectContent>> {
        Ok(self.sim.with(|w| w.retrieve(spec)))
    }
}

struct SimRest {
    sim: Sim,
}

#[async_trait]
impl RestApi for SimRest {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>> {
        let verb = format!("{method:?}").to_uppercase();
        self.sim.with(|w| {
            w.record(Surface::Rest, path.to_string(), &verb, body.clone().unwrap_or(Value::Null));
            if let Some(err) = w.injected(&verb) {
                return Err(err);
            }
            crate::rest::request(w, method, path, body)
        })
    }
}

struct SimMob {
    sim: Sim,
}

#[async_trait]
impl GlobalPermissionApi for SimMob {
    async fn list(&self) -> Result<Vec<GlobalPermission>> {
        self.sim.with(|w| {
            w.record(Surface::Mob, String::new(), "LIST", Value::Null);
            Ok(w.global_permissions.clone())
        })
    }

    async fn add(&self, permission: &GlobalPermission) -> Result<()> {
        self.sim.with(|w| {
            w.record(
                Surface::Mob,
                permission.principal.clone(),
                "add",
                json!({ "roleId": permission.role_id, "propagate": permission.propagate, "group": permission.group }),
            );
            if let Some(err) = w.injected("add") {
                return Err(err);
            }
            let same = |p: &GlobalPermission| {
                p.principal.eq_ignore_ascii_case(&permission.principal) && p.group == permission.group
            };
            match w.global_permissions.iter_mut().find(|p| same(p)) {
                Some(slot) => *slot = permission.clone(),
                None => w.global_permissions.push(permission.clone()),
            }
            Ok(())
        })
    }

    async fn remove(&self, principal: &str, group: bool) -> Result<()> {
        self.sim.with(|w| {
            w.record(Surface::Mob, principal.to_string(), "remove", json!({ "group": group }));
            if let Some(err) = w.injected("remove") {
                return Err(err);
            }
            let before = w.global_permissions.len();
            w.global_permissions
                .retain(|p| !(p.principal.eq_ignore_ascii_case(principal) && p.group == group));
            if w.global_permissions.len() == before {
                return Err(fault("NotFound", format!("no global permission for {principal}")));
            }
            Ok(())
        })
    }
}

struct SimFiles {
    sim: Sim,
}

impl SimFiles {
    fn missing(url: &str) -> Error {
        fault("NOT_FOUND", format!("{url} does not exist"))
    }
}

#[async_trait]
impl FileTransfer for SimFiles {
    async fn exists(&self, url_path: &str) -> Result<bool> {
        Ok(self.sim.with(|w| {
            w.record(Surface::File, url_path.to_string(), "HEAD", Value::Null);
            w.files.contains_key(url_path)
        }))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let bytes = self.sim.with(|w| {
            w.record(Surface::File, url.to_string(), "GET", Value::Null);
            w.files.get(url).cloned().ok_or_else(|| Self::missing(url))
        })?;
        std::fs::write(dest, &bytes)
            .map_err(|e| Error::Internal(format!("cannot write {}: {e}", dest.display())))?;
        Ok(bytes.len() as u64)
    }

    async fn upload(&self, url: &str, source: &Path, _timeout: Duration) -> Result<()> {
        let bytes = std::fs::read(source)
            .map_err(|e| Error::InvalidArgument(format!("cannot read {}: {e}", source.display())))?;
        self.put_bytes(url, bytes).await
    }

    async fn put_bytes(&self, url_path: &str, bytes: Vec<u8>) -> Result<()> {
        self.sim.with(|w| {
            w.record(Surface::File, url_path.to_string(), "PUT", json!({ "size": bytes.len() }));
            if let Some(err) = w.injected("PUT") {
                return Err(err);
            }
            w.files.insert(url_path.to_string(), bytes);
            Ok(())
        })
    }

    async fn delete(&self, url_path: &str) -> Result<()> {
        self.sim.with(|w| {
            w.record(Surface::File, url_path.to_string(), "DELETE", Value::Null);
            w.files.remove(url_path).map(|_| ()).ok_or_else(|| Self::missing(url_path))
        })
    }
}

struct SimTeardown {
    sim: Sim,
}

#[async_trait]
impl Teardown for SimTeardown {
    async fn close(&self) -> Result<()> {
        self.sim.with(|w| w.closes += 1);
        Ok(())
    }
}
