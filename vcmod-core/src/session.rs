//! Session layer: authenticated endpoint clients for one invocation.
//!
//! A [`Session`] bundles every client a module asked for (SOAP is always
//! present; REST, SPBM, SMS, vSAN, MOB and file transfer on demand). All of
//! them share one endpoint, one credential set and one TLS policy. The
//! session must be closed with [`Session::close`]; dropping an open session
//! logs a warning.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{FileTransfer, GlobalPermissionApi, RestApi, ServiceContent, VimApi};
use crate::error::{Error, ErrorKind, Result};
use crate::http::{Transport, TransportOptions};
use crate::mob::MobClient;
use crate::rest::RestClient;
use crate::soap::{Service, SoapClient};
use crate::transfer::HttpTransfer;
use crate::value::MoRef;

pub const DEFAULT_PORT: u16 = 443;

/// Fully resolved connection parameters.
#[derive(Debug)]
pub struct ConnectionParams {
    pub hostname: String,
    pub username: String,
    pub password: SecretString,
    pub port: u16,
    pub validate_certs: bool,
    pub proxy: Option<(String, u16)>,
}

impl ConnectionParams {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            hostname: self.hostname.clone(),
            port: self.port,
            validate_certs: self.validate_certs,
            proxy: self.proxy.clone(),
        }
    }
}

/// Endpoint surfaces a module needs beyond the SOAP session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Needs {
    pub rest: bool,
    pub pbm: bool,
    pub sms: bool,
    pub vsan: bool,
    pub mob: bool,
    pub files: bool,
}

impl Needs {
    pub const SOAP: Needs = Needs {
        rest: false,
        pbm: false,
        sms: false,
        vsan: false,
        mob: false,
        files: false,
    };

    pub fn rest() -> Self {
        Needs {
            rest: true,
            ..Needs::SOAP
        }
    }

    /// Short labels for listings.
    pub fn labels(&self) -> Vec<&'static str> {
        let mut out = vec!["soap"];
        for (on, label) in [
            (self.rest, "rest"),
            (self.pbm, "pbm"),
            (self.sms, "sms"),
            (self.vsan, "vsan"),
            (self.mob, "mob"),
            (self.files, "files"),
        ] {
            if on {
                out.push(label);
            }
        }
        out
    }
}

/// Releases the server-side sessions.
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// The clients of one invocation.
pub struct Endpoints {
    pub vim: Arc<dyn VimApi>,
    pub content: ServiceContent,
    pub rest: Option<Arc<dyn RestApi>>,
    pub pbm: Option<Arc<dyn VimApi>>,
    pub sms: Option<Arc<dyn VimApi>>,
    pub vsan: Option<Arc<dyn VimApi>>,
    pub mob: Option<Arc<dyn GlobalPermissionApi>>,
    pub files: Option<Arc<dyn FileTransfer>>,
}

pub struct Session {
    endpoints: Endpoints,
    teardown: Option<Box<dyn Teardown>>,
}

impl Session {
    pub fn new(endpoints: Endpoints, teardown: Box<dyn Teardown>) -> Self {
        Self {
            endpoints,
            teardown: Some(teardown),
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn is_open(&self) -> bool {
        self.teardown.is_some()
    }

    /// Log out of every opened surface. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        match self.teardown.take() {
            Some(teardown) => teardown.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.teardown.is_some() {
            warn!("session dropped without logout");
        }
    }
}

/// Opens sessions. The HTTP implementation talks to a real endpoint; tests
/// substitute an in-memory one.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, params: &ConnectionParams, needs: Needs) -> Result<Session>;
}

/// Connector for real vCenter / ESXi endpoints.
#[derive(Debug, Default)]
pub struct HttpConnector {
    base_override: Option<url::Url>,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Talk to `base` instead of `https://hostname:port/`.
    pub fn with_base(base: url::Url) -> Self {
        Self {
            base_override: Some(base),
        }
    }

    fn transport(&self, params: &ConnectionParams) -> Result<Arc<Transport>> {
        let opts = params.transport_options();
        let transport = match &self.base_override {
            Some(base) => Transport::with_base(&opts, base.clone())?,
            None => Transport::new(&opts)?,
        };
        Ok(Arc::new(transport))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn open(&self, params: &ConnectionParams, needs: Needs) -> Result<Session> {
        let http = self.transport(params)?;
        let (vim, content) = open_soap(&http, params).await?;

        let rest = if needs.rest {
            match open_rest(&http, params).await {
                Ok(rest) => Some(Arc::new(rest)),
                Err(e) => {
                    // Do not leak the SOAP session already opened.
                    logout_soap(&vim, &content.session_manager).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let soap_for = |service: Service| -> Arc<dyn VimApi> { Arc::new(SoapClient::new(Arc::clone(&http), service)) };
        let vim_dyn: Arc<dyn VimApi> = vim.clone();
        let endpoints = Endpoints {
            vim: vim_dyn.clone(),
            content: content.clone(),
            rest: rest.clone().map(|r| r as Arc<dyn RestApi>),
            pbm: needs.pbm.then(|| soap_for(Service::Pbm)),
            sms: needs.sms.then(|| soap_for(Service::Sms)),
            vsan: needs.vsan.then(|| soap_for(Service::Vsan)),
            mob: needs.mob.then(|| {
                Arc::new(MobClient::new(
                    Arc::clone(&http),
                    &params.username,
                    &params.password,
                    vim_dyn.clone(),
                    content.clone(),
                )) as Arc<dyn GlobalPermissionApi>
            }),
            files: needs
                .files
                .then(|| Arc::new(HttpTransfer::new(Arc::clone(&http))) as Arc<dyn FileTransfer>),
        };
        let teardown = HttpTeardown {
            vim,
            session_manager: content.session_manager.clone(),
            rest,
        };
        Ok(Session::new(endpoints, Box::new(teardown)))
    }
}

/// Log in to the SOAP endpoint.
pub async fn open_soap(http: &Arc<Transport>, params: &ConnectionParams) -> Result<(Arc<SoapClient>, ServiceContent)> {
    let vim = Arc::new(SoapClient::new(Arc::clone(http), Service::Vim));
    let service_instance = MoRef::new("ServiceInstance", "ServiceInstance");
    let raw = vim
        .invoke(&service_instance, "RetrieveServiceContent", Vec::new())
        .await
        .map_err(|e| session_error(http.endpoint(), e))?;
    let content = ServiceContent::from_value(&raw)?;

    vim.invoke(
        &content.session_manager,
        "Login",
        vec![
            ("userName".to_string(), Value::String(params.username.clone())),
            ("password".to_string(), Value::String(params.password.expose_secret().to_string())),
        ],
    )
    .await
    .map_err(|e| session_error(http.endpoint(), e))?;
    info!(endpoint = %http.endpoint(), api_version = %content.api_version, "SOAP session opened");
    Ok((vim, content))
}

/// Log in to the REST endpoint.
pub async fn open_rest(http: &Arc<Transport>, params: &ConnectionParams) -> Result<RestClient> {
    let rest = RestClient::login(Arc::clone(http), &params.username, &params.password)
        .await
        .map_err(|e| session_error(http.endpoint(), e))?;
    info!(endpoint = %http.endpoint(), "REST session opened");
    Ok(rest)
}

/// Carry the endpoint on login-time failures.
fn session_error(endpoint: &str, err: Error) -> Error {
    match err.kind() {
        ErrorKind::AuthFailed => match err {
            Error::AuthFailed { .. } => err,
            other => Error::AuthFailed {
                endpoint: endpoint.to_string(),
                reason: other
                    .fault()
                    .map(|f| f.message.clone())
                    .unwrap_or_else(|| other.to_string()),
            },
        },
        ErrorKind::Forbidden => Error::Forbidden(format!("{endpoint}: {err}")),
        _ => err,
    }
}

async fn logout_soap(vim: &SoapClient, session_manager: &MoRef) {
    if let Err(e) = vim.invoke(session_manager, "Logout", Vec::new()).await {
        warn!(error = %e, "SOAP logout failed");
    }
}

struct HttpTeardown {
    vim: Arc<SoapClient>,
    session_manager: MoRef,
    rest: Option<Arc<RestClient>>,
}

#[async_trait]
impl Teardown for HttpTeardown {
    async fn close(&self) -> Result<()> {
        let mut first_err = None;
        if let Some(rest) = &self.rest
            && let Err(e) = rest.logout().await
        {
            warn!(error = %e, "REST logout failed");
            first_err = Some(e);
        }
        if let Err(e) = self.vim.invoke(&self.session_manager, "Logout", Vec::new()).await {
            warn!(error = %e, "SOAP logout failed");
            first_err.get_or_insert(e);
        }
        debug!("sessions closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_labels() {
        assert_eq!(Needs::SOAP.labels(), vec!["soap"]);
        let n = Needs {
            pbm: true,
            rest: true,
            ..Needs::SOAP
        };
        assert_eq!(n.labels(), vec!["soap", "rest", "pbm"]);
    }

    #[test]
    fn test_session_error_attaches_endpoint() {
        let err = session_error(
            "vc:443",
            Error::Remote(crate::error::Fault::new("InvalidLogin", "bad password")),
        );
        match err {
            Error::AuthFailed { endpoint, reason } => {
                assert_eq!(endpoint, "vc:443");
                assert_eq!(reason, "bad password");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_connection_params_debug_hides_password() {
        let p = ConnectionParams {
            hostname: "vc".into(),
            username: "root".into(),
            password: SecretString::from("hunter22".to_string()),
            port: DEFAULT_PORT,
            validate_certs: true,
            proxy: None,
        };
        assert!(!format!("{p:?}").contains("hunter22"));
    }
}
