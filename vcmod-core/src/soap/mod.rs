//! SOAP / Managed-Object API client.

mod decode;
mod encode;

pub use decode::{Body, decode_response};
pub use encode::{encode_call, encode_value};

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::debug;

use crate::api::{Args, VimApi};
use crate::error::{Error, Result};
use crate::http::{SOAP_SESSION_COOKIE, Transport, status_error};
use crate::value::MoRef;

/// Which SOAP service of the endpoint a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// vim25 at `/sdk`.
    Vim,
    /// Storage policy (SPBM) at `/pbm/sdk`.
    Pbm,
    /// Storage monitoring (VASA providers) at `/sms/sdk`.
    Sms,
    /// vSAN management at `/vsanHealth`.
    Vsan,
}

impl Service {
    pub fn path(&self) -> &'static str {
        match self {
            Service::Vim => "/sdk",
            Service::Pbm => "/pbm/sdk",
            Service::Sms => "/sms/sdk",
            Service::Vsan => "/vsanHealth",
        }
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            Service::Vim => "urn:vim25",
            Service::Pbm => "urn:pbm",
            Service::Sms => "urn:sms",
            Service::Vsan => "urn:vsan",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Service::Vim => "urn:vim25/7.0.3.0",
            Service::Pbm => "urn:pbm/7.0.3.0",
            Service::Sms => "urn:sms/7.0.3.0",
            Service::Vsan => "urn:vsan/7.0.3",
        }
    }
}

pub struct SoapClient {
    http: Arc<Transport>,
    service: Service,
}

impl SoapClient {
    pub fn new(http: Arc<Transport>, service: Service) -> Self {
        Self { http, service }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    async fn post(&self, method: &str, body: String) -> Result<String> {
        let url = self.http.url(self.service.path())?;
        let mut request = self
            .http
            .client()
            .post(url)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", self.service.action())
            .body(body);
        // SPBM authenticates with the vim25 session passed in a header.
        if self.service == Service::Pbm
            && let Some(cookie) = self.http.cookie(SOAP_SESSION_COOKIE)
        {
            request = request.header("vcSessionCookie", cookie.trim_matches('"'));
        }

        debug!(service = ?self.service, method = %method, "SOAP request");
        let response = request.send().await.map_err(|e| self.http.classify(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.http.classify(e))?;
        // Faults arrive as HTTP 500 with a SOAP body; anything else that is
        // not XML is a transport-level failure.
        if !status.is_success() && !text.trim_start().starts_with('<') {
            return Err(status_error(self.http.endpoint(), status, &text));
        }
        Ok(text)
    }
}

#[async_trait]
impl VimApi for SoapClient {
    async fn invoke(&self, this: &MoRef, method: &str, args: Args) -> Result<Value> {
        let body = encode_call(self.service.namespace(), method, this, &args);
        let text = self.post(method, body).await?;
        match decode_response(&text)? {
            Body::Return(value) => Ok(value),
            Body::Fault(fault) => {
                debug!(method = %method, fault = %fault.name, "SOAP fault");
                Err(Error::Remote(fault))
            }
        }
    }
}
