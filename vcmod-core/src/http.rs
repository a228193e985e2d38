//! Shared HTTPS transport for every endpoint surface of one vCenter/ESXi.
//!
//! One `reqwest::Client` and one cookie jar are shared by the SOAP, REST,
//! MOB and file-transfer clients, so all of them observe the same TLS
//! policy, proxy and session cookie.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, Proxy, StatusCode};
use url::Url;

use crate::error::{Error, Result};

/// Cookie carrying the vim25 session.
pub const SOAP_SESSION_COOKIE: &str = "vmware_soap_session";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS and proxy settings for the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub hostname: String,
    pub port: u16,
    pub validate_certs: bool,
    pub proxy: Option<(String, u16)>,
}

pub struct Transport {
    client: Client,
    jar: Arc<Jar>,
    base: Url,
    endpoint: String,
}

impl Transport {
    pub fn new(opts: &TransportOptions) -> Result<Self> {
        let endpoint = format!("{}:{}", opts.hostname, opts.port);
        let base = Url::parse(&format!("https://{endpoint}/")).map_err(|e| {
            Error::InvalidArgument(format!("invalid hostname '{}': {e}", opts.hostname))
        })?;
        Self::with_base(opts, base)
    }

    /// Build a transport against an explicit base URL (plain HTTP is
    /// accepted, which test endpoints rely on).
    pub fn with_base(opts: &TransportOptions, base: Url) -> Result<Self> {
        let endpoint = format!("{}:{}", opts.hostname, opts.port);
        let jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(!opts.validate_certs);
        if let Some((host, port)) = &opts.proxy {
            let proxy = Proxy::all(format!("http://{host}:{port}")).map_err(|e| {
                Error::InvalidArgument(format!("invalid proxy '{host}:{port}': {e}"))
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| Error::TlsError {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            jar,
            base,
            endpoint,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `host:port`, used in error messages.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn url(&self, path_and_query: &str) -> Result<Url> {
        self.base
            .join(path_and_query.trim_start_matches('/'))
            .map_err(|e| Error::Internal(format!("bad endpoint path '{path_and_query}': {e}")))
    }

    /// Value of a cookie the endpoint has set, if any.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.base)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }

    /// Classify a transport-level failure.
    pub fn classify(&self, err: reqwest::Error) -> Error {
        classify_error(&self.endpoint, err)
    }
}

pub(crate) fn classify_error(endpoint: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Timeout(format!("request to {endpoint} timed out"));
    }
    let chain = error_chain(&err);
    let lowered = chain.to_lowercase();
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("handshake") {
        return Error::TlsError {
            endpoint: endpoint.to_string(),
            reason: chain,
        };
    }
    if err.is_connect() || err.is_request() {
        return Error::ConnectError {
            endpoint: endpoint.to_string(),
            reason: chain,
        };
    }
    Error::Remote(crate::error::Fault::new("HttpError", chain))
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}

/// Map a bare HTTP status (no structured body) onto the taxonomy.
pub(crate) fn status_error(endpoint: &str, status: StatusCode, body: &str) -> Error {
    let reason = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    match status {
        StatusCode::UNAUTHORIZED => Error::AuthFailed {
            endpoint: endpoint.to_string(),
            reason,
        },
        StatusCode::FORBIDDEN => Error::Forbidden(reason),
        StatusCode::NOT_FOUND => Error::NotFound(reason),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Error::Timeout(reason),
        _ => Error::Remote(crate::error::Fault::new(format!("HTTP{}", status.as_u16()), reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn opts() -> TransportOptions {
        TransportOptions {
            hostname: "vc.example.com".into(),
            port: 443,
            validate_certs: true,
            proxy: None,
        }
    }

    #[test]
    fn test_urls_join_onto_endpoint_root() {
        let t = Transport::new(&opts()).unwrap();
        assert_eq!(
            t.url("/sdk").unwrap().as_str(),
            "https://vc.example.com/sdk"
        );
        assert_eq!(
            t.url("api/session").unwrap().as_str(),
            "https://vc.example.com/api/session"
        );
        assert_eq!(t.endpoint(), "vc.example.com:443");
    }

    #[test]
    fn test_proxy_is_accepted() {
        let mut o = opts();
        o.proxy = Some(("proxy.local".into(), 3128));
        assert!(Transport::new(&o).is_ok());
    }

    #[test]
    fn test_status_mapping() {
        let e = status_error("vc:443", StatusCode::UNAUTHORIZED, "");
        assert_eq!(e.kind(), ErrorKind::AuthFailed);
        let e = status_error("vc:443", StatusCode::FORBIDDEN, "nope");
        assert_eq!(e.kind(), ErrorKind::Forbidden);
        let e = status_error("vc:443", StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(e.kind(), ErrorKind::RemoteFailure);
    }
}
