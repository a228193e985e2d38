//! REST / Automation API client (`/api`).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::api::{Method, RestApi};
use crate::error::{Error, Fault, Result};
use crate::http::{Transport, status_error};

const SESSION_HEADER: &str = "vmware-api-session-id";

pub struct RestClient {
    http: Arc<Transport>,
    session_id: SecretString,
}

impl RestClient {
    /// Create a session with basic authentication.
    pub async fn login(http: Arc<Transport>, username: &str, password: &SecretString) -> Result<Self> {
        let url = http.url("/api/session")?;
        let response = http
            .client()
            .post(url)
            .basic_auth(username, Some(password.expose_secret()))
            .send()
            .await
            .map_err(|e| http.classify(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| http.classify(e))?;
        if !status.is_success() {
            return Err(match status {
                StatusCode::UNAUTHORIZED => Error::AuthFailed {
                    endpoint: http.endpoint().to_string(),
                    reason: rest_fault(&text)
                        .map(|f| f.message)
                        .unwrap_or_else(|| status.to_string()),
                },
                _ => rest_error(http.endpoint(), status, &text),
            });
        }
        let session_id: String = serde_json::from_str(&text)
            .map_err(|e| Error::Internal(format!("unexpected session response: {e}")))?;
        debug!(endpoint = %http.endpoint(), "REST session created");
        Ok(Self {
            http,
            session_id: SecretString::from(session_id),
        })
    }

    pub async fn logout(&self) -> Result<()> {
        self.request(Method::Delete, "/session", None).await.map(|_| ())
    }
}

#[async_trait]
impl RestApi for RestClient {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>> {
        let url = self.http.url(&format!("/api/{}", path.trim_start_matches('/')))?;
        let client = self.http.client();
        let mut request = match method {
            Method::Get => client.get(url),
            Method::Post => client.post(url),
            Method::Patch => client.patch(url),
            Method::Put => client.put(url),
            Method::Delete => client.delete(url),
        }
        .header(SESSION_HEADER, self.session_id.expose_secret());
        if let Some(body) = &body {
            request = request.json(body);
        }

        debug!(method = ?method, path = %path, "REST request");
        let response = request.send().await.map_err(|e| self.http.classify(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.http.classify(e))?;
        if !status.is_success() {
            return Err(rest_error(self.http.endpoint(), status, &text));
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }
}

/// Parse the `{"error_type": .., "messages": [..]}` error body.
fn rest_fault(body: &str) -> Option<Fault> {
    let v: Value = serde_json::from_str(body).ok()?;
    let name = v.get("error_type")?.as_str()?.to_string();
    let message = v
        .get("messages")
        .and_then(Value::as_array)
        .map(|msgs| {
            msgs.iter()
                .filter_map(|m| m.get("default_message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default();
    Some(Fault::new(name, message).with_detail(v))
}

fn rest_error(endpoint: &str, status: StatusCode, body: &str) -> Error {
    match rest_fault(body) {
        Some(fault) => Error::Remote(fault),
        None => status_error(endpoint, status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_rest_fault_classification() {
        let body = r#"{"error_type":"ALREADY_EXISTS","messages":[{"id":"x","default_message":"Tag exists"}]}"#;
        let err = rest_error("vc:443", StatusCode::BAD_REQUEST, body);
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(err.to_string().contains("Tag exists"));
    }

    #[test]
    fn test_unstructured_body_falls_back_to_status() {
        let err = rest_error("vc:443", StatusCode::NOT_FOUND, "<html>nope</html>");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
