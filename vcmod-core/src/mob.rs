//! Global permissions through the managed-object browser of the vCenter
//! authorization service (`/invsvc/mob3/`).
//!
//! Every mutating call follows the same handshake: GET the method page
//! with basic authentication, extract the `vmware-session-nonce` hidden
//! input, then POST the form with that nonce while the browser session
//! cookie is replayed by the shared cookie jar. Listing uses the vim25
//! authorization manager, where global permissions surface on the
//! inventory root.

use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::escape::escape;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::api::{GlobalPermission, GlobalPermissionApi, ServiceContent, VimApi};
use crate::error::{Error, Result};
use crate::http::{Transport, status_error};
use crate::value::{ValueExt, scalar_bool};

const NONCE_FIELD: &str = "vmware-session-nonce";
const MOB_PATH: &str = "/invsvc/mob3/";

pub struct MobClient {
    http: Arc<Transport>,
    username: String,
    password: SecretString,
    vim: Arc<dyn VimApi>,
    content: ServiceContent,
}

impl MobClient {
    pub fn new(
        http: Arc<Transport>,
        username: &str,
        password: &SecretString,
        vim: Arc<dyn VimApi>,
        content: ServiceContent,
    ) -> Self {
        Self {
            http,
            username: username.to_string(),
            password: SecretString::from(password.expose_secret().to_string()),
            vim,
            content,
        }
    }

    fn method_url(method: &str) -> String {
        format!("{MOB_PATH}?moid=authorizationService&method=AuthorizationService.{method}")
    }

    async fn nonce(&self, method: &str) -> Result<String> {
        let url = self.http.url(&Self::method_url(method))?;
        let response = self
            .http
            .client()
            .get(url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(|e| self.http.classify(e))?;
        let status = response.status();
        let page = response.text().await.map_err(|e| self.http.classify(e))?;
        if !status.is_success() {
            return Err(status_error(self.http.endpoint(), status, ""));
        }
        extract_nonce(&page).ok_or_else(|| {
            Error::Remote(crate::error::Fault::new(
                "MobProtocolError",
                format!("no {NONCE_FIELD} in {method} page"),
            ))
        })
    }

    async fn submit(&self, method: &str, field: &str, payload: String) -> Result<()> {
        let nonce = self
            .nonce(method)
            .await
            .map_err(|e| e.in_step(format!("fetching session nonce for {method}")))?;
        let url = self.http.url(&Self::method_url(method))?;
        debug!(method = %method, "MOB POST");
        let response = self
            .http
            .client()
            .post(url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .form(&[(NONCE_FIELD, nonce.as_str()), (field, payload.as_str())])
            .send()
            .await
            .map_err(|e| self.http.classify(e))?;
        let status = response.status();
        let page = response.text().await.map_err(|e| self.http.classify(e))?;
        if !status.is_success() {
            return Err(status_error(self.http.endpoint(), status, "").in_step(format!("invoking {method}")));
        }
        if let Some(fault) = mob_fault(&page) {
            return Err(Error::Remote(crate::error::Fault::new("MobFault", fault))
                .in_step(format!("invoking {method}")));
        }
        Ok(())
    }
}

#[async_trait]
impl GlobalPermissionApi for MobClient {
    async fn list(&self) -> Result<Vec<GlobalPermission>> {
        let authz = self.content.authorization_manager()?;
        let perms = self
            .vim
            .invoke(
                authz,
                "RetrieveEntityPermissions",
                vec![
                    ("entity".to_string(), self.content.root_folder.to_value()),
                    ("inherited".to_string(), Value::Bool(false)),
                ],
            )
            .await?;
        Ok(permissions_from_value(&perms))
    }

    async fn add(&self, permission: &GlobalPermission) -> Result<()> {
        self.submit(
            "AddGlobalAccessControlList",
            "permissions",
            permission_xml(permission),
        )
        .await
    }

    async fn remove(&self, principal: &str, group: bool) -> Result<()> {
        let payload = format!(
            "<principals><name>{}</name><group>{group}</group></principals>",
            escape(principal)
        );
        self.submit("RemoveGlobalAccess", "principals", payload).await
    }
}

/// Pull the hidden nonce input out of a MOB method page.
pub fn extract_nonce(page: &str) -> Option<String> {
    let marker = format!("name=\"{NONCE_FIELD}\"");
    let at = page.find(&marker)?;
    // The value attribute can sit before or after the name attribute.
    let tag_start = page[..at].rfind('<')?;
    let tag_end = at + page[at..].find('>')?;
    let tag = &page[tag_start..tag_end];
    let value_at = tag.find("value=\"")? + "value=\"".len();
    let value_end = value_at + tag[value_at..].find('"')?;
    Some(tag[value_at..value_end].to_string())
}

/// A thrown fault is rendered in the invocation result section.
fn mob_fault(page: &str) -> Option<String> {
    let text = strip_tags(page);
    let at = text.find("Method Invocation Result")?;
    let result = text[at + "Method Invocation Result".len()..].trim();
    if !result.to_lowercase().contains("fault") {
        return None;
    }
    Some(result.chars().take(200).collect::<String>().trim().to_string())
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

pub fn permission_xml(p: &GlobalPermission) -> String {
    format!(
        concat!(
            "<permissions><principal><name>{}</name><group>{}</group></principal>",
            "<roles>{}</roles><propagate>{}</propagate></permissions>"
        ),
        escape(p.principal.as_str()),
        p.group,
        p.role_id,
        p.propagate
    )
}

/// Convert decoded `Permission` records.
pub fn permissions_from_value(v: &Value) -> Vec<GlobalPermission> {
    crate::value::as_list(Some(v))
        .into_iter()
        .filter_map(|p| {
            Some(GlobalPermission {
                principal: p.str_at("principal")?.to_string(),
                group: p.at("group").and_then(scalar_bool).unwrap_or(false),
                role_id: p.i64_at("roleId")?,
                propagate: p.at("propagate").and_then(scalar_bool).unwrap_or(false),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_nonce_either_attribute_order() {
        let page = r#"<form><input name="vmware-session-nonce" type="hidden" value="52a1c0e4-ab"></form>"#;
        assert_eq!(extract_nonce(page).as_deref(), Some("52a1c0e4-ab"));
        let page = r#"<input type="hidden" value="n-2" name="vmware-session-nonce"/>"#;
        assert_eq!(extract_nonce(page).as_deref(), Some("n-2"));
        assert_eq!(extract_nonce("<html>login</html>"), None);
    }

    #[test]
    fn test_mob_fault_detection() {
        let ok = "<h1>Method Invocation Result: void</h1>";
        assert_eq!(mob_fault(ok), None);
        let failed = "<h1>Method Invocation Result</h1><p>com.vmware.vim.binding.vmodl.fault.InvalidArgument</p>";
        assert!(mob_fault(failed).unwrap().contains("InvalidArgument"));
    }

    #[test]
    fn test_permission_xml_escapes_principal() {
        let xml = permission_xml(&GlobalPermission {
            principal: "VSPHERE.LOCAL\\ops&dev".into(),
            group: true,
            role_id: -1,
            propagate: true,
        });
        assert_eq!(
            xml,
            concat!(
                "<permissions><principal><name>VSPHERE.LOCAL\\ops&amp;dev</name><group>true</group></principal>",
                "<roles>-1</roles><propagate>true</propagate></permissions>"
            )
        );
    }

    #[test]
    fn test_permissions_from_decoded_records() {
        let v = json!([
            { "principal": "VSPHERE.LOCAL\\admins", "group": "true", "roleId": "-1", "propagate": "true" },
            { "principal": "alice", "group": "false", "roleId": "1001", "propagate": "false" }
        ]);
        let perms = permissions_from_value(&v);
        assert_eq!(perms.len(), 2);
        assert!(perms[0].group);
        assert_eq!(perms[1].role_id, 1001);
    }
}
