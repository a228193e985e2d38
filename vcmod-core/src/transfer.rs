//! Datastore and firmware file transfer over plain HTTPS.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use url::form_urlencoded::byte_serialize;

use crate::api::FileTransfer;
use crate::error::{Error, Result};
use crate::http::{Transport, status_error};

/// Build the `/folder/` path for a datastore file.
///
/// Ampersands in the datacenter name are escaped before the query string
/// is encoded, so they reach the server double-encoded.
pub fn datastore_url(datastore: &str, datacenter: &str, path: &str, stream_vmdk: bool) -> String {
    let path = path.trim_start_matches('/');
    let encoded_path: String = path
        .split('/')
        .map(|seg| byte_serialize(seg.as_bytes()).collect::<String>().replace('+', "%20"))
        .collect::<Vec<_>>()
        .join("/");
    let dc = datacenter.replace('&', "%26");
    let mut url = format!(
        "/folder/{encoded_path}?dcPath={}&dsName={}",
        byte_serialize(dc.as_bytes()).collect::<String>(),
        byte_serialize(datastore.as_bytes()).collect::<String>()
    );
    if stream_vmdk {
        url.push_str("&diskFormat=StreamVmdk");
    }
    url
}

/// Substitute the `*` host placeholder of a firmware URL.
pub fn firmware_url(url: &str, host_name: &str) -> String {
    url.replacen('*', host_name, 1)
}

pub struct HttpTransfer {
    http: Arc<Transport>,
}

impl HttpTransfer {
    pub fn new(http: Arc<Transport>) -> Self {
        Self { http }
    }

    fn resolve(&self, url: &str) -> Result<url::Url> {
        if url.starts_with("http://") || url.starts_with("https://") {
            url::Url::parse(url).map_err(|e| Error::InvalidArgument(format!("invalid URL '{url}': {e}")))
        } else {
            self.http.url(url)
        }
    }

    fn check(&self, status: StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(self.http.endpoint(), status, ""))
        }
    }
}

#[async_trait]
impl FileTransfer for HttpTransfer {
    async fn exists(&self, url_path: &str) -> Result<bool> {
        let response = self
            .http
            .client()
            .head(self.resolve(url_path)?)
            .send()
            .await
            .map_err(|e| self.http.classify(e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status => self.check(status).map(|_| true),
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .http
            .client()
            .get(self.resolve(url)?)
            .send()
            .await
            .map_err(|e| self.http.classify(e))?;
        self.check(response.status())?;

        let mut file = File::create(dest)
            .await
            .map_err(|e| Error::InvalidArgument(format!("cannot create {}: {e}", dest.display())))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.http.classify(e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Internal(format!("writing {}: {e}", dest.display())))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| Error::Internal(format!("writing {}: {e}", dest.display())))?;
        info!(dest = %dest.display(), bytes = written, "Download complete");
        Ok(written)
    }

    async fn upload(&self, url: &str, source: &Path, timeout: Duration) -> Result<()> {
        let file = File::open(source)
            .await
            .map_err(|e| Error::InvalidArgument(format!("cannot open {}: {e}", source.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::InvalidArgument(format!("cannot stat {}: {e}", source.display())))?
            .len();
        debug!(source = %source.display(), bytes = size, "Uploading");
        let response = self
            .http
            .client()
            .put(self.resolve(url)?)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .timeout(timeout)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| self.http.classify(e))?;
        self.check(response.status())
    }

    async fn put_bytes(&self, url_path: &str, bytes: Vec<u8>) -> Result<()> {
        let response = self
            .http
            .client()
            .put(self.resolve(url_path)?)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| self.http.classify(e))?;
        self.check(response.status())
    }

    async fn delete(&self, url_path: &str) -> Result<()> {
        let response = self
            .http
            .client()
            .delete(self.resolve(url_path)?)
            .send()
            .await
            .map_err(|e| self.http.classify(e))?;
        self.check(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datastore_url_double_encodes_ampersand() {
        let url = datastore_url("ds1", "R&D", "isos/rhel 9.iso", false);
        assert_eq!(url, "/folder/isos/rhel%209.iso?dcPath=R%2526D&dsName=ds1");
    }

    #[test]
    fn test_datastore_url_stream_vmdk() {
        let url = datastore_url("ds1", "DC0", "/vm/disk.vmdk", true);
        assert_eq!(
            url,
            "/folder/vm/disk.vmdk?dcPath=DC0&dsName=ds1&diskFormat=StreamVmdk"
        );
    }

    #[test]
    fn test_firmware_placeholder() {
        assert_eq!(
            firmware_url("https://*/downloads/5f/configBundle.tgz", "esxi01.lab"),
            "https://esxi01.lab/downloads/5f/configBundle.tgz"
        );
    }
}
