//! Hatrac object store over HTTP.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::error::StoreError;
use super::traits::ObjectStore;

/// Object store backed by a Hatrac server.
///
/// Locations may be absolute URLs or server-relative paths
/// (`/hatrac/...`), which are resolved against `base_url`.
pub struct HatracStore {
    client: Client,
    base_url: String,
    cookie: Option<String>,
}

impl HatracStore {
    pub fn new(
        base_url: impl Into<String>,
        cookie: Option<String>,
        transfer_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .user_agent(format!("imaging-worker/{}", env!("CARGO_PKG_VERSION")))
            .timeout(transfer_timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cookie,
        })
    }

    fn resolve(&self, location: &str) -> Result<String, StoreError> {
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(location.to_string())
        } else if location.starts_with('/') {
            Ok(format!("{}{}", self.base_url, location))
        } else {
            Err(StoreError::InvalidLocation(location.to_string()))
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.cookie {
            Some(cookie) => request.header("Cookie", cookie),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HatracStore {
    fn name(&self) -> &str {
        "hatrac"
    }

    async fn fetch(&self, location: &str, dest: &Path) -> Result<u64, StoreError> {
        let url = self.resolve(location)?;
        debug!("Hatrac GET {}", url);

        let mut response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| StoreError::from_reqwest(location, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(StoreError::NotFound(location.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                location: location.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| StoreError::from_reqwest(location, e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn upload(&self, source: &Path, path: &str) -> Result<String, StoreError> {
        let url = format!("{}?parents=true", self.resolve(path)?);
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        debug!("Hatrac PUT {} ({} bytes)", url, length);

        // Artifacts can run to gigabytes; stream them from disk.
        let response = self
            .authorized(self.client.put(&url))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, length)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| StoreError::from_reqwest(path, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                location: path.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        // Hatrac answers with the versioned object path.
        let location = response.text().await.unwrap_or_default();
        let location = location.trim();
        if location.is_empty() {
            Ok(path.to_string())
        } else {
            Ok(location.to_string())
        }
    }
}
