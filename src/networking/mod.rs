use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::Client;
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::engine::models::{AssetManifest, RuntimeStreamMap};
use crate::error::{CloneError, Result};
use crate::util::format_speed;

pub const ASSET_MANIFEST_URL: &str = "https://kamori.goats.dev/Dalamud/Asset/Meta";
pub const RUNTIME_STREAMS_URL: &str = "https://kamori.goats.dev/Dalamud/Release/Meta";

/// Everything the synchronizer and resolver need from the network.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_asset_manifest(&self) -> Result<AssetManifest>;

    async fn fetch_runtime_streams(&self) -> Result<RuntimeStreamMap>;

    /// GET `url` and return the whole body; non-success status is an error.
    async fn download_bytes(&self, url: &str) -> Result<Vec<u8>>;

    /// GET `url` and stream the body into `dest`, creating parent directories.
    async fn download_to_path(&self, url: &str, dest: &Path) -> Result<()>;
}

#[derive(Clone)]
pub struct NetworkClient {
    client: Client,
    asset_manifest_url: String,
    runtime_streams_url: String,
}

impl NetworkClient {
    pub fn new() -> Self {
        Self::with_endpoints(ASSET_MANIFEST_URL, RUNTIME_STREAMS_URL)
    }

    pub fn with_endpoints(asset_manifest_url: &str, runtime_streams_url: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let client = Client::builder()
            .timeout(Duration::from_secs(4 * 60))
            .default_headers(headers)
            .user_agent(concat!("clone-session/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            asset_manifest_url: asset_manifest_url.to_owned(),
            runtime_streams_url: runtime_streams_url.to_owned(),
        }
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CloneError::fetch(url, format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| CloneError::fetch(url, format!("bad status: {e}")))?;
        let text = resp
            .text()
            .await
            .map_err(|e| CloneError::fetch(url, format!("body error: {e}")))?;
        serde_json::from_str(&text).map_err(|e| CloneError::fetch(url, format!("parse error: {e}")))
    }
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSource for NetworkClient {
    async fn fetch_asset_manifest(&self) -> Result<AssetManifest> {
        debug!("network: fetching asset manifest from {}", self.asset_manifest_url);
        self.fetch_json(&self.asset_manifest_url).await
    }

    async fn fetch_runtime_streams(&self) -> Result<RuntimeStreamMap> {
        debug!("network: fetching runtime streams from {}", self.runtime_streams_url);
        self.fetch_json(&self.runtime_streams_url).await
    }

    async fn download_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CloneError::download(url, format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| CloneError::download(url, format!("status error: {e}")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CloneError::download(url, format!("body error: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn download_to_path(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CloneError::download(url, format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| CloneError::download(url, format!("status error: {e}")))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CloneError::io("failed to create download dir", e))?;
        }
        let mut file = File::create(dest)
            .await
            .map_err(|e| CloneError::io(format!("failed to create {}", dest.display()), e))?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let started = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CloneError::download(url, format!("stream error: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CloneError::io(format!("write error on {}", dest.display()), e))?;
            downloaded += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| CloneError::io(format!("flush error on {}", dest.display()), e))?;

        if let Some(total) = total
            && downloaded < total
        {
            return Err(CloneError::download(
                url,
                format!("incomplete: received {downloaded} of {total} bytes"),
            ));
        }

        let secs = started.elapsed().as_secs_f32().max(f32::EPSILON);
        debug!(
            "network: {} -> {} ({} bytes, {})",
            url,
            dest.display(),
            downloaded,
            format_speed(downloaded as f32 / secs)
        );
        Ok(())
    }
}
