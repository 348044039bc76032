use std::path::Path;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use url::Url;

use crate::upstream::join_under;

pub const ASSET_UPLOAD_PATH: &str = "/api/assets";
pub const ASSET_FORM_KEY: &str = "assetData";

/// Something that can take a finished local file off our hands.
#[async_trait]
pub trait AssetUploader: Send + Sync {
    async fn upload_asset(&self, path: &Path) -> Result<()>;
}

/// Body returned by `POST /api/assets`.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetUploadResponse {
    pub id: String,
    pub status: String,
}

/// Immich REST client authenticating with an API key.
#[derive(Debug)]
pub struct ImmichClient {
    base_url: Url,
    device_id: String,
    client: reqwest::Client,
}

impl ImmichClient {
    pub fn new(base_url: Url, api_key: &str, device_id: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key).context("invalid API key characters")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url,
            device_id: device_id.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Url {
        join_under(&self.base_url, path, None)
    }

    /// `POST /api/assets`. A duplicate is reported by Immich as success.
    pub async fn upload(&self, path: &Path) -> Result<AssetUploadResponse> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("unable to get file info: {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("file name is not valid UTF-8: {}", path.display()))?
            .to_string();

        let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        let created = metadata.created().unwrap_or(modified);
        let modified: DateTime<Utc> = modified.into();
        let created: DateTime<Utc> = created.into();

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("unable to open file: {}", path.display()))?;
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let part = Part::stream_with_length(reqwest::Body::from(file), metadata.len())
            .file_name(file_name.clone())
            .mime_str(mime.as_ref())
            .context("invalid file content type")?;

        let form = Form::new()
            .text(
                "deviceAssetId",
                device_asset_id(&file_name, metadata.len(), modified),
            )
            .text("deviceId", self.device_id.clone())
            .text(
                "fileCreatedAt",
                created.to_rfc3339_opts(SecondsFormat::Millis, true),
            )
            .text(
                "fileModifiedAt",
                modified.to_rfc3339_opts(SecondsFormat::Millis, true),
            )
            .part(ASSET_FORM_KEY, part);

        let resp = self
            .client
            .post(self.url(ASSET_UPLOAD_PATH))
            .multipart(form)
            .send()
            .await
            .context("failed to reach Immich server")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "Immich {ASSET_UPLOAD_PATH} returned HTTP {}: {}",
                status.as_u16(),
                body.trim()
            );
        }

        let body = resp
            .bytes()
            .await
            .context("failed to read asset upload response")?;
        serde_json::from_slice(&body).context("failed to parse asset upload response")
    }
}

#[async_trait]
impl AssetUploader for ImmichClient {
    async fn upload_asset(&self, path: &Path) -> Result<()> {
        let uploaded = self.upload(path).await?;
        tracing::debug!(
            path = %path.display(),
            asset_id = %uploaded.id,
            status = %uploaded.status,
            "asset uploaded"
        );
        Ok(())
    }
}

fn device_asset_id(file_name: &str, size: u64, modified: DateTime<Utc>) -> String {
    format!("{file_name}-{size}-{}", modified.timestamp())
}
