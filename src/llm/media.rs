use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::utils::http::get_http_client;
use crate::utils::json::truncate_for_log;

const MEDIA_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const MEDIA_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const MEDIA_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(Url),
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ImageSource {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        match Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => ImageSource::Url(url),
            _ => ImageSource::Path(PathBuf::from(trimmed)),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ImageSource::Url(url) => url.to_string(),
            ImageSource::Path(path) => path.display().to_string(),
            ImageSource::Bytes(bytes) => format!("in-memory image ({} bytes)", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl LoadedImage {
    pub fn from_bytes(bytes: Vec<u8>, declared_mime: Option<&str>) -> Result<Self> {
        let mime_type = detect_mime_type(&bytes)
            .or_else(|| declared_mime.map(str::to_string))
            .ok_or_else(|| anyhow!("Unable to determine the image type"))?;
        if !mime_type.starts_with("image/") {
            return Err(anyhow!("Expected an image but found {}", mime_type));
        }
        Ok(LoadedImage { bytes, mime_type })
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn retry_delay(attempt: usize) -> Duration {
    Duration::from_millis(MEDIA_DOWNLOAD_BASE_DELAY_MS << attempt)
}

pub async fn download_media(url: &Url) -> Result<Vec<u8>> {
    let client = get_http_client();
    let mut last_error = anyhow!("No download attempt was made for {url}");

    for attempt in 0..MEDIA_DOWNLOAD_MAX_ATTEMPTS {
        let is_last = attempt + 1 == MEDIA_DOWNLOAD_MAX_ATTEMPTS;
        let response = match client.get(url.clone()).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch media {url}: {err} (timeout={}, connect={}, attempt={}/{})",
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                let retry = should_retry_error(&err);
                last_error = anyhow!("Failed to fetch {url}: {err}");
                if !retry || is_last {
                    return Err(last_error);
                }
                tokio::time::sleep(retry_delay(attempt)).await;
                continue;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Media download failed for {url} with status {}: {}",
                status,
                truncate_for_log(&body, MEDIA_DOWNLOAD_ERROR_BODY_LIMIT)
            );
            last_error = anyhow!("Download of {url} failed with status {status}");
            if !should_retry_status(status) || is_last {
                return Err(last_error);
            }
            tokio::time::sleep(retry_delay(attempt)).await;
            continue;
        }

        match response.bytes().await {
            Ok(bytes) => return Ok(bytes.to_vec()),
            Err(err) => {
                warn!(
                    "Failed to read media bytes {url}: {err} (attempt={}/{})",
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                last_error = anyhow!("Failed to read {url}: {err}");
                if is_last {
                    return Err(last_error);
                }
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }
    }

    Err(last_error)
}

pub async fn load_image(source: &ImageSource, max_bytes: usize) -> Result<LoadedImage> {
    let bytes = match source {
        ImageSource::Url(url) => download_media(url).await?,
        ImageSource::Path(path) => tokio::fs::read(path)
            .await
            .map_err(|err| anyhow!("Failed to read image '{}': {}", path.display(), err))?,
        ImageSource::Bytes(bytes) => bytes.clone(),
    };

    if bytes.is_empty() {
        return Err(anyhow!("Image '{}' is empty", source.label()));
    }
    if bytes.len() > max_bytes {
        return Err(anyhow!(
            "Image '{}' is {} bytes, above the {} byte limit",
            source.label(),
            bytes.len(),
            max_bytes
        ));
    }

    debug!("Loaded {} bytes from {}", bytes.len(), source.label());
    LoadedImage::from_bytes(bytes, None)
}
