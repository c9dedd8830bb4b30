use std::io::Cursor;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

const MAX_MATRIX_FILE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub data: Vec<u8>,
    pub content_type: String,
    pub filename: String,
    pub size: usize,
}

/// The `info` block attached to avatars and images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub size: usize,
    pub mimetype: String,
}

impl ImageInfo {
    pub fn to_json(&self) -> Value {
        json!({
            "w": self.width,
            "h": self.height,
            "size": self.size,
            "mimetype": self.mimetype,
        })
    }
}

impl MediaInfo {
    /// Decodes the image header for dimensions; the mime type is sniffed from the data
    /// when the server did not send an `image/*` content type.
    pub fn image_info(&self) -> Result<ImageInfo> {
        let (width, height) = image::ImageReader::new(Cursor::new(&self.data))
            .with_guessed_format()?
            .into_dimensions()
            .map_err(|e| anyhow!("failed to read image dimensions of {}: {}", self.filename, e))?;

        let mimetype = if self.content_type.starts_with("image/") {
            self.content_type.clone()
        } else {
            image::guess_format(&self.data)
                .map(|format| format.to_mime_type().to_string())
                .unwrap_or_else(|_| "application/octet-stream".to_string())
        };

        Ok(ImageInfo {
            width,
            height,
            size: self.size,
            mimetype,
        })
    }
}

/// Retrieves remote media referenced by source metadata or messages.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<MediaInfo>;
}

pub struct MediaHandler {
    client: Client,
}

impl Default for MediaHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaHandler {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub async fn download_from_url(&self, url: &str) -> Result<MediaInfo> {
        debug!("downloading media from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("failed to download from {}: {}", url, e))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to download from {}: status {}",
                url,
                response.status()
            ));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let data = response
            .bytes()
            .await
            .map_err(|e| anyhow!("failed to read response body: {}", e))?
            .to_vec();

        let size = data.len();
        if size > MAX_MATRIX_FILE_SIZE {
            warn!("media too large for matrix: {} bytes from {}", size, url);
            return Err(anyhow!(
                "file too large for Matrix: {} bytes (max {})",
                size,
                MAX_MATRIX_FILE_SIZE
            ));
        }

        debug!("downloaded {} bytes from {}", size, url);

        Ok(MediaInfo {
            data,
            content_type,
            filename: filename_from_url(url),
            size,
        })
    }
}

#[async_trait]
impl MediaFetcher for MediaHandler {
    async fn fetch(&self, url: &str) -> Result<MediaInfo> {
        self.download_from_url(url).await
    }
}

fn filename_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

/// Resolves an `mxc://server/media` URI to a plain download URL on the homeserver.
pub fn mxc_to_http(homeserver_url: &str, mxc: &str) -> Option<String> {
    let path = mxc.strip_prefix("mxc://")?;
    let (server, media_id) = path.split_once('/')?;
    if server.is_empty() || media_id.is_empty() {
        return None;
    }
    Some(format!(
        "{}/_matrix/media/v3/download/{}/{}",
        homeserver_url.trim_end_matches('/'),
        server,
        media_id
    ))
}
