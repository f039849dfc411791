//! Transient image downloads.
//!
//! Images referenced by `{img:...}` markers (or embed media fields) are
//! pulled into a scratch directory, attached to the outbound request, and
//! released once the dispatch attempt resolves either way.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const DOWNLOAD_TIMEOUT_SECS: u64 = 10;
/// Webhook services reject oversized attachments; stay well under.
const MAX_IMAGE_BYTES: u64 = 8 * 1024 * 1024;

/// A downloaded image sitting in the scratch directory.
#[derive(Debug)]
pub struct DownloadedImage {
    pub path: PathBuf,
    /// Attachment name used in the multipart request and in
    /// `attachment://` references.
    pub file_name: String,
    /// The URL it was fetched from, for rewriting embed references.
    pub source_url: String,
}

impl DownloadedImage {
    /// Remove the scratch file. Safe to call more than once.
    pub fn release(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "failed to remove scratch image");
            }
        }
    }
}

/// Downloads images into a per-process scratch directory.
pub struct ImageFetcher {
    client: Client,
    dir: PathBuf,
}

impl ImageFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            // Some image hosts refuse requests without a browser-like agent.
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build image client with defaults: {}", e);
                Client::new()
            });
        Self { client, dir: std::env::temp_dir().join("hookflow_images") }
    }

    /// Download one image. The file name is derived from a digest of the
    /// URL plus its apparent extension, so distinct URLs never collide.
    pub async fn fetch(&self, url: &str) -> Result<DownloadedImage> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("image request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Fetch(format!(
                "image request to {} returned {}",
                url,
                response.status()
            )));
        }

        let extension = extension_for(url, response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Fetch(format!("image download from {} failed: {}", url, e)))?;

        if bytes.len() as u64 > MAX_IMAGE_BYTES {
            return Err(Error::Fetch(format!(
                "image from {} is too large ({} bytes)",
                url,
                bytes.len()
            )));
        }

        let digest = Sha256::digest(url.as_bytes());
        let file_name = format!("image_{:02x}{:02x}{:02x}{:02x}.{}",
            digest[0], digest[1], digest[2], digest[3], extension);
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, &bytes).await?;

        debug!(url, file = %file_name, size = bytes.len(), "image downloaded");
        Ok(DownloadedImage { path, file_name, source_url: url.to_string() })
    }
}

impl Default for ImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick an extension from the URL path, falling back to the response
/// content type.
fn extension_for(url: &str, headers: &reqwest::header::HeaderMap) -> String {
    let path_ext = url
        .split(&['?', '#'][..])
        .next()
        .and_then(|p| p.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext))
        .filter(|ext| ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = path_ext {
        return ext.to_lowercase();
    }

    match headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
    {
        t if t.contains("jpeg") => "jpg".to_string(),
        t if t.contains("gif") => "gif".to_string(),
        t if t.contains("webp") => "webp".to_string(),
        _ => "png".to_string(),
    }
}
