//! Shared template image cache.
//!
//! Template images are downloaded once into `<cache dir>/<entry name>` and
//! copied into each VM that needs them. The entry name pairs a digest of the
//! full locator with its file name, so templates sharing a file name never
//! share an entry. The entry's modification time is its
//! last-refresh timestamp; entries older than the freshness window are
//! refreshed lazily on the next request.
//!
//! Concurrent requests for the same entry share one download: the first
//! caller takes the entry's lock and downloads, later callers wait on the lock
//! and then find a fresh entry. Downloads land in `<name>.part` and are renamed
//! into place, so a reader never sees a partial image.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::keyed_lock::KeyedLocks;

/// Freshness window used when none is configured, or the value is unparsable.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default total deadline for a single template download.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse a freshness window given in seconds.
///
/// Unset, blank or unparsable values fall back to [`DEFAULT_FRESHNESS`].
/// `0` is honored and means "always refresh".
pub fn parse_freshness(value: Option<&str>) -> Duration {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => match v.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(value = %v, "Invalid cache freshness, using default");
                DEFAULT_FRESHNESS
            }
        },
        None => DEFAULT_FRESHNESS,
    }
}

/// Cache entry name for a locator: its last path segment, without query or
/// fragment.
pub fn canonical_name(locator: &str) -> Result<String> {
    let end = locator.find(['?', '#']).unwrap_or(locator.len());
    let mut path = &locator[..end];
    if let Some((_, rest)) = path.split_once("://") {
        // Drop the authority; a bare host has no file name.
        path = rest.split_once('/').map(|(_, p)| p).unwrap_or_default();
    }
    let name = path.rsplit('/').next().unwrap_or_default();

    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::Validation(format!(
            "template locator '{}' has no file name",
            locator
        )));
    }
    Ok(name.to_string())
}

/// Local source path for `file://` and absolute-path locators.
fn local_source(locator: &str) -> Option<&Path> {
    if let Some(rest) = locator.strip_prefix("file://") {
        return Some(Path::new(rest));
    }
    if locator.starts_with('/') {
        return Some(Path::new(locator));
    }
    None
}

/// Hex digits of the locator digest kept in an entry name.
const ENTRY_DIGEST_LEN: usize = 16;

/// Cache entry name for a locator: `<digest>-<canonical name>`.
///
/// The digest covers the whole locator without its fragment, so two URLs
/// ending in the same file name map to different entries.
pub fn entry_name(locator: &str) -> Result<String> {
    let name = canonical_name(locator)?;
    let source = locator.trim();
    let source = source.split_once('#').map(|(s, _)| s).unwrap_or(source);
    let digest = hex::encode(Sha256::digest(source.as_bytes()));
    Ok(format!("{}-{}", &digest[..ENTRY_DIGEST_LEN], name))
}

/// Downloads a template into a local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Write the content behind `locator` to `destination`, creating or
    /// truncating it. Returns the number of bytes written.
    async fn fetch(&self, locator: &str, destination: &Path) -> Result<u64>;
}

/// Production fetcher: HTTP(S) via reqwest, local paths via copy.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Build a fetcher whose downloads must finish within `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DownloadFailed {
                locator: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, timeout })
    }

    fn transport_error(&self, locator: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                operation: format!("download of '{}'", locator),
                after: self.timeout,
            }
        } else {
            Error::DownloadFailed {
                locator: locator.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, destination), fields(locator = %locator))]
    async fn fetch(&self, locator: &str, destination: &Path) -> Result<u64> {
        if let Some(source) = local_source(locator) {
            debug!(source = %source.display(), "Copying local template");
            return tokio::fs::copy(source, destination)
                .await
                .map_err(|e| Error::DownloadFailed {
                    locator: locator.to_string(),
                    reason: e.to_string(),
                });
        }

        let response = self
            .client
            .get(locator)
            .send()
            .await
            .map_err(|e| self.transport_error(locator, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::DownloadFailed {
                locator: locator.to_string(),
                reason: format!("server returned {}", status),
            });
        }

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| Error::io(format!("Failed to create '{}'", destination.display()), e))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.transport_error(locator, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io(format!("Failed to write '{}'", destination.display()), e))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| Error::io(format!("Failed to flush '{}'", destination.display()), e))?;

        Ok(written)
    }
}

/// Template image cache.
pub struct ImageCache {
    cache_dir: Option<PathBuf>,
    freshness: Duration,
    fetcher: Arc<dyn Fetcher>,
    locks: KeyedLocks,
}

impl ImageCache {
    /// Create a cache. `None` for `cache_dir` disables caching: every
    /// request downloads straight to its destination.
    pub fn new(cache_dir: Option<PathBuf>, freshness: Duration, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            cache_dir,
            freshness,
            fetcher,
            locks: KeyedLocks::new(),
        }
    }

    /// Path of the cache entry for `locator`, if caching is enabled.
    pub fn entry_path(&self, locator: &str) -> Result<Option<PathBuf>> {
        match &self.cache_dir {
            Some(dir) => Ok(Some(dir.join(entry_name(locator)?))),
            None => Ok(None),
        }
    }

    /// Materialize `locator` at `destination` with permission bits `mode`.
    #[instrument(skip(self, destination), fields(locator = %locator, destination = %destination.display()))]
    pub async fn resolve(&self, locator: &str, destination: &Path, mode: u32) -> Result<()> {
        let cache_dir = match &self.cache_dir {
            Some(dir) => dir,
            None => {
                debug!("Image cache disabled, downloading directly");
                let temp = part_path(destination);
                self.download(locator, &temp, destination).await?;
                return set_mode(destination, mode).await;
            }
        };

        let name = entry_name(locator)?;
        let entry = cache_dir.join(&name);

        if self.is_fresh(&entry).await? {
            debug!("Serving template from cache");
        } else {
            let _guard = self.locks.lock(&name).await;

            // Another caller may have refreshed the entry while we waited.
            if self.is_fresh(&entry).await? {
                debug!("Template refreshed by a concurrent request");
            } else {
                tokio::fs::create_dir_all(cache_dir).await.map_err(|e| {
                    Error::io(format!("Failed to create cache directory '{}'", cache_dir.display()), e)
                })?;
                info!("Refreshing cached template");
                self.download(locator, &cache_dir.join(format!("{}.part", name)), &entry)
                    .await?;
            }
        }

        install(&entry, destination, mode).await
    }

    /// Whether a cache entry exists and is younger than the freshness window.
    pub async fn is_fresh(&self, entry: &Path) -> Result<bool> {
        if self.freshness.is_zero() {
            return Ok(false);
        }

        let metadata = match tokio::fs::metadata(entry).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(Error::io(
                    format!("Failed to inspect cache entry '{}'", entry.display()),
                    e,
                ))
            }
        };

        let modified = metadata
            .modified()
            .map_err(|e| Error::io(format!("No modification time for '{}'", entry.display()), e))?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);

        Ok(age < self.freshness)
    }

    /// Fetch into `temp`, then rename onto `target`. `temp` never survives a
    /// failed download.
    async fn download(&self, locator: &str, temp: &Path, target: &Path) -> Result<()> {
        let bytes = match self.fetcher.fetch(locator, temp).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(temp).await;
                warn!(error = %e, "Template download failed");
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(temp, target).await {
            let _ = tokio::fs::remove_file(temp).await;
            return Err(Error::io(format!("Failed to publish '{}'", target.display()), e));
        }

        info!(bytes, path = %target.display(), "Template downloaded");
        Ok(())
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Copy a cache entry to `destination` through a temporary file.
async fn install(entry: &Path, destination: &Path, mode: u32) -> Result<()> {
    let temp = part_path(destination);

    if let Err(e) = tokio::fs::copy(entry, &temp).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(Error::io(
            format!("Failed to copy '{}' to '{}'", entry.display(), temp.display()),
            e,
        ));
    }
    if let Err(e) = set_mode(&temp, mode).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&temp, destination).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(Error::io(format!("Failed to publish '{}'", destination.display()), e));
    }

    debug!(destination = %destination.display(), "Template installed");
    Ok(())
}

async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| Error::PermissionError {
            path: path.to_path_buf(),
            source: e,
        })
}
