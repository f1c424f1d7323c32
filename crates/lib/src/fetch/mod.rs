//! Source fetching with a content-addressed cache.
//!
//! URL sources are downloaded once per (url, checksum) pair into
//! `<cache_dir>/sources/<key>/<filename>` and verified against the recipe's
//! checksum both after download and on every cache hit. Bytes that fail
//! verification never reach the cache. Local path sources are hashed in place.

mod transport;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::recipe::{Checksum, SourceRef};
use crate::util::hash::{DirHashError, HashAlgorithm, ObjectHash, hash_bytes, hash_directory, hash_file};

pub use transport::{HttpTransport, Transport, TransportError};

/// Errors that can occur while fetching a source.
#[derive(Debug, Error)]
pub enum FetchError {
  /// The transfer failed, after retries when the failure was transient.
  #[error("fetch failed for {url} after {attempts} attempt(s): {source}")]
  Network {
    url: String,
    attempts: u32,
    #[source]
    source: TransportError,
  },

  /// Downloaded bytes do not match the recipe's checksum.
  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    url: String,
    expected: Checksum,
    actual: String,
  },

  #[error("source path {0} does not exist")]
  MissingPath(PathBuf),

  #[error("failed to initialize HTTP client: {0}")]
  Client(#[source] TransportError),

  #[error(transparent)]
  Hash(#[from] DirHashError),

  #[error("cache error at {path}: {source}")]
  Cache {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Retry and timeout settings for downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
  /// Total attempts per download, including the first.
  pub attempts: u32,
  /// Delay before the first retry; doubles on every further retry.
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  /// Per-request timeout.
  pub timeout: Duration,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      attempts: 3,
      initial_backoff: Duration::from_millis(500),
      max_backoff: Duration::from_secs(8),
      timeout: Duration::from_secs(300),
    }
  }
}

/// What a fetched source contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
  /// A single file, normally an archive.
  File,
  /// A directory tree.
  Directory,
}

/// A verified local copy of a recipe's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
  pub path: PathBuf,
  pub kind: SourceKind,
  /// `<algorithm>:<hex>` digest of the source content.
  pub content_hash: String,
  /// True when no transfer was needed.
  pub from_cache: bool,
}

/// Fetches and verifies recipe sources.
pub struct Fetcher {
  cache_dir: PathBuf,
  transport: Arc<dyn Transport>,
  config: FetchConfig,
  /// One lock per cache key so concurrent fetches of the same source share a transfer.
  inflight: Mutex<HashMap<ObjectHash, Arc<tokio::sync::Mutex<()>>>>,
}

impl Fetcher {
  /// Create a fetcher using the default HTTP transport.
  pub fn new(cache_dir: impl Into<PathBuf>, config: FetchConfig) -> Result<Self, FetchError> {
    let transport = HttpTransport::new(config.timeout).map_err(FetchError::Client)?;
    Ok(Self::with_transport(cache_dir, config, Arc::new(transport)))
  }

  pub fn with_transport(cache_dir: impl Into<PathBuf>, config: FetchConfig, transport: Arc<dyn Transport>) -> Self {
    Self {
      cache_dir: cache_dir.into(),
      transport,
      config,
      inflight: Mutex::new(HashMap::new()),
    }
  }

  pub fn cache_dir(&self) -> &Path {
    &self.cache_dir
  }

  /// Cache location of a URL source.
  pub fn cache_path(&self, url: &str, checksum: &Checksum) -> PathBuf {
    self
      .cache_dir
      .join("sources")
      .join(cache_key(url, checksum).0)
      .join(url_to_filename(url))
  }

  /// Fetch a source, verifying its content hash.
  ///
  /// Fetching an already verified (url, checksum) pair again is a cache hit and
  /// performs no transfer.
  pub async fn fetch(&self, source: &SourceRef) -> Result<FetchedSource, FetchError> {
    match source {
      SourceRef::Url { url, checksum } => self.fetch_url(url, checksum).await,
      SourceRef::Path { path } => fetch_path(path).await,
    }
  }

  /// The content hash a source will have once fetched.
  ///
  /// URL sources are identified by their declared checksum, so this needs no
  /// transfer. Path sources are hashed in place.
  pub async fn source_hash(&self, source: &SourceRef) -> Result<String, FetchError> {
    match source {
      SourceRef::Url { checksum, .. } => Ok(checksum.to_string()),
      SourceRef::Path { path } => Ok(fetch_path(path).await?.content_hash),
    }
  }

  async fn fetch_url(&self, url: &str, checksum: &Checksum) -> Result<FetchedSource, FetchError> {
    let key = cache_key(url, checksum);
    let _guard = self.lock_key(key).await;

    let dest = self.cache_path(url, checksum);

    if fs::try_exists(&dest).await.unwrap_or(false) {
      let actual = hash_file_blocking(dest.clone(), checksum.algorithm).await?;
      if actual == checksum.value {
        info!(url = %url, path = %dest.display(), "source cache hit");
        return Ok(FetchedSource {
          path: dest,
          kind: SourceKind::File,
          content_hash: checksum.to_string(),
          from_cache: true,
        });
      }
      warn!(
        url = %url,
        expected = %checksum.value,
        actual = %actual,
        "cached source corrupted, refetching"
      );
      fs::remove_file(&dest).await.map_err(|source| FetchError::Cache {
        path: dest.clone(),
        source,
      })?;
    }

    info!(url = %url, "fetching source");
    let bytes = self.download(url).await?;

    let actual = hash_bytes(&bytes, checksum.algorithm);
    if actual.0 != checksum.value {
      return Err(FetchError::ChecksumMismatch {
        url: url.to_string(),
        expected: checksum.clone(),
        actual: actual.0,
      });
    }

    store(&dest, &bytes).await?;
    info!(url = %url, path = %dest.display(), size = bytes.len(), "source verified and cached");

    Ok(FetchedSource {
      path: dest,
      kind: SourceKind::File,
      content_hash: checksum.to_string(),
      from_cache: false,
    })
  }

  /// Download with bounded retries and exponential backoff for transient failures.
  async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
    let attempts = self.config.attempts.max(1);
    let mut delay = self.config.initial_backoff;
    let mut attempt = 0;

    loop {
      attempt += 1;
      match self.transport.get(url).await {
        Ok(bytes) => return Ok(bytes),
        Err(e) if e.is_retryable() && attempt < attempts => {
          warn!(url = %url, attempt, error = %e, delay_ms = delay.as_millis() as u64, "download failed, retrying");
          tokio::time::sleep(delay).await;
          delay = (delay * 2).min(self.config.max_backoff);
        }
        Err(source) => {
          return Err(FetchError::Network {
            url: url.to_string(),
            attempts: attempt,
            source,
          });
        }
      }
    }
  }

  async fn lock_key(&self, key: ObjectHash) -> InflightGuard<'_> {
    let lock = {
      let mut inflight = self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
      inflight.entry(key.clone()).or_default().clone()
    };
    InflightGuard {
      inflight: &self.inflight,
      key,
      guard: Some(lock.lock_owned().await),
    }
  }
}

/// Holds a per-key fetch lock. The map entry is removed when its last user lets go.
struct InflightGuard<'a> {
  inflight: &'a Mutex<HashMap<ObjectHash, Arc<tokio::sync::Mutex<()>>>>,
  key: ObjectHash,
  guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for InflightGuard<'_> {
  fn drop(&mut self) {
    drop(self.guard.take());
    let mut inflight = self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if inflight.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
      inflight.remove(&self.key);
    }
  }
}

/// Version-control metadata left out of directory source hashes.
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// Cache key for a (url, checksum) pair.
fn cache_key(url: &str, checksum: &Checksum) -> ObjectHash {
  ObjectHash::of_parts(&[url, checksum.algorithm.as_str(), &checksum.value])
}

async fn fetch_path(path: &Path) -> Result<FetchedSource, FetchError> {
  let metadata = fs::metadata(path)
    .await
    .map_err(|_| FetchError::MissingPath(path.to_path_buf()))?;

  let owned = path.to_path_buf();
  let (kind, hash) = if metadata.is_dir() {
    let hash = tokio::task::spawn_blocking(move || hash_directory(&owned, VCS_DIRS))
      .await
      .map_err(|e| join_error(path, e))??;
    (SourceKind::Directory, hash)
  } else {
    let hash = hash_file_blocking(owned, HashAlgorithm::Sha256).await?;
    (SourceKind::File, crate::util::hash::ContentHash(hash))
  };

  debug!(path = %path.display(), hash = %hash, "hashed local source");
  Ok(FetchedSource {
    path: path.to_path_buf(),
    kind,
    content_hash: format!("{}:{}", HashAlgorithm::Sha256, hash.0),
    from_cache: true,
  })
}

async fn hash_file_blocking(path: PathBuf, algorithm: HashAlgorithm) -> Result<String, FetchError> {
  let display = path.clone();
  let hash = tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
    .await
    .map_err(|e| join_error(&display, e))??;
  Ok(hash.0)
}

fn join_error(path: &Path, e: tokio::task::JoinError) -> FetchError {
  FetchError::Cache {
    path: path.to_path_buf(),
    source: std::io::Error::other(e),
  }
}

/// Write verified bytes next to `dest` and rename into place.
async fn store(dest: &Path, bytes: &[u8]) -> Result<(), FetchError> {
  let cache_err = |path: &Path| {
    let path = path.to_path_buf();
    move |source| FetchError::Cache { path, source }
  };

  let dir = dest.parent().unwrap_or(dest);
  fs::create_dir_all(dir).await.map_err(cache_err(dir))?;

  let partial = dest.with_file_name(format!(
    ".{}.part",
    dest.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
  ));
  if let Err(e) = fs::write(&partial, bytes).await {
    let _ = fs::remove_file(&partial).await;
    return Err(cache_err(&partial)(e));
  }
  fs::rename(&partial, dest).await.map_err(cache_err(dest))
}

/// Convert a URL to a safe filename, keeping the archive extension.
///
/// Takes the last path component and sanitizes it. Falls back to a hash of the
/// URL if no suitable filename can be extracted.
fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.split(['?', '#']).next().and_then(|u| u.rsplit('/').next()) {
    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  format!("download_{}", ObjectHash::of_parts(&[url]).0)
}
