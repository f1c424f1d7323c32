//! Byte transports used by the fetcher.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Failure of a single transfer attempt.
#[derive(Debug, Error)]
pub enum TransportError {
  /// The server answered with a non-success status.
  #[error("HTTP {0}")]
  Status(u16),

  /// Connection, TLS, timeout or body errors.
  #[error("network error: {0}")]
  Network(String),

  /// A `file://` URL could not be read.
  #[error("failed to read {path}: {source}")]
  File {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid url '{0}'")]
  InvalidUrl(String),
}

impl TransportError {
  /// Whether another attempt may succeed.
  ///
  /// Server errors and network failures are transient; client
  /// errors and local file problems are not.
  pub fn is_retryable(&self) -> bool {
    match self {
      TransportError::Status(code) => *code >= 500,
      TransportError::Network(_) => true,
      TransportError::File { .. } | TransportError::InvalidUrl(_) => false,
    }
  }
}

/// Downloads the bytes behind a URL.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// HTTP(S) transport backed by reqwest; also serves `file://` URLs for local mirrors.
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self, TransportError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| TransportError::Network(e.to_string()))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| TransportError::InvalidUrl(url.to_string()))?;

    if parsed.scheme() == "file" {
      let path = parsed
        .to_file_path()
        .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
      debug!(path = %path.display(), "reading file url");
      return tokio::fs::read(&path).await.map_err(|source| TransportError::File {
        path: path.display().to_string(),
        source,
      });
    }

    let response = self
      .client
      .get(parsed)
      .send()
      .await
      .map_err(|e| TransportError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(TransportError::Status(status.as_u16()));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| TransportError::Network(e.to_string()))?;
    Ok(bytes.to_vec())
  }
}
