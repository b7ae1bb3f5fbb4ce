//! Scheme-restricted feed fetching.
//!
//! Only two sources are accepted: `https` URLs, and `file` URLs that resolve
//! under a configured root. Everything else is rejected before any I/O.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use url::Url;

/// Error type for feed fetching.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// URL did not parse.
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    /// Scheme is neither `https` nor an allowed `file` path.
    #[error("Disallowed feed scheme: {0}")]
    DisallowedScheme(String),
    /// Local path escapes the allowed root.
    #[error("Feed path outside allowed root: {0}")]
    OutsideRoot(PathBuf),
    /// Feed exceeds the byte cap.
    #[error("Feed exceeds {limit} bytes")]
    TooLarge {
        /// Configured cap.
        limit: usize,
    },
    /// Network or HTTP status failure.
    #[error("Network error: {0}")]
    Network(String),
    /// Local read failure.
    #[error("I/O error: {0}")]
    Io(String),
    /// Source kind not handled by this fetcher.
    #[error("No fetcher configured for {0}")]
    Unsupported(String),
}

/// A validated feed location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    /// Remote feed over TLS.
    Remote(Url),
    /// Local feed, lexically inside the allowed root.
    Local(PathBuf),
}

impl FeedSource {
    /// Validate a feed URL against the scheme policy.
    ///
    /// `file` URLs are only accepted when `allowed_root` is set, and the path
    /// must be absolute, free of `..` components, and under the root. The
    /// fetcher re-checks after resolving symlinks.
    pub fn parse(raw: &str, allowed_root: Option<&Path>) -> Result<Self, FetchError> {
        let url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl(format!("{raw}: {e}")))?;
        match url.scheme() {
            "https" => Ok(Self::Remote(url)),
            "file" => {
                let Some(root) = allowed_root else {
                    return Err(FetchError::DisallowedScheme("file".to_string()));
                };
                let path = url
                    .to_file_path()
                    .map_err(|_| FetchError::InvalidUrl(raw.to_string()))?;
                let escapes = path.components().any(|c| matches!(c, Component::ParentDir));
                if escapes || !path.starts_with(root) {
                    return Err(FetchError::OutsideRoot(path));
                }
                Ok(Self::Local(path))
            }
            other => Err(FetchError::DisallowedScheme(other.to_string())),
        }
    }
}

/// Reads raw feed bytes from a validated source.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch at most `max_bytes`; larger feeds fail with `TooLarge`.
    async fn fetch(&self, source: &FeedSource, max_bytes: usize) -> Result<Vec<u8>, FetchError>;
}

/// Remote fetcher backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpsFetcher {
    client: reqwest::Client,
}

impl HttpsFetcher {
    /// Create a fetcher with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher with a caller-configured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn net_err(e: reqwest::Error) -> FetchError {
    FetchError::Network(e.to_string())
}

#[async_trait]
impl FeedFetcher for HttpsFetcher {
    async fn fetch(&self, source: &FeedSource, max_bytes: usize) -> Result<Vec<u8>, FetchError> {
        let FeedSource::Remote(url) = source else {
            return Err(FetchError::Unsupported("local feed".to_string()));
        };

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(net_err)?;

        if response.content_length().is_some_and(|len| len > max_bytes as u64) {
            return Err(FetchError::TooLarge { limit: max_bytes });
        }

        // Content-Length may be absent or wrong; enforce the cap while streaming.
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(net_err)? {
            if body.len() + chunk.len() > max_bytes {
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Local fetcher confined to a root directory.
#[derive(Debug, Clone)]
pub struct LocalFileFetcher {
    root: PathBuf,
}

impl LocalFileFetcher {
    /// Create a fetcher for files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn io_err(e: std::io::Error) -> FetchError {
    FetchError::Io(e.to_string())
}

#[async_trait]
impl FeedFetcher for LocalFileFetcher {
    async fn fetch(&self, source: &FeedSource, max_bytes: usize) -> Result<Vec<u8>, FetchError> {
        let FeedSource::Local(path) = source else {
            return Err(FetchError::Unsupported("remote feed".to_string()));
        };

        let root = tokio::fs::canonicalize(&self.root).await.map_err(io_err)?;
        let resolved = tokio::fs::canonicalize(path).await.map_err(io_err)?;
        if !resolved.starts_with(&root) {
            return Err(FetchError::OutsideRoot(resolved));
        }

        let file = tokio::fs::File::open(&resolved).await.map_err(io_err)?;
        let mut body = Vec::new();
        file.take(max_bytes as u64 + 1)
            .read_to_end(&mut body)
            .await
            .map_err(io_err)?;
        if body.len() > max_bytes {
            return Err(FetchError::TooLarge { limit: max_bytes });
        }
        Ok(body)
    }
}

/// Dispatches to the remote or local fetcher by source kind.
#[derive(Debug, Clone, Default)]
pub struct FeedRouter {
    remote: HttpsFetcher,
    local: Option<LocalFileFetcher>,
}

impl FeedRouter {
    /// Remote feeds only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also serve `file` feeds under `root`.
    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local = Some(LocalFileFetcher::new(root));
        self
    }
}

#[async_trait]
impl FeedFetcher for FeedRouter {
    async fn fetch(&self, source: &FeedSource, max_bytes: usize) -> Result<Vec<u8>, FetchError> {
        match source {
            FeedSource::Remote(_) => self.remote.fetch(source, max_bytes).await,
            FeedSource::Local(_) => match &self.local {
                Some(local) => local.fetch(source, max_bytes).await,
                None => Err(FetchError::DisallowedScheme("file".to_string())),
            },
        }
    }
}
