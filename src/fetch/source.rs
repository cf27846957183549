use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::client::HttpClient;
use super::fetch_bytes;

/// Supplies the raw bytes of the latest feed snapshot.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>>;

    /// Where snapshots come from, for logging.
    fn describe(&self) -> String;
}

/// Downloads the snapshot over HTTP on every call.
pub struct HttpFeedSource<C> {
    client: C,
    url: String,
}

impl<C: HttpClient> HttpFeedSource<C> {
    pub fn new(client: C, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl<C: HttpClient> FeedSource for HttpFeedSource<C> {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<u8>> {
        let bytes = fetch_bytes(&self.client, &self.url)
            .await
            .with_context(|| format!("failed to download feed from {}", self.url))?;
        debug!(bytes = bytes.len(), "Feed bytes received");
        Ok(bytes)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Reads a snapshot previously saved to disk.
pub struct FileFeedSource {
    path: PathBuf,
}

impl FileFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSource for FileFeedSource {
    async fn fetch(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read feed snapshot {}", self.path.display()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
