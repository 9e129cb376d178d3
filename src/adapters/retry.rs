//! Bounded retry around a download collaborator.

use crate::domain::jobs::InputRef;
use crate::error::DownloadError;
use crate::ports::downloader::{DownloadedMedia, Downloader};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Fixed-backoff retry settings, scoped to a single download call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

pub struct RetryingDownloader<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D> RetryingDownloader<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<D: Downloader> Downloader for RetryingDownloader<D> {
    async fn fetch(
        &self,
        input: &InputRef,
        file_name: &str,
        dest_dir: &Path,
    ) -> Result<DownloadedMedia, DownloadError> {
        let mut retries = 0;
        loop {
            match self.inner.fetch(input, file_name, dest_dir).await {
                Ok(media) => return Ok(media),
                Err(e) if e.is_retryable() && retries < self.policy.max_retries => {
                    retries += 1;
                    warn!(
                        file = file_name,
                        attempt = retries,
                        max_retries = self.policy.max_retries,
                        error = %e,
                        "Download failed, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
