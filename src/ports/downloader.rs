use crate::domain::jobs::InputRef;
use crate::error::DownloadError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// A source that has been materialised as a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedMedia {
    pub path: PathBuf,
    pub size: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Make `input` available as `file_name` inside `dest_dir`.
    async fn fetch(
        &self,
        input: &InputRef,
        file_name: &str,
        dest_dir: &Path,
    ) -> Result<DownloadedMedia, DownloadError>;
}
