use crate::domain::jobs::InputRef;
use crate::error::DownloadError;
use crate::ports::downloader::{DownloadedMedia, Downloader};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Download collaborator for inputs that are already on this host.
///
/// `Local` files are copied so the caller keeps its original, `Staged`
/// uploads are moved. Remote locators are not handled here.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFiles;

impl LocalFiles {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Downloader for LocalFiles {
    async fn fetch(
        &self,
        input: &InputRef,
        file_name: &str,
        dest_dir: &Path,
    ) -> Result<DownloadedMedia, DownloadError> {
        let dest = dest_dir.join(safe_file_name(file_name));

        match input {
            InputRef::Remote(url) => return Err(DownloadError::Unsupported(url.clone())),
            InputRef::Local(source) => {
                ensure_file(source).await?;
                tokio::fs::create_dir_all(dest_dir).await?;
                if source != &dest {
                    debug!(source = %source.display(), dest = %dest.display(), "Copying local input");
                    tokio::fs::copy(source, &dest).await?;
                }
            }
            InputRef::Staged(source) => {
                ensure_file(source).await?;
                tokio::fs::create_dir_all(dest_dir).await?;
                if source != &dest {
                    debug!(source = %source.display(), dest = %dest.display(), "Moving staged input");
                    move_file(source, &dest).await?;
                }
            }
        }

        let size = tokio::fs::metadata(&dest).await?.len();
        Ok(DownloadedMedia { path: dest, size })
    }
}

/// Keep only the final path component so a display name can never escape `dest_dir`.
fn safe_file_name(file_name: &str) -> PathBuf {
    Path::new(file_name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("input"))
}

async fn ensure_file(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(DownloadError::NotFound(format!(
            "{} is not a file",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(DownloadError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Rename, falling back to copy and delete across filesystems.
async fn move_file(source: &Path, dest: &Path) -> io::Result<()> {
    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, dest).await?;
    tokio::fs::remove_file(source).await
}
