//! Ports - Trait definitions for the collaborators the pipeline talks to.

pub mod downloader;
pub mod media;
pub mod notifier;

pub use downloader::{DownloadedMedia, Downloader};
pub use media::{DiagnosticLines, EncodeChild, MediaToolkit, ProcessExit, ProcessHandle};
pub use notifier::{MessageId, NotificationSink};
