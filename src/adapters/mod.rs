//! Adapters - Concrete implementations of ports.

pub mod ffmpeg;
pub mod http;
pub mod local;
pub mod retry;

pub use ffmpeg::FfmpegToolkit;
pub use retry::{RetryPolicy, RetryingDownloader};
