//! ffbatch - Concurrent batch transcoding service
//!
//! Hexagonal Architecture:
//! - domain/: Pure logic (jobs, telemetry, report, av)
//! - ports/: Trait definitions (download, media tools, notifications)
//! - adapters/: Concrete implementations (local files, ffmpeg, message board, http)
//! - application/: Job runner, scheduler, progress reporter, batch controller
//! - config: Environment configuration
//! - error: Error taxonomy

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

// Re-exports for convenience
pub use application::controller::BatchController;
pub use config::AppConfig;
pub use error::{Error, JobError, Result};
