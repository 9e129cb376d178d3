//! Local adapters for single-host deployment.

pub mod board;
pub mod fs;

pub use board::MessageBoard;
pub use fs::LocalFiles;
