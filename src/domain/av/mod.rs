//! Audio/Video domain modules.

pub mod cmd;
pub mod probe;
