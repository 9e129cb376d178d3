use crate::domain::av::cmd::EncodeInvocation;
use crate::domain::av::probe::MediaInfo;
use crate::error::JobError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::io;
use std::path::Path;

/// Lines read from the encoder's diagnostic stream, split on `\r` and `\n`.
pub type DiagnosticLines = BoxStream<'static, io::Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running encoder process.
#[async_trait]
pub trait ProcessHandle: Send {
    async fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Send a forceful kill. Does not wait for the process to exit.
    fn start_kill(&mut self) -> io::Result<()>;

    fn id(&self) -> Option<u32>;
}

pub struct EncodeChild {
    pub diagnostics: DiagnosticLines,
    pub process: Box<dyn ProcessHandle>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Inspect `input`. Failures carry the probe tool's diagnostic text verbatim.
    async fn probe(&self, input: &Path) -> Result<MediaInfo, JobError>;

    async fn spawn_encode(&self, invocation: &EncodeInvocation) -> io::Result<EncodeChild>;
}
