//! Out-of-process probe and encode using the ffmpeg command-line tools.

use crate::domain::av::cmd::{probe_args, EncodeInvocation};
use crate::domain::av::probe::MediaInfo;
use crate::error::JobError;
use crate::ports::media::{EncodeChild, MediaToolkit, ProcessExit, ProcessHandle};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info};

/// Lines longer than this are cut into pieces.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegToolkit {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe(&self, input: &Path) -> Result<MediaInfo, JobError> {
        let mut command = Command::new(&self.ffprobe_path);
        command
            .args(probe_args(input))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = command
            .output()
            .await
            .map_err(|e| JobError::Probe(format!("failed to run {}: {}", self.ffprobe_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(JobError::Probe(if stderr.is_empty() {
                format!("{} exited with {}", self.ffprobe_path, output.status)
            } else {
                stderr
            }));
        }

        let info = MediaInfo::from_probe_output(&String::from_utf8_lossy(&output.stdout));
        debug!(input = %input.display(), ?info, "Probe finished");
        Ok(info)
    }

    async fn spawn_encode(&self, invocation: &EncodeInvocation) -> io::Result<EncodeChild> {
        info!(command = %invocation.command_line(&self.ffmpeg_path), "Launching encoder");

        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(&invocation.args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "encoder stderr was not captured"))?;

        Ok(EncodeChild {
            diagnostics: FramedRead::new(stderr, DiagnosticLineCodec).boxed(),
            process: Box::new(EncoderProcess { child }),
        })
    }
}

struct EncoderProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for EncoderProcess {
    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Splits the diagnostic stream on both `\r` and `\n`.
///
/// The encoder rewrites its stats line in place with a bare carriage return,
/// so newline-only splitting would hold every update until the process ends.
/// Invalid UTF-8 is replaced rather than rejected. Blank lines are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticLineCodec;

impl Decoder for DiagnosticLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                if src.len() >= MAX_LINE_BYTES {
                    let chunk = src.split_to(MAX_LINE_BYTES);
                    return Ok(Some(String::from_utf8_lossy(&chunk).into_owned()));
                }
                return Ok(None);
            };

            let line = src.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim_end();
            if !text.is_empty() {
                return Ok(Some(text.to_string()));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim_end();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::av::cmd::EncodeParameters;
    use futures::TryStreamExt;

    async fn lines(input: &'static [u8]) -> Vec<String> {
        FramedRead::new(input, DiagnosticLineCodec)
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_splits_on_carriage_return_and_newline() {
        let got = lines(b"Input #0\nframe=  1 fps=0.0\rframe=  2 fps=1.0\r\nvideo:1kB").await;
        assert_eq!(
            got,
            vec!["Input #0", "frame=  1 fps=0.0", "frame=  2 fps=1.0", "video:1kB"]
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let got = lines(b"size=10kB \xff\xfe\n\n\r").await;
        assert_eq!(got, vec!["size=10kB \u{fffd}\u{fffd}"]);
    }

    #[test]
    fn test_partial_line_waits_for_terminator() {
        let mut codec = DiagnosticLineCodec;
        let mut buf = BytesMut::from(&b"frame=12"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"0\r");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("frame=120".to_string()));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_probe_with_missing_binary_is_probe_error() {
        let toolkit = FfmpegToolkit::new("ffmpeg", "/nonexistent/ffprobe");
        let err = toolkit.probe(Path::new("/tmp/a.mkv")).await.unwrap_err();
        assert!(matches!(err, JobError::Probe(detail) if detail.contains("/nonexistent/ffprobe")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_non_zero_exit_is_probe_error() {
        let toolkit = FfmpegToolkit::new("ffmpeg", "false");
        let err = toolkit.probe(Path::new("/tmp/a.mkv")).await.unwrap_err();
        assert!(matches!(err, JobError::Probe(_)));
    }

    #[tokio::test]
    async fn test_spawn_with_missing_binary_fails() {
        let toolkit = FfmpegToolkit::new("/nonexistent/ffmpeg", "ffprobe");
        let invocation = EncodeInvocation::build(
            Path::new("/tmp/in.mkv"),
            &EncodeParameters::default(),
            Path::new("/tmp/out.mkv"),
        );
        assert!(toolkit.spawn_encode(&invocation).await.is_err());
    }
}
