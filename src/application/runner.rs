//! Supervises one job from source reference to encoded output.

use crate::application::reporter::ProgressReporter;
use crate::domain::av::cmd::{output_file_name, EncodeInvocation};
use crate::domain::jobs::{InputRef, JobChange, JobState, JobTicket, JobUpdate, TerminalState};
use crate::domain::report::{render_failure, render_input_info, Baseline, CompletionReport};
use crate::domain::telemetry::ProgressSnapshot;
use crate::error::JobError;
use crate::ports::downloader::Downloader;
use crate::ports::media::{EncodeChild, MediaToolkit, ProcessExit};
use crate::ports::notifier::{post_chunked, NotificationSink};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Encoder output is logged at debug level once every this many lines.
const LOG_EVERY_N_LINES: u64 = 100;

/// Substrings that mark a diagnostic line as worth surfacing on failure.
const PROBLEM_MARKERS: [&str; 8] = [
    "error",
    "invalid",
    "failed",
    "unable",
    "cannot",
    "no such",
    "not found",
    "warning",
];

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub render_interval: Duration,
    pub output_suffix: String,
    pub output_extension: Option<String>,
    /// Diagnostic lines kept for the failure detail.
    pub error_tail_lines: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            render_interval: Duration::from_secs(2),
            output_suffix: "_processed".to_string(),
            output_extension: Some("mkv".to_string()),
            error_tail_lines: 20,
        }
    }
}

/// Runs one admitted job to a terminal state.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    /// Non-terminal transitions are requested through `updates`; the terminal
    /// one is the return value.
    async fn run(
        &self,
        ticket: JobTicket,
        updates: mpsc::UnboundedSender<JobUpdate>,
        cancel: CancellationToken,
    ) -> TerminalState;
}

pub struct JobRunner<D, M, N> {
    downloader: Arc<D>,
    toolkit: Arc<M>,
    sink: Arc<N>,
    settings: RunnerSettings,
}

/// Files a job has created so far, removed once it ends.
#[derive(Debug, Default)]
struct Artifacts {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
}

struct Encoded {
    output_path: PathBuf,
    input_bytes: u64,
    output_bytes: u64,
}

impl<D, M, N> JobRunner<D, M, N>
where
    D: Downloader + 'static,
    M: MediaToolkit + 'static,
    N: NotificationSink + 'static,
{
    pub fn new(downloader: Arc<D>, toolkit: Arc<M>, sink: Arc<N>, settings: RunnerSettings) -> Self {
        Self {
            downloader,
            toolkit,
            sink,
            settings,
        }
    }

    async fn execute(
        &self,
        ticket: &JobTicket,
        updates: &mpsc::UnboundedSender<JobUpdate>,
        cancel: &CancellationToken,
        artifacts: &mut Artifacts,
    ) -> Result<Encoded, JobError> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        enter(updates, ticket, JobState::Downloading);
        let source_dir = ticket.workspace.join("source");
        let media = cancellable(
            cancel,
            self.downloader
                .fetch(&ticket.input_ref, &ticket.original_name, &source_dir),
        )
        .await??;
        artifacts.input = Some(media.path.clone());
        let input_bytes = resolve_input(&media.path).await?;

        enter(updates, ticket, JobState::Probing);
        let info = cancellable(cancel, self.toolkit.probe(&media.path)).await??;
        self.notify(
            ticket,
            &render_input_info(&ticket.original_name, input_bytes, &info),
        )
        .await;

        enter(updates, ticket, JobState::Encoding);
        let output = ticket.workspace.join(output_file_name(
            &ticket.original_name,
            &self.settings.output_suffix,
            self.settings.output_extension.as_deref(),
        ));
        let invocation = EncodeInvocation::build(&media.path, &ticket.parameters, &output);
        artifacts.output = Some(output.clone());
        let child = self
            .toolkit
            .spawn_encode(&invocation)
            .await
            .map_err(|e| JobError::Encode(format!("failed to launch encoder: {}", e)))?;

        let baseline = Baseline {
            input_bytes,
            total_duration: info.duration,
        };
        let (exit, tail) = self.supervise(ticket, child, baseline, cancel).await?;
        let output_bytes = verify_output(&output, exit, &tail).await?;

        Ok(Encoded {
            output_path: output,
            input_bytes,
            output_bytes,
        })
    }

    /// Pump diagnostics into the parser and wait for exit, both to completion,
    /// while the reporter renders. Cancellation kills the process.
    async fn supervise(
        &self,
        ticket: &JobTicket,
        child: EncodeChild,
        baseline: Baseline,
        cancel: &CancellationToken,
    ) -> Result<(ProcessExit, DiagnosticTail), JobError> {
        let EncodeChild {
            mut diagnostics,
            mut process,
        } = child;
        let job_id = ticket.job_id.as_str();
        let pid = process.id();
        debug!(job_id, ?pid, "Encoder started");

        let (progress_tx, progress_rx) = watch::channel(ProgressSnapshot::default());
        let done = CancellationToken::new();
        let reporter = ProgressReporter::new(
            self.sink.clone(),
            &ticket.session_key,
            job_id,
            &ticket.original_name,
            baseline,
            self.settings.render_interval,
        );
        let mut tail = DiagnosticTail::new(self.settings.error_tail_lines);

        let pump = async {
            let mut snapshot = ProgressSnapshot::default();
            let mut count: u64 = 0;
            while let Some(line) = diagnostics.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(job_id, error = %e, "Encoder diagnostic stream failed");
                        break;
                    }
                };
                count += 1;
                if count % LOG_EVERY_N_LINES == 0 {
                    debug!(job_id, lines = count, line = %line, "Encoder output");
                }
                if snapshot.apply_line(&line) {
                    progress_tx.send_replace(snapshot.clone());
                } else if is_problem_line(&line) {
                    warn!(job_id, line = %line, "Encoder reported a problem");
                }
                tail.push(line);
            }
        };
        let supervised = async {
            let ((), exit) = tokio::join!(pump, process.wait());
            done.cancel();
            exit
        };
        let reporting = reporter.run(progress_rx, done.clone());

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            (exit, _) = async { tokio::join!(supervised, reporting) } => Some(exit),
        };

        let Some(exit) = finished else {
            info!(job_id, ?pid, "Killing encoder");
            if let Err(e) = process.start_kill() {
                warn!(job_id, error = %e, "Failed to kill encoder");
            }
            match process.wait().await {
                Ok(exit) => debug!(job_id, code = ?exit.code, "Encoder reaped"),
                Err(e) => warn!(job_id, error = %e, "Failed to reap encoder"),
            }
            return Err(JobError::Cancelled);
        };

        let exit =
            exit.map_err(|e| JobError::Encode(format!("failed waiting for encoder: {}", e)))?;
        debug!(job_id, code = ?exit.code, "Encoder exited");
        Ok((exit, tail))
    }

    async fn notify(&self, ticket: &JobTicket, text: &str) {
        if let Err(e) = post_chunked(self.sink.as_ref(), &ticket.session_key, text).await {
            warn!(job_id = %ticket.job_id, error = %e, "Failed to post message");
        }
    }
}

#[async_trait]
impl<D, M, N> JobExecutor for JobRunner<D, M, N>
where
    D: Downloader + 'static,
    M: MediaToolkit + 'static,
    N: NotificationSink + 'static,
{
    async fn run(
        &self,
        ticket: JobTicket,
        updates: mpsc::UnboundedSender<JobUpdate>,
        cancel: CancellationToken,
    ) -> TerminalState {
        let started = Instant::now();
        let mut artifacts = Artifacts::default();
        info!(job_id = %ticket.job_id, name = %ticket.original_name, "Job started");

        let outcome = match self
            .execute(&ticket, &updates, &cancel, &mut artifacts)
            .await
        {
            Ok(encoded) => {
                if let Some(input) = artifacts.input.take() {
                    remove_artifact(&ticket.job_id, &input).await;
                }
                let report = CompletionReport::new(
                    encoded.input_bytes,
                    encoded.output_bytes,
                    started.elapsed(),
                );
                info!(
                    job_id = %ticket.job_id,
                    output = %encoded.output_path.display(),
                    ratio = report.compression_ratio,
                    "Job succeeded"
                );
                self.notify(&ticket, &report.render(&ticket.original_name))
                    .await;
                TerminalState::Succeeded {
                    output_path: encoded.output_path,
                    report,
                }
            }
            Err(JobError::Cancelled) => {
                info!(job_id = %ticket.job_id, "Job cancelled");
                cleanup(&ticket, artifacts).await;
                TerminalState::Cancelled
            }
            Err(err) => {
                error!(job_id = %ticket.job_id, error = %err, "Job failed");
                cleanup(&ticket, artifacts).await;
                self.notify(&ticket, &render_failure(&ticket.original_name, &err))
                    .await;
                TerminalState::Failed(err)
            }
        };
        // Whatever the fetch did not move out of staging goes now.
        discard_staged_input(&ticket.job_id, &ticket.input_ref);
        outcome
    }
}

fn enter(updates: &mpsc::UnboundedSender<JobUpdate>, ticket: &JobTicket, state: JobState) {
    debug!(job_id = %ticket.job_id, %state, "Job state change requested");
    // The controller may already have dropped the batch.
    let _ = updates.send(JobUpdate {
        job_id: ticket.job_id.clone(),
        change: JobChange::Entered(state),
    });
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, JobError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled),
        output = fut => Ok(output),
    }
}

/// Check the input is a readable regular file and return its size.
async fn resolve_input(path: &Path) -> Result<u64, JobError> {
    let input_error = |e: io::Error| JobError::Input(format!("{}: {}", path.display(), e));

    let meta = tokio::fs::metadata(path).await.map_err(input_error)?;
    if !meta.is_file() {
        return Err(JobError::Input(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let file = tokio::fs::File::open(path).await.map_err(input_error)?;
    let mut head = Vec::with_capacity(1024);
    file.take(1024)
        .read_to_end(&mut head)
        .await
        .map_err(input_error)?;
    Ok(meta.len())
}

async fn verify_output(
    output: &Path,
    exit: ProcessExit,
    tail: &DiagnosticTail,
) -> Result<u64, JobError> {
    if !exit.success() {
        let status = match exit.code {
            Some(code) => format!("code {}", code),
            None => "a signal".to_string(),
        };
        return Err(JobError::Encode(format!(
            "encoder exited with {}\n{}",
            status,
            tail.summary()
        )));
    }

    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        _ => Err(JobError::Encode(format!(
            "encoder finished but produced no output at {}\n{}",
            output.display(),
            tail.summary()
        ))),
    }
}

async fn cleanup(ticket: &JobTicket, artifacts: Artifacts) {
    for path in [artifacts.input, artifacts.output].into_iter().flatten() {
        remove_artifact(&ticket.job_id, &path).await;
    }
    if let Err(e) = tokio::fs::remove_dir_all(&ticket.workspace).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(job_id = %ticket.job_id, error = %e, "Failed to remove job workspace");
        }
    }
}

async fn remove_artifact(job_id: &str, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(job_id, path = %path.display(), "Removed artifact"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id, path = %path.display(), error = %e, "Failed to remove artifact"),
    }
}

/// Remove a staged upload and its per-upload directory, best-effort.
///
/// Used for jobs that end without a runner taking the file over. The
/// directory is only removed once empty.
pub fn discard_staged_input(job_id: &str, input: &InputRef) {
    let InputRef::Staged(path) = input else {
        return;
    };
    match std::fs::remove_file(path) {
        Ok(()) => debug!(job_id, path = %path.display(), "Removed staged input"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id, path = %path.display(), error = %e, "Failed to remove staged input"),
    }
    if let Some(dir) = path.parent() {
        match std::fs::remove_dir(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!(job_id, path = %dir.display(), error = %e, "Staging directory kept"),
        }
    }
}

pub fn is_problem_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    PROBLEM_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// The last N diagnostic lines, plus the last N that look like problems.
#[derive(Debug)]
pub struct DiagnosticTail {
    capacity: usize,
    recent: VecDeque<String>,
    problems: VecDeque<String>,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: VecDeque::new(),
            problems: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: String) {
        if is_problem_line(&line) {
            push_bounded(&mut self.problems, line.clone(), self.capacity);
        }
        push_bounded(&mut self.recent, line, self.capacity);
    }

    /// Problem lines when there are any, otherwise the most recent lines.
    pub fn summary(&self) -> String {
        let lines = if self.problems.is_empty() {
            &self.recent
        } else {
            &self.problems
        };
        if lines.is_empty() {
            return "(no diagnostic output)".to_string();
        }
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

fn push_bounded(lines: &mut VecDeque<String>, line: String, capacity: usize) {
    if lines.len() == capacity {
        lines.pop_front();
    }
    lines.push_back(line);
}
