use crate::domain::av::cmd::EncodeParameters;
use crate::domain::report::CompletionReport;
use crate::error::{Error, JobError};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Where a job's source media comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum InputRef {
    /// A file owned by the caller. Copied into the job workspace.
    Local(PathBuf),
    /// A file already handed over to us (uploads). Moved into the job workspace.
    Staged(PathBuf),
    /// A remote locator, resolved by a network download collaborator.
    Remote(String),
}

impl InputRef {
    /// Anything that looks like a URL is remote, everything else a local path.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.contains("://") {
            InputRef::Remote(raw.to_string())
        } else {
            InputRef::Local(PathBuf::from(raw))
        }
    }

    /// A display name for the source: the file name, or the last URL path segment.
    pub fn display_name(&self) -> String {
        match self {
            InputRef::Local(path) | InputRef::Staged(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string()),
            InputRef::Remote(url) => {
                let path = url
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(url)
                    .split(['?', '#'])
                    .next()
                    .unwrap_or_default();
                let last = path.split('/').skip(1).filter(|s| !s.is_empty()).last();
                let cleaned: String = last
                    .unwrap_or_default()
                    .chars()
                    .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
                    .collect();
                if cleaned.is_empty() {
                    "download.mp4".to_string()
                } else if Path::new(&cleaned).extension().is_none() {
                    format!("{cleaned}.mp4")
                } else {
                    cleaned
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Downloading,
    Probing,
    Encoding,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// States that occupy one of the batch's concurrency slots.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Downloading | JobState::Probing | JobState::Encoding
        )
    }

    /// Transitions are one-directional: forward through the pipeline, into
    /// `Failed` from any working state, into `Cancelled` from anything non-terminal.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Downloading)
            | (Downloading, Probing)
            | (Probing, Encoding)
            | (Encoding, Succeeded) => true,
            (Downloading | Probing | Encoding, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Downloading => "downloading",
            JobState::Probing => "probing",
            JobState::Encoding => "encoding",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One input-to-output transcode unit.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub input_ref: InputRef,
    /// Display name, kept for output naming and captions.
    pub original_name: String,
    pub state: JobState,
    pub output_path: Option<PathBuf>,
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(input_ref: InputRef, original_name: Option<String>) -> Self {
        let original_name = original_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| input_ref.display_name());
        Self {
            id: Uuid::new_v4().to_string(),
            input_ref,
            original_name,
            state: JobState::Pending,
            output_path: None,
            error: None,
        }
    }
}

/// A state change requested by the runner or scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub job_id: String,
    pub change: JobChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobChange {
    Entered(JobState),
    Succeeded { output_path: PathBuf },
    Failed(JobError),
    Cancelled,
}

impl JobChange {
    pub fn target(&self) -> JobState {
        match self {
            JobChange::Entered(state) => *state,
            JobChange::Succeeded { .. } => JobState::Succeeded,
            JobChange::Failed(_) => JobState::Failed,
            JobChange::Cancelled => JobState::Cancelled,
        }
    }
}

/// How a job ended, as yielded by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalState {
    Succeeded {
        output_path: PathBuf,
        report: CompletionReport,
    },
    Failed(JobError),
    Cancelled,
}

impl TerminalState {
    pub fn state(&self) -> JobState {
        match self {
            TerminalState::Succeeded { .. } => JobState::Succeeded,
            TerminalState::Failed(_) => JobState::Failed,
            TerminalState::Cancelled => JobState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub outcome: TerminalState,
}

/// Read-only view of a job handed to the scheduler and runner.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job_id: String,
    pub session_key: String,
    pub input_ref: InputRef,
    pub original_name: String,
    /// Per-job scratch directory; concurrent jobs never share one.
    pub workspace: PathBuf,
    pub parameters: Arc<EncodeParameters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Collecting,
    AwaitingParameters,
    Ready,
    Running,
    Complete,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Complete | BatchState::Cancelled)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Collecting => "collecting",
            BatchState::AwaitingParameters => "awaiting_parameters",
            BatchState::Ready => "ready",
            BatchState::Running => "running",
            BatchState::Complete => "complete",
            BatchState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A set of jobs sharing one set of encode parameters and one concurrency budget.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: String,
    pub session_key: String,
    /// Per-session counter, shown in messages.
    pub number: u32,
    pub state: BatchState,
    pub jobs: Vec<Job>,
    pub parameters: Option<EncodeParameters>,
    pub concurrency_limit: usize,
}

impl Batch {
    pub fn new(session_key: impl Into<String>, number: u32, concurrency_limit: usize) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            session_key: session_key.into(),
            number,
            state: BatchState::Collecting,
            jobs: Vec::new(),
            parameters: None,
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    fn expect_state(&self, expected: BatchState) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    pub fn add_job(&mut self, job: Job) -> Result<&Job, Error> {
        self.expect_state(BatchState::Collecting)?;
        self.jobs.push(job);
        Ok(&self.jobs[self.jobs.len() - 1])
    }

    pub fn finish_collecting(&mut self) -> Result<usize, Error> {
        self.expect_state(BatchState::Collecting)?;
        if self.jobs.is_empty() {
            return Err(Error::EmptyBatch);
        }
        self.state = BatchState::AwaitingParameters;
        Ok(self.jobs.len())
    }

    pub fn set_parameters(&mut self, parameters: EncodeParameters) -> Result<(), Error> {
        self.expect_state(BatchState::AwaitingParameters)?;
        self.parameters = Some(parameters);
        self.state = BatchState::Ready;
        Ok(())
    }

    /// Move to `Running` and hand out one ticket per job, in insertion order.
    pub fn start(&mut self, work_dir: &Path) -> Result<Vec<JobTicket>, Error> {
        self.expect_state(BatchState::Ready)?;
        let parameters = Arc::new(self.parameters.clone().unwrap_or_default());
        let batch_dir = work_dir.join(format!("batch_{}", self.id));

        self.state = BatchState::Running;
        Ok(self
            .jobs
            .iter()
            .map(|job| JobTicket {
                job_id: job.id.clone(),
                session_key: self.session_key.clone(),
                input_ref: job.input_ref.clone(),
                original_name: job.original_name.clone(),
                workspace: batch_dir.join(&job.id),
                parameters: parameters.clone(),
            })
            .collect())
    }

    /// Apply a requested transition. Returns false (and leaves the job untouched)
    /// when the job is unknown or the transition is not allowed.
    pub fn apply(&mut self, update: &JobUpdate) -> bool {
        let Some(job) = self.jobs.iter_mut().find(|job| job.id == update.job_id) else {
            return false;
        };
        let target = update.change.target();
        if !job.state.can_transition_to(target) {
            return false;
        }

        job.state = target;
        match &update.change {
            JobChange::Succeeded { output_path } => job.output_path = Some(output_path.clone()),
            JobChange::Failed(err) => job.error = Some(err.clone()),
            JobChange::Cancelled => job.error = Some(JobError::Cancelled),
            JobChange::Entered(_) => {}
        }
        true
    }

    /// Force every non-terminal job into `Cancelled`. Returns how many were cancelled.
    pub fn cancel(&mut self) -> usize {
        let mut cancelled = 0;
        for job in self.jobs.iter_mut().filter(|job| !job.state.is_terminal()) {
            job.state = JobState::Cancelled;
            job.error = Some(JobError::Cancelled);
            cancelled += 1;
        }
        if !self.state.is_terminal() {
            self.state = BatchState::Cancelled;
        }
        cancelled
    }

    /// Mark the batch `Complete` once every job is terminal.
    pub fn try_complete(&mut self) -> bool {
        if self.state == BatchState::Running && self.all_terminal() {
            self.state = BatchState::Complete;
            true
        } else {
            false
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|job| job.state.is_terminal())
    }

    pub fn active_count(&self) -> usize {
        self.jobs.iter().filter(|job| job.state.is_active()).count()
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|job| job.state == state).count()
    }
}
