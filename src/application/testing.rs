//! Scripted job executor for scheduler and controller tests.

use crate::application::runner::JobExecutor;
use crate::domain::jobs::{JobChange, JobState, JobTicket, JobUpdate, TerminalState};
use crate::domain::report::CompletionReport;
use crate::error::JobError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Each job "encodes" for a fixed time, then succeeds unless told to fail.
pub struct FakeExecutor {
    default_duration: Duration,
    durations: HashMap<String, Duration>,
    failing: Vec<String>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// (job id, encoding start offset), in admission order.
    started: Mutex<Vec<(String, Duration)>>,
    finished: Mutex<Vec<String>>,
    epoch: Instant,
}

impl FakeExecutor {
    pub fn new(default_duration: Duration) -> Self {
        Self {
            default_duration,
            durations: HashMap::new(),
            failing: Vec::new(),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            epoch: Instant::now(),
        }
    }

    pub fn with_duration(mut self, job_id: &str, duration: Duration) -> Self {
        self.durations.insert(job_id.to_string(), duration);
        self
    }

    /// Fail the job with this id or original name.
    pub fn failing(mut self, key: &str) -> Self {
        self.failing.push(key.to_string());
        self
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<(String, Duration)> {
        self.started.lock().clone()
    }

    pub fn start_offset(&self, job_id: &str) -> Option<Duration> {
        self.started
            .lock()
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(_, at)| *at)
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl JobExecutor for FakeExecutor {
    async fn run(
        &self,
        ticket: JobTicket,
        updates: mpsc::UnboundedSender<JobUpdate>,
        cancel: CancellationToken,
    ) -> TerminalState {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.started
            .lock()
            .push((ticket.job_id.clone(), self.epoch.elapsed()));

        for state in [JobState::Downloading, JobState::Probing, JobState::Encoding] {
            let _ = updates.send(JobUpdate {
                job_id: ticket.job_id.clone(),
                change: JobChange::Entered(state),
            });
        }

        let duration = self
            .durations
            .get(&ticket.job_id)
            .copied()
            .unwrap_or(self.default_duration);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => TerminalState::Cancelled,
            _ = tokio::time::sleep(duration) => {
                if self.failing.contains(&ticket.job_id) || self.failing.contains(&ticket.original_name) {
                    TerminalState::Failed(JobError::Encode("scripted failure".into()))
                } else {
                    TerminalState::Succeeded {
                        output_path: ticket.workspace.join("out.mkv"),
                        report: CompletionReport::new(100, 50, duration),
                    }
                }
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.lock().push(ticket.job_id.clone());
        outcome
    }
}
