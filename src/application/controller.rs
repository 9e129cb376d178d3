//! Per-session batch state machine and the nuke path.
//!
//! The controller is the only writer of `Batch` and `Job` records. Runners and
//! the scheduler send `JobUpdate`s over a channel; a driver task per running
//! batch applies them under the session lock.

use crate::application::runner::{discard_staged_input, JobExecutor};
use crate::application::scheduler::{AdmissionPolicy, Scheduler};
use crate::domain::av::cmd::{parameter_examples, EncodeParameters};
use crate::domain::jobs::{Batch, BatchState, InputRef, Job, JobResult, JobState, JobUpdate};
use crate::domain::report::render_batch_summary;
use crate::error::{Error, Result};
use crate::ports::notifier::{post_chunked, NotificationSink};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Root under which each batch gets its own directory.
    pub work_dir: PathBuf,
    pub admission: AdmissionPolicy,
    /// Upper bound on how long a nuke waits for cancelled jobs to report back.
    pub nuke_grace: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./downloads"),
            admission: AdmissionPolicy::default(),
            nuke_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ParameterOutcome {
    Set(EncodeParameters),
    /// The caller asked for help; nothing was stored.
    Help(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Nothing to cancel: no batch, or it already finished.
    NoOp,
    /// A batch that had not started was dropped.
    Cleared { cancelled: usize },
    /// A running batch was torn down and its encoders killed.
    Nuked { cancelled: usize },
}

#[derive(Default)]
struct SessionSlot {
    counter: u32,
    batch: Option<Batch>,
    /// The most recently finished or cancelled batch, for inspection.
    last: Option<Batch>,
    run: Option<RunHandle>,
}

struct RunHandle {
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

type Sessions = Arc<Mutex<HashMap<String, SessionSlot>>>;

pub struct BatchController<E, N> {
    executor: Arc<E>,
    sink: Arc<N>,
    settings: ControllerSettings,
    sessions: Sessions,
}

impl<E, N> BatchController<E, N>
where
    E: JobExecutor,
    N: NotificationSink + 'static,
{
    pub fn new(executor: Arc<E>, sink: Arc<N>, settings: ControllerSettings) -> Self {
        Self {
            executor,
            sink,
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a new batch for `session`. An unstarted batch is replaced; a
    /// running one must be nuked first. Returns the batch number.
    pub fn start_collecting(&self, session: &str) -> Result<u32> {
        let (number, replaced) = {
            let mut sessions = self.sessions.lock();
            let slot = sessions.entry(session.to_string()).or_default();

            if let Some(current) = &slot.batch {
                if current.state == BatchState::Running {
                    return Err(Error::BatchBusy(session.to_string()));
                }
                info!(session, batch = %current.id, "Discarding unstarted batch");
            }

            slot.counter += 1;
            let batch = Batch::new(
                session,
                slot.counter,
                self.settings.admission.concurrency_limit,
            );
            info!(session, batch = %batch.id, number = batch.number, "Collecting inputs");
            (slot.counter, slot.batch.replace(batch))
        };

        if let Some(replaced) = replaced {
            discard_inputs(&replaced);
        }
        Ok(number)
    }

    pub fn add_job(&self, session: &str, input: InputRef, name: Option<String>) -> Result<Job> {
        self.with_batch(session, |batch| {
            let job = batch.add_job(Job::new(input, name))?.clone();
            debug!(session, job_id = %job.id, name = %job.original_name, "Job added");
            Ok(job)
        })
    }

    /// Close the input list. Returns how many jobs the batch holds.
    pub fn finish_collecting(&self, session: &str) -> Result<usize> {
        self.with_batch(session, |batch| batch.finish_collecting())
    }

    /// Store the encode parameters, or return examples when `raw` asks for help.
    pub fn set_parameters(&self, session: &str, raw: &str) -> Result<ParameterOutcome> {
        if is_help_request(raw) {
            return Ok(ParameterOutcome::Help(
                parameter_examples().iter().map(|s| s.to_string()).collect(),
            ));
        }

        let parameters = EncodeParameters::parse(raw)?;
        self.with_batch(session, |batch| batch.set_parameters(parameters.clone()))?;
        info!(session, parameters = parameters.raw(), "Parameters set");
        Ok(ParameterOutcome::Set(parameters))
    }

    /// Hand the batch to a scheduler. Returns the number of jobs started.
    pub async fn start_batch(&self, session: &str) -> Result<usize> {
        let (count, number, limit) = {
            let mut sessions = self.sessions.lock();
            let slot = sessions
                .get_mut(session)
                .ok_or_else(|| Error::NoBatch(session.to_string()))?;
            let batch = slot
                .batch
                .as_mut()
                .ok_or_else(|| Error::NoBatch(session.to_string()))?;

            let tickets = batch.start(&self.settings.work_dir)?;
            let count = tickets.len();
            let cancel = CancellationToken::new();
            let (updates_tx, updates_rx) = mpsc::unbounded_channel();
            let scheduler = Scheduler::new(
                self.executor.clone(),
                AdmissionPolicy {
                    concurrency_limit: batch.concurrency_limit,
                    stagger: self.settings.admission.stagger,
                },
            );
            let results = scheduler.schedule(tickets, updates_tx, cancel.clone());
            let driver = tokio::spawn(drive(
                self.sessions.clone(),
                self.sink.clone(),
                session.to_string(),
                batch.id.clone(),
                updates_rx,
                results,
            ));

            info!(session, batch = %batch.id, jobs = count, limit = batch.concurrency_limit, "Batch started");
            slot.run = Some(RunHandle { cancel, driver });
            (count, batch.number, batch.concurrency_limit)
        };

        self.notify(
            session,
            &format!(
                "🚀 Batch #{} started: {} jobs, up to {} at a time",
                number, count, limit
            ),
        )
        .await;
        Ok(count)
    }

    /// Cancel whatever the session has in progress.
    ///
    /// Safe at any point. A running batch has its token cancelled, which makes
    /// every runner kill its encoder; the records are marked `Cancelled` and the
    /// session is idle again before this waits (bounded) for the jobs to wind down.
    pub async fn cancel_batch(&self, session: &str) -> CancelOutcome {
        let (outcome, run, number, unstarted) = {
            let mut sessions = self.sessions.lock();
            let Some(slot) = sessions.get_mut(session) else {
                return CancelOutcome::NoOp;
            };
            let Some(batch) = slot.batch.as_mut() else {
                return CancelOutcome::NoOp;
            };

            let running = batch.state == BatchState::Running;
            // A running batch's inputs belong to the scheduler and its runners.
            let unstarted = (!running).then(|| batch.clone());
            let cancelled = batch.cancel();
            let number = batch.number;
            slot.last = slot.batch.take();
            let run = slot.run.take();

            if running {
                (CancelOutcome::Nuked { cancelled }, run, number, unstarted)
            } else {
                (CancelOutcome::Cleared { cancelled }, None, number, unstarted)
            }
        };

        if let Some(batch) = unstarted {
            discard_inputs(&batch);
        }

        if let Some(mut run) = run {
            warn!(session, number, "Nuking batch");
            run.cancel.cancel();
            if tokio::time::timeout(self.settings.nuke_grace, &mut run.driver)
                .await
                .is_err()
            {
                warn!(session, number, "Jobs did not wind down in time, detaching");
                run.driver.abort();
            }
        }

        if let CancelOutcome::Nuked { cancelled } = outcome {
            self.notify(
                session,
                &format!("☢️ Batch #{} nuked: {} jobs cancelled", number, cancelled),
            )
            .await;
        }
        info!(session, ?outcome, "Cancel handled");
        outcome
    }

    /// The session's current batch, or the last one it finished.
    pub fn batch(&self, session: &str) -> Option<Batch> {
        let sessions = self.sessions.lock();
        let slot = sessions.get(session)?;
        slot.batch.clone().or_else(|| slot.last.clone())
    }

    pub fn is_running(&self, session: &str) -> bool {
        self.sessions
            .lock()
            .get(session)
            .and_then(|slot| slot.batch.as_ref())
            .map_or(false, |batch| batch.state == BatchState::Running)
    }

    fn with_batch<T>(&self, session: &str, f: impl FnOnce(&mut Batch) -> Result<T>) -> Result<T> {
        let mut sessions = self.sessions.lock();
        let batch = sessions
            .get_mut(session)
            .and_then(|slot| slot.batch.as_mut())
            .ok_or_else(|| Error::NoBatch(session.to_string()))?;
        f(batch)
    }

    async fn notify(&self, session: &str, text: &str) {
        if let Err(e) = post_chunked(self.sink.as_ref(), session, text).await {
            warn!(session, error = %e, "Failed to post message");
        }
    }
}

fn discard_inputs(batch: &Batch) {
    for job in &batch.jobs {
        discard_staged_input(&job.id, &job.input_ref);
    }
}

fn is_help_request(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "help" | "?" | "examples"
    )
}

/// Apply one batch's updates until every job has reported, then close it out.
async fn drive<N: NotificationSink + ?Sized>(
    sessions: Sessions,
    sink: Arc<N>,
    session: String,
    batch_id: String,
    mut updates: mpsc::UnboundedReceiver<JobUpdate>,
    mut results: BoxStream<'static, JobResult>,
) {
    loop {
        tokio::select! {
            Some(update) = updates.recv() => apply_update(&sessions, &session, &batch_id, &update),
            result = results.next() => match result {
                Some(result) => debug!(
                    session = %session,
                    job_id = %result.job_id,
                    state = %result.outcome.state(),
                    "Job reached a terminal state"
                ),
                None => break,
            },
        }
    }
    // Terminal updates are sent before their results, so the rest is already queued.
    while let Ok(update) = updates.try_recv() {
        apply_update(&sessions, &session, &batch_id, &update);
    }

    let summary = {
        let mut sessions = sessions.lock();
        let Some(slot) = sessions.get_mut(&session) else {
            return;
        };
        if slot.batch.as_ref().map(|b| b.id.as_str()) != Some(batch_id.as_str()) {
            // Nuked or replaced while running.
            return;
        }
        let Some(mut batch) = slot.batch.take() else {
            return;
        };
        if !batch.try_complete() {
            warn!(session = %session, batch = %batch.id, "Scheduler finished with unfinished jobs");
            batch.cancel();
        }
        slot.run = None;

        let summary = render_batch_summary(
            batch.number,
            batch.count(JobState::Succeeded),
            batch.count(JobState::Failed),
            batch.count(JobState::Cancelled),
        );
        info!(session = %session, batch = %batch.id, state = %batch.state, "Batch finished");
        slot.last = Some(batch);
        summary
    };

    if let Err(e) = post_chunked(sink.as_ref(), &session, &summary).await {
        warn!(session = %session, error = %e, "Failed to post batch summary");
    }
}

fn apply_update(sessions: &Sessions, session: &str, batch_id: &str, update: &JobUpdate) {
    let mut sessions = sessions.lock();
    let Some(batch) = sessions
        .get_mut(session)
        .and_then(|slot| slot.batch.as_mut())
        .filter(|batch| batch.id == batch_id)
    else {
        return;
    };
    if !batch.apply(update) {
        debug!(session, job_id = %update.job_id, change = ?update.change, "Ignoring transition");
    }
}
