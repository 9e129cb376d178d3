//! Rolling-window admission of a batch's jobs into the executor.

use crate::application::runner::{discard_staged_input, JobExecutor};
use crate::domain::jobs::{JobChange, JobResult, JobTicket, JobUpdate, TerminalState};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub concurrency_limit: usize,
    /// Delay between admissions while the first cohort fills its slots.
    pub stagger: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            stagger: Duration::from_secs(10),
        }
    }
}

pub struct Scheduler<E> {
    executor: Arc<E>,
    policy: AdmissionPolicy,
}

impl<E: JobExecutor> Scheduler<E> {
    pub fn new(executor: Arc<E>, policy: AdmissionPolicy) -> Self {
        Self { executor, policy }
    }

    /// Run `tickets` in order, at most `concurrency_limit` at a time.
    ///
    /// Every transition is requested through `updates`, the terminal one
    /// before the job's slot is released. The returned stream yields one
    /// result per ticket and ends once all of them are terminal. After
    /// `cancel` fires nothing more is admitted and jobs that never started
    /// come back `Cancelled`.
    pub fn schedule(
        &self,
        tickets: Vec<JobTicket>,
        updates: mpsc::UnboundedSender<JobUpdate>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, JobResult> {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        tokio::spawn(admit(
            self.executor.clone(),
            self.policy,
            tickets,
            updates,
            results_tx,
            cancel,
        ));

        stream::unfold(results_rx, |mut rx| async move {
            rx.recv().await.map(|result| (result, rx))
        })
        .boxed()
    }
}

async fn admit<E: JobExecutor>(
    executor: Arc<E>,
    policy: AdmissionPolicy,
    tickets: Vec<JobTicket>,
    updates: mpsc::UnboundedSender<JobUpdate>,
    results: mpsc::UnboundedSender<JobResult>,
    cancel: CancellationToken,
) {
    let limit = policy.concurrency_limit.max(1);
    let slots = Arc::new(Semaphore::new(limit));
    let mut queue: VecDeque<JobTicket> = tickets.into();
    let mut running = JoinSet::new();
    let mut admitted = 0usize;

    while let Some(ticket) = queue.pop_front() {
        if admitted > 0 && admitted < limit && !policy.stagger.is_zero() {
            let staggered = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(policy.stagger) => true,
            };
            if !staggered {
                queue.push_front(ticket);
                break;
            }
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = slots.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            queue.push_front(ticket);
            break;
        };

        admitted += 1;
        debug!(job_id = %ticket.job_id, admitted, "Admitting job");

        let executor = executor.clone();
        let updates = updates.clone();
        let results = results.clone();
        let cancel = cancel.clone();
        running.spawn(async move {
            let job_id = ticket.job_id.clone();
            let outcome = executor.run(ticket, updates.clone(), cancel).await;
            let _ = updates.send(JobUpdate {
                job_id: job_id.clone(),
                change: terminal_change(&outcome),
            });
            let _ = results.send(JobResult { job_id, outcome });
            drop(permit);
        });
    }

    if !queue.is_empty() {
        info!(skipped = queue.len(), "Admission stopped, cancelling jobs that never started");
    }
    for ticket in queue {
        discard_staged_input(&ticket.job_id, &ticket.input_ref);
        let _ = updates.send(JobUpdate {
            job_id: ticket.job_id.clone(),
            change: JobChange::Cancelled,
        });
        let _ = results.send(JobResult {
            job_id: ticket.job_id,
            outcome: TerminalState::Cancelled,
        });
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Job task did not finish");
        }
    }
}

fn terminal_change(outcome: &TerminalState) -> JobChange {
    match outcome {
        TerminalState::Succeeded { output_path, .. } => JobChange::Succeeded {
            output_path: output_path.clone(),
        },
        TerminalState::Failed(err) => JobChange::Failed(err.clone()),
        TerminalState::Cancelled => JobChange::Cancelled,
    }
}
