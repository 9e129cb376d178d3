//! Rate-limited progress rendering for one job.

use crate::domain::report::{render_progress, truncate_message, Baseline};
use crate::domain::telemetry::ProgressSnapshot;
use crate::error::SinkError;
use crate::ports::notifier::{MessageId, NotificationSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A message that is posted once and then edited in place.
pub struct StatusMessage<N: ?Sized> {
    sink: Arc<N>,
    session: String,
    id: Option<MessageId>,
}

impl<N: NotificationSink + ?Sized> StatusMessage<N> {
    pub fn new(sink: Arc<N>, session: impl Into<String>) -> Self {
        Self {
            sink,
            session: session.into(),
            id: None,
        }
    }

    pub async fn show(&mut self, text: &str) -> Result<(), SinkError> {
        let text = truncate_message(text, self.sink.max_message_len());
        match self.id {
            Some(id) => self.sink.edit(&self.session, id, &text).await,
            None => {
                self.id = Some(self.sink.post(&self.session, &text).await?);
                Ok(())
            }
        }
    }
}

pub struct ProgressReporter<N: ?Sized> {
    status: StatusMessage<N>,
    job_id: String,
    name: String,
    baseline: Baseline,
    started: Instant,
    interval: Duration,
}

impl<N: NotificationSink + ?Sized> ProgressReporter<N> {
    pub fn new(
        sink: Arc<N>,
        session: &str,
        job_id: &str,
        name: &str,
        baseline: Baseline,
        interval: Duration,
    ) -> Self {
        Self {
            status: StatusMessage::new(sink, session),
            job_id: job_id.to_string(),
            name: name.to_string(),
            baseline,
            started: Instant::now(),
            interval,
        }
    }

    /// Render snapshots from `updates` until `done` fires or the sender goes away.
    ///
    /// At most one render per interval. Snapshots sent in between replace
    /// each other; only the latest is rendered. Returns the number of renders
    /// attempted.
    pub async fn run(
        mut self,
        mut updates: watch::Receiver<ProgressSnapshot>,
        done: CancellationToken,
    ) -> usize {
        let mut renders = 0;
        loop {
            tokio::select! {
                biased;
                _ = done.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let snapshot = updates.borrow_and_update().clone();
            let text = render_progress(
                &self.name,
                &snapshot,
                &self.baseline,
                self.started.elapsed(),
            );
            renders += 1;
            match self.status.show(&text).await {
                Ok(()) => debug!(job_id = %self.job_id, sequence = snapshot.sequence, "Progress rendered"),
                Err(e) => warn!(job_id = %self.job_id, error = %e, "Progress update rejected"),
            }

            tokio::select! {
                biased;
                _ = done.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        renders
    }
}
