use std::sync::Arc;
use std::time::Duration;

use guardian_common::checkpoint::{Checkpoint, CheckpointStore, Mode};
use guardian_common::comment::Comment;
use guardian_common::health::HealthHandle;
use guardian_common::matcher::PhraseMatcher;
use guardian_common::metrics::{CHECKPOINT_SAVES, CHECKPOINT_SAVE_FAILURES, COMMENTS_MATCHED};
use guardian_common::queue::QueueReceiver;
use guardian_common::retry::{RetryPolicy, Retryable};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cycle::{CycleKind, CycleOutcome, Envelope, HEARTBEAT_INTERVAL};
use crate::error::ActionError;
use crate::executor::ActionExecutor;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Pending matches that trigger a flush to the executor.
    pub flush_threshold: usize,
    pub save_attempts: u32,
}

/// Bookkeeping for the cycle currently being retired.
#[derive(Default)]
struct CycleState {
    kind: Option<CycleKind>,
    pending_hide: Vec<String>,
    /// Highest ranked comment matched or cleared since the last flush.
    newest_unsettled: Option<(u64, String)>,
    committed_rank: Option<u64>,
    /// Set once an action or save failed. The cursor stays put for the rest of the cycle.
    poisoned: bool,
}

/// Drains the queue, matches comments, hides matches and advances the checkpoint.
///
/// The consumer is the only writer of the checkpoint. The cursor only moves past a
/// comment once its hide, if any, has succeeded.
pub struct ModerationConsumer {
    matcher: Arc<dyn PhraseMatcher>,
    executor: ActionExecutor,
    store: Arc<dyn CheckpointStore>,
    settings: ConsumerSettings,
    save_policy: RetryPolicy,
    liveness: HealthHandle,
    checkpoint: Checkpoint,
    published: watch::Sender<Checkpoint>,
    cycle: CycleState,
}

impl ModerationConsumer {
    /// Returns the consumer and a receiver observing every checkpoint it persists.
    pub fn new(
        matcher: Arc<dyn PhraseMatcher>,
        executor: ActionExecutor,
        store: Arc<dyn CheckpointStore>,
        checkpoint: Checkpoint,
        settings: ConsumerSettings,
        liveness: HealthHandle,
    ) -> (Self, watch::Receiver<Checkpoint>) {
        let (published, observed) = watch::channel(checkpoint.clone());
        let save_policy = RetryPolicy::build(2, Duration::from_millis(100))
            .maximum_interval(Duration::from_secs(2))
            .max_attempts(settings.save_attempts)
            .provide();

        let consumer = Self {
            matcher,
            executor,
            store,
            settings,
            save_policy,
            liveness,
            checkpoint,
            published,
            cycle: CycleState::default(),
        };
        (consumer, observed)
    }

    pub async fn run(mut self, mut queue: QueueReceiver<Envelope>, cancel: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("cancellation received, stopping consumer");
                    self.drain(&mut queue).await;
                    break;
                }
                envelope = queue.pop() => match envelope {
                    Some(envelope) => envelope,
                    None => {
                        info!("queue closed, stopping consumer");
                        break;
                    }
                },
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    self.liveness.report_healthy();
                    continue;
                }
            };

            self.liveness.report_healthy();
            self.handle(envelope).await;

            if queue.is_empty() {
                self.flush().await;
            }
        }

        // Everything dequeued so far is retired before exiting.
        self.flush().await;
    }

    /// Close the queue to new pushes and retire whatever was already accepted.
    async fn drain(&mut self, queue: &mut QueueReceiver<Envelope>) {
        queue.close();
        let mut drained = 0;
        // Closed, so this ends once the buffered items and in-flight permits are consumed.
        while let Some(envelope) = queue.pop().await {
            drained += 1;
            self.handle(envelope).await;
        }
        if drained > 0 {
            info!(drained, "retired queued items on shutdown");
        }
    }

    async fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Comment {
                comment,
                kind,
                rank,
            } => self.process(comment, kind, rank).await,
            Envelope::EndOfCycle {
                kind,
                complete,
                reply,
            } => {
                let outcome = self.finish_cycle(kind, complete).await;
                if reply.send(outcome).is_err() {
                    debug!(cycle = %kind, "controller stopped waiting for the cycle outcome");
                }
            }
        }
    }

    async fn process(&mut self, comment: Comment, kind: CycleKind, rank: u64) {
        self.begin_cycle(kind).await;

        if kind == CycleKind::Incremental && comment.id == self.checkpoint.cursor {
            debug!(comment_id = %comment.id, "skipping already retired comment");
            return;
        }

        let matched = self.matcher.find(&comment.text);
        if !matched.is_empty() {
            info!(comment_id = %comment.id, phrases = ?matched, "comment matched banned phrases");
            metrics::counter!(COMMENTS_MATCHED).increment(1);
            self.cycle.pending_hide.push(comment.id.clone());
        }

        let is_newest = self
            .cycle
            .newest_unsettled
            .as_ref()
            .map_or(true, |(newest, _)| rank > *newest);
        if is_newest {
            self.cycle.newest_unsettled = Some((rank, comment.id));
        }

        if self.cycle.pending_hide.len() >= self.settings.flush_threshold {
            self.flush().await;
        }
    }

    async fn begin_cycle(&mut self, kind: CycleKind) {
        match self.cycle.kind {
            Some(current) if current == kind => {}
            Some(current) => {
                warn!(previous = %current, next = %kind, "cycle ended without a marker");
                self.flush().await;
                self.cycle = CycleState {
                    kind: Some(kind),
                    ..Default::default()
                };
            }
            None => self.cycle.kind = Some(kind),
        }
    }

    /// Hide pending matches, then advance the cursor to the newest comment retired since.
    async fn flush(&mut self) {
        let ids = std::mem::take(&mut self.cycle.pending_hide);
        let newest = self.cycle.newest_unsettled.take();

        if !ids.is_empty() {
            if let Err(error) = self.hide(&ids).await {
                error!(
                    ids = ?error.failed_ids(),
                    cursor = %self.checkpoint.cursor,
                    %error,
                    "moderation failed, holding checkpoint back for this cycle"
                );
                self.cycle.poisoned = true;
            }
        }

        if self.cycle.poisoned {
            return;
        }

        if let Some((rank, cursor)) = newest {
            let advances = self
                .cycle
                .committed_rank
                .map_or(true, |committed| rank > committed);
            if advances {
                self.commit(rank, cursor).await;
            }
        }
    }

    /// The executor retries each chunk. Chunks that still failed with a transient error get
    /// one more round. Permanent rejections are surfaced as they are.
    async fn hide(&self, ids: &[String]) -> Result<(), ActionError> {
        let ActionError {
            failed,
            total_chunks,
        } = match self.executor.hide(ids).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let (retryable, mut failed): (Vec<_>, Vec<_>) = failed
            .into_iter()
            .partition(|chunk| chunk.error.is_retryable());

        if !retryable.is_empty() {
            let retry_ids: Vec<String> = retryable
                .into_iter()
                .flat_map(|chunk| chunk.ids)
                .collect();
            warn!(ids = ?retry_ids, "retrying failed moderation chunks");
            if let Err(error) = self.executor.hide(&retry_ids).await {
                failed.extend(error.failed);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ActionError {
                failed,
                total_chunks,
            })
        }
    }

    async fn commit(&mut self, rank: u64, cursor: String) {
        let mode = match self.cycle.kind {
            Some(CycleKind::Backfill) => Mode::Backfilling,
            _ => Mode::Steady,
        };

        if self.save(Checkpoint::new(mode, cursor)).await {
            self.cycle.committed_rank = Some(rank);
        } else {
            self.cycle.poisoned = true;
        }
    }

    async fn finish_cycle(&mut self, kind: CycleKind, complete: bool) -> CycleOutcome {
        self.begin_cycle(kind).await;
        self.flush().await;

        let poisoned = self.cycle.poisoned;
        let outcome = if !complete || poisoned {
            CycleOutcome::Failed
        } else if kind == CycleKind::Backfill
            && !self
                .save(Checkpoint::steady(self.checkpoint.cursor.clone()))
                .await
        {
            CycleOutcome::Failed
        } else {
            CycleOutcome::Completed {
                cursor: self.checkpoint.cursor.clone(),
            }
        };

        info!(cycle = %kind, complete, poisoned, ?outcome, "cycle retired");
        self.cycle = CycleState::default();
        outcome
    }

    async fn save(&mut self, checkpoint: Checkpoint) -> bool {
        let store = &self.store;
        let result = self
            .save_policy
            .run(|_| store.save(&checkpoint))
            .await;

        match result {
            Ok(()) => {
                debug!(mode = %checkpoint.mode, cursor = %checkpoint.cursor, "checkpoint saved");
                metrics::counter!(CHECKPOINT_SAVES).increment(1);
                self.published.send_replace(checkpoint.clone());
                self.checkpoint = checkpoint;
                true
            }
            Err(error) => {
                error!(
                    mode = %checkpoint.mode,
                    cursor = %checkpoint.cursor,
                    %error,
                    "failed to save checkpoint"
                );
                metrics::counter!(CHECKPOINT_SAVE_FAILURES).increment(1);
                false
            }
        }
    }
}
