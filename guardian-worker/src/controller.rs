use std::time::Duration;

use futures::StreamExt;
use guardian_common::checkpoint::{Checkpoint, Mode};
use guardian_common::health::HealthHandle;
use guardian_common::metrics::{COMMENTS_FETCHED, CYCLES, CYCLE_DURATION, DROPPED_ON_SHUTDOWN};
use guardian_common::queue::{PushError, QueueSender};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cycle::{CycleKind, CycleOutcome, Envelope, HEARTBEAT_INTERVAL};
use crate::fetcher::SourceFetcher;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub poll_interval: Duration,
    pub recent_limit: usize,
    /// Bounded wait to push already fetched comments once cancelled.
    pub drain_timeout: Duration,
}

/// How a single fetch cycle ended, from the controller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    Completed,
    /// Nothing newer than the cursor.
    Empty,
    Failed,
    Stopped,
}

impl CycleResult {
    fn as_str(&self) -> &'static str {
        match self {
            CycleResult::Completed => "completed",
            CycleResult::Empty => "empty",
            CycleResult::Failed => "failed",
            CycleResult::Stopped => "stopped",
        }
    }
}

enum Phase {
    Backfilling,
    Steady,
}

/// Drives the fetcher according to the pipeline mode and feeds the queue.
///
/// Exactly one cycle is in flight at a time: after streaming a cycle the controller
/// waits for the consumer to retire it before fetching again.
pub struct IngestionController {
    fetcher: SourceFetcher,
    queue: QueueSender<Envelope>,
    checkpoint: watch::Receiver<Checkpoint>,
    settings: ControllerSettings,
    liveness: HealthHandle,
}

impl IngestionController {
    pub fn new(
        fetcher: SourceFetcher,
        queue: QueueSender<Envelope>,
        checkpoint: watch::Receiver<Checkpoint>,
        settings: ControllerSettings,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            fetcher,
            queue,
            checkpoint,
            settings,
            liveness,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mode = self.checkpoint.borrow().mode;
        let mut phase = match mode {
            Mode::Steady => Phase::Steady,
            Mode::Uninitialized | Mode::Backfilling => Phase::Backfilling,
        };
        info!(%mode, "starting ingestion");

        let mut ticker = poll_ticker(Instant::now(), self.settings.poll_interval);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            self.liveness.report_healthy();

            match phase {
                Phase::Backfilling => match self.backfill_cycle(&cancel).await {
                    CycleResult::Completed | CycleResult::Empty => {
                        info!("backfill complete, switching to steady polling");
                        phase = Phase::Steady;
                        // The interval starts only once the backfill is fully retired.
                        ticker = poll_ticker(
                            Instant::now() + self.settings.poll_interval,
                            self.settings.poll_interval,
                        );
                    }
                    CycleResult::Failed => {
                        warn!(
                            retry_in_ms = self.settings.poll_interval.as_millis() as u64,
                            "backfill failed, rescanning after the poll interval"
                        );
                        if !self.pause(&cancel, self.settings.poll_interval).await {
                            break;
                        }
                    }
                    CycleResult::Stopped => break,
                },
                Phase::Steady => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                        _ = heartbeat.tick() => continue,
                    }

                    if self.incremental_cycle(&cancel).await == CycleResult::Stopped {
                        break;
                    }
                }
            }
        }

        info!("ingestion stopped");
    }

    /// Scan the whole history, newest-first, and wait for the consumer to retire it.
    pub async fn backfill_cycle(&self, cancel: &CancellationToken) -> CycleResult {
        let kind = CycleKind::Backfill;
        let started = Instant::now();

        let pages = self.fetcher.fetch_all(None);
        tokio::pin!(pages);

        let mut position: u64 = 0;
        let mut complete = true;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return record(kind, CycleResult::Stopped, started),
                next = pages.next() => next,
            };

            let comments = match next {
                None => break,
                Some(Ok(comments)) => comments,
                Some(Err(error)) => {
                    error!(%error, fetched = position, "backfill fetch failed, abandoning cycle");
                    complete = false;
                    break;
                }
            };

            self.liveness.report_healthy();
            metrics::counter!(COMMENTS_FETCHED, "cycle" => kind.as_str())
                .increment(comments.len() as u64);

            let envelopes = comments
                .into_iter()
                .map(|comment| {
                    // Newest-first: earlier positions rank higher.
                    let rank = u64::MAX - position;
                    position += 1;
                    Envelope::Comment {
                        comment,
                        kind,
                        rank,
                    }
                })
                .collect();

            if !self.stream(envelopes, cancel).await {
                return record(kind, CycleResult::Stopped, started);
            }
        }

        let result = match self.end_cycle(kind, complete, cancel).await {
            Some(CycleOutcome::Completed { cursor }) => {
                info!(%cursor, scanned = position, "backfill retired");
                if position == 0 {
                    CycleResult::Empty
                } else {
                    CycleResult::Completed
                }
            }
            Some(CycleOutcome::Failed) => CycleResult::Failed,
            None => CycleResult::Stopped,
        };
        record(kind, result, started)
    }

    /// Fetch comments newer than the cursor and stream them oldest-first.
    pub async fn incremental_cycle(&self, cancel: &CancellationToken) -> CycleResult {
        let kind = CycleKind::Incremental;
        let started = Instant::now();
        let cursor = self.checkpoint.borrow().cursor.clone();

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return record(kind, CycleResult::Stopped, started),
            fetched = self.fetcher.fetch_recent(&cursor, self.settings.recent_limit) => fetched,
        };

        let mut comments = match fetched {
            Ok(comments) => comments,
            Err(error) => {
                error!(%error, %cursor, "incremental fetch failed, retrying on the next tick");
                return record(kind, CycleResult::Failed, started);
            }
        };

        if comments.is_empty() {
            debug!(%cursor, "no new comments");
            return record(kind, CycleResult::Empty, started);
        }

        metrics::counter!(COMMENTS_FETCHED, "cycle" => kind.as_str())
            .increment(comments.len() as u64);
        comments.reverse();

        let envelopes = comments
            .into_iter()
            .enumerate()
            .map(|(index, comment)| Envelope::Comment {
                comment,
                kind,
                rank: index as u64,
            })
            .collect();

        if !self.stream(envelopes, cancel).await {
            return record(kind, CycleResult::Stopped, started);
        }

        let result = match self.end_cycle(kind, true, cancel).await {
            Some(CycleOutcome::Completed { cursor }) => {
                debug!(%cursor, "incremental cycle retired");
                CycleResult::Completed
            }
            Some(CycleOutcome::Failed) => CycleResult::Failed,
            None => CycleResult::Stopped,
        };
        record(kind, result, started)
    }

    /// Push envelopes in order, blocking on a full queue.
    ///
    /// Returns false if the pipeline is stopping. Envelopes not yet pushed at that point
    /// get a bounded drain attempt.
    async fn stream(&self, envelopes: Vec<Envelope>, cancel: &CancellationToken) -> bool {
        let mut pending = envelopes.into_iter();
        while let Some(envelope) = pending.next() {
            match self.queue.push(envelope, cancel).await {
                Ok(()) => {}
                Err(PushError::Cancelled(envelope)) => {
                    self.drain(std::iter::once(envelope).chain(pending)).await;
                    return false;
                }
                Err(_) => {
                    error!("queue closed, consumer is gone");
                    return false;
                }
            }
        }
        true
    }

    async fn drain(&self, envelopes: impl Iterator<Item = Envelope>) {
        let deadline = Instant::now() + self.settings.drain_timeout;
        let mut dropped = Vec::new();

        for envelope in envelopes {
            let envelope = if dropped.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.queue.push_timeout(envelope, remaining).await {
                    Ok(()) => continue,
                    Err(error) => error.into_inner(),
                }
            } else {
                envelope
            };

            if let Some(comment) = envelope.comment() {
                dropped.push(comment.id.clone());
            }
        }

        if !dropped.is_empty() {
            warn!(ids = ?dropped, "dropping fetched comments on shutdown");
            metrics::counter!(DROPPED_ON_SHUTDOWN).increment(dropped.len() as u64);
        }
    }

    /// Close the cycle and wait for the consumer's verdict. `None` when stopping.
    async fn end_cycle(
        &self,
        kind: CycleKind,
        complete: bool,
        cancel: &CancellationToken,
    ) -> Option<CycleOutcome> {
        let (reply, outcome) = oneshot::channel();
        let marker = Envelope::EndOfCycle {
            kind,
            complete,
            reply,
        };
        if !self.stream(vec![marker], cancel).await {
            return None;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = outcome => outcome.ok(),
        }
    }

    async fn pause(&self, cancel: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

fn poll_ticker(start: Instant, period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn record(kind: CycleKind, result: CycleResult, started: Instant) -> CycleResult {
    metrics::counter!(CYCLES, "cycle" => kind.as_str(), "outcome" => result.as_str()).increment(1);
    metrics::histogram!(CYCLE_DURATION, "cycle" => kind.as_str())
        .record(started.elapsed().as_millis() as f64);
    result
}
