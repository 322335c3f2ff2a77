//! # Queue
//!
//! The bounded hand-off between the ingestion producer and the moderation consumer.
//! Pushing blocks once `capacity` items are waiting, so fetching is throttled by
//! processing speed instead of buffering without limit.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::metrics::QUEUE_DEPTH;

/// A push that did not happen. The item is handed back so the caller decides its fate.
#[derive(Error, Debug)]
pub enum PushError<T> {
    #[error("cancelled while waiting for queue capacity")]
    Cancelled(T),
    #[error("timed out while waiting for queue capacity")]
    TimedOut(T),
    #[error("queue receiver is gone")]
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Cancelled(item) | PushError::TimedOut(item) | PushError::Closed(item) => {
                item
            }
        }
    }
}

/// Result of a non-blocking pop.
#[derive(Debug)]
pub enum TryPop<T> {
    Item(T),
    Empty,
    Closed,
}

/// Create a bounded queue holding at most `capacity` items.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let depth = Arc::new(AtomicUsize::new(0));

    (
        QueueSender {
            inner: tx,
            depth: depth.clone(),
        },
        QueueReceiver { inner: rx, depth },
    )
}

pub struct QueueSender<T> {
    inner: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueSender<T> {
    /// Push an item, waiting for capacity until the item is accepted or `cancel` fires.
    pub async fn push(&self, item: T, cancel: &CancellationToken) -> Result<(), PushError<T>> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PushError::Cancelled(item)),
            permit = self.inner.reserve() => permit,
        };

        match permit {
            Ok(permit) => {
                self.record_push();
                permit.send(item);
                Ok(())
            }
            Err(_) => Err(PushError::Closed(item)),
        }
    }

    /// Push an item, waiting at most `timeout` for capacity.
    pub async fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        self.record_push();
        let result = self.inner.send_timeout(item, timeout).await;
        if result.is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        match result {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(item)) => Err(PushError::TimedOut(item)),
            Err(SendTimeoutError::Closed(item)) => Err(PushError::Closed(item)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_capacity()
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    // Counted before the send so a racing pop never observes a negative depth.
    fn record_push(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!(QUEUE_DEPTH).set(depth as f64);
    }
}

pub struct QueueReceiver<T> {
    inner: mpsc::Receiver<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    /// Wait for the next item. Returns `None` once every sender is gone and the queue is drained.
    ///
    /// Cancel safe: dropping the future before it completes loses no item.
    pub async fn pop(&mut self) -> Option<T> {
        let item = self.inner.recv().await;
        if item.is_some() {
            self.record_pop();
        }
        item
    }

    /// Refuse further pushes. Items already queued can still be popped, after which
    /// `pop` returns `None`.
    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn try_pop(&mut self) -> TryPop<T> {
        match self.inner.try_recv() {
            Ok(item) => {
                self.record_pop();
                TryPop::Item(item)
            }
            Err(TryRecvError::Empty) => TryPop::Empty,
            Err(TryRecvError::Disconnected) => TryPop::Closed,
        }
    }

    /// Items waiting in the queue. May briefly overcount while a push is in progress.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    fn record_pop(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!(QUEUE_DEPTH).set(depth as f64);
    }
}
