#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use guardian_common::checkpoint::{Checkpoint, CheckpointStore, PersistenceError};
use guardian_common::comment::{Comment, CommentPage};
use guardian_common::health::{HealthHandle, HealthRegistry};
use guardian_common::matcher::AhoCorasickMatcher;
use guardian_common::retry::RetryPolicy;
use guardian_worker::error::RemoteError;
use guardian_worker::pipeline::{Pipeline, PipelineSettings};
use guardian_worker::source::{CommentSource, Moderator};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn comment(id: &str, text: &str) -> Comment {
    Comment::new(id, text)
}

pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        queue_capacity: 8,
        page_size: 2,
        recent_limit: 50,
        poll_interval: Duration::from_millis(30),
        drain_timeout: Duration::from_millis(20),
        flush_threshold: 50,
        max_moderation_chunk: 2,
        moderation_status: "heldForReview".to_owned(),
        checkpoint_save_attempts: 2,
        liveness_deadline: Duration::from_secs(60),
        retry_policy: RetryPolicy::build(1, Duration::from_millis(1))
            .max_attempts(2)
            .provide(),
    }
}

pub fn liveness_handle(component: &str) -> HealthHandle {
    HealthRegistry::new("test").register(component, Duration::from_secs(60))
}

/// Poll `condition` until it holds, panicking after a generous timeout.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

/// A paginated comment listing held in memory.
///
/// Pages are served newest-first with their index as page token.
#[derive(Default)]
pub struct FakeSource {
    pages: Mutex<Vec<Vec<Comment>>>,
    recent: Mutex<Vec<Comment>>,
    failing_page: Mutex<Option<usize>>,
    pub page_calls: AtomicUsize,
    pub recent_calls: AtomicUsize,
}

impl FakeSource {
    pub fn with_pages(pages: Vec<Vec<Comment>>) -> Self {
        let source = Self::default();
        source.set_recent(pages.concat());
        *source.pages.lock().unwrap() = pages;
        source
    }

    pub fn set_recent(&self, newest_first: Vec<Comment>) {
        *self.recent.lock().unwrap() = newest_first;
    }

    pub fn fail_page(&self, index: Option<usize>) {
        *self.failing_page.lock().unwrap() = index;
    }
}

#[async_trait]
impl CommentSource for FakeSource {
    async fn list_page(
        &self,
        page_token: Option<&str>,
        _page_size: u32,
    ) -> Result<CommentPage, RemoteError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let index = page_token.map_or(0, |t| t.parse::<usize>().unwrap());

        if *self.failing_page.lock().unwrap() == Some(index) {
            return Err(RemoteError::permanent(format!("page {index} unavailable")));
        }

        let pages = self.pages.lock().unwrap();
        let items = pages.get(index).cloned().unwrap_or_default();
        let next_page_token = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(CommentPage {
            items,
            next_page_token,
        })
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Comment>, RemoteError> {
        self.recent_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .recent
            .lock()
            .unwrap()
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Records hidden ids. Chunks containing a rejected id fail transiently, chunks containing
/// a forbidden id fail permanently.
#[derive(Default)]
pub struct FakeModerator {
    hidden: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
    forbidden: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
    pub failed_calls: AtomicUsize,
}

impl FakeModerator {
    pub fn reject(&self, id: &str) {
        self.rejected.lock().unwrap().insert(id.to_owned());
    }

    /// Chunks containing `id` fail with a permanent error.
    pub fn forbid(&self, id: &str) {
        self.forbidden.lock().unwrap().insert(id.to_owned());
    }

    pub fn accept_all(&self) {
        self.rejected.lock().unwrap().clear();
    }

    pub fn hidden(&self) -> Vec<String> {
        self.hidden.lock().unwrap().clone()
    }

    pub fn hidden_set(&self) -> HashSet<String> {
        self.hidden().into_iter().collect()
    }
}

#[async_trait]
impl Moderator for FakeModerator {
    async fn set_moderation_status(&self, ids: &[String], status: &str) -> Result<(), RemoteError> {
        assert_eq!(status, "heldForReview");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ids
            .iter()
            .any(|id| self.forbidden.lock().unwrap().contains(id))
        {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(RemoteError::Permanent {
                status: Some(403),
                message: "forbidden".to_owned(),
            });
        }
        let rejected = self.rejected.lock().unwrap();
        if ids.iter().any(|id| rejected.contains(id)) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(RemoteError::Transient {
                status: Some(503),
                message: "backend error".to_owned(),
                retry_after: None,
            });
        }
        self.hidden.lock().unwrap().extend(ids.iter().cloned());
        Ok(())
    }
}

/// A checkpoint store that keeps every successful save.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    current: Mutex<Option<Checkpoint>>,
    history: Mutex<Vec<Checkpoint>>,
    failing: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn with(checkpoint: Checkpoint) -> Self {
        let store = Self::default();
        *store.current.lock().unwrap() = Some(checkpoint);
        store
    }

    pub fn current(&self) -> Checkpoint {
        self.current.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.lock().unwrap().clone()
    }

    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Checkpoint {
        self.current()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io {
                path: "memory".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        *self.current.lock().unwrap() = Some(checkpoint.clone());
        self.history.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }
}

/// Fakes wired into a full pipeline.
pub struct Harness {
    pub source: Arc<FakeSource>,
    pub moderator: Arc<FakeModerator>,
    pub store: Arc<MemoryCheckpointStore>,
    pub settings: PipelineSettings,
}

impl Harness {
    pub fn new(source: FakeSource, store: MemoryCheckpointStore) -> Self {
        Self {
            source: Arc::new(source),
            moderator: Arc::new(FakeModerator::default()),
            store: Arc::new(store),
            settings: fast_settings(),
        }
    }

    /// Start the pipeline in the background.
    pub async fn start(&self, phrases: &[&str]) -> RunningPipeline {
        let matcher = AhoCorasickMatcher::build(phrases).unwrap();
        let liveness = HealthRegistry::new("test");
        let pipeline = Pipeline::new(
            &self.settings,
            self.source.clone(),
            self.moderator.clone(),
            Arc::new(matcher),
            self.store.clone(),
            &liveness,
        )
        .await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pipeline.run(cancel.clone()));
        RunningPipeline {
            cancel,
            handle,
            liveness,
        }
    }
}

pub struct RunningPipeline {
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), tokio::task::JoinError>>,
    pub liveness: HealthRegistry,
}

impl RunningPipeline {
    /// Cancel and wait for both tasks to quiesce.
    pub async fn stop(self) {
        self.cancel.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
        assert!(joined.is_ok(), "pipeline did not stop in time");
    }
}

/// Run `future` and fail the test if it does not finish promptly.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
