use std::sync::Arc;
use std::time::Duration;

use guardian_common::checkpoint::CheckpointStore;
use guardian_common::health::HealthRegistry;
use guardian_common::matcher::PhraseMatcher;
use guardian_common::queue::{self, QueueReceiver};
use guardian_common::retry::RetryPolicy;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::consumer::{ConsumerSettings, ModerationConsumer};
use crate::controller::{ControllerSettings, IngestionController};
use crate::cycle::Envelope;
use crate::executor::ActionExecutor;
use crate::fetcher::SourceFetcher;
use crate::source::{CommentSource, Moderator};

/// Everything the pipeline components are configured with.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub page_size: u32,
    pub recent_limit: usize,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub flush_threshold: usize,
    pub max_moderation_chunk: usize,
    pub moderation_status: String,
    pub checkpoint_save_attempts: u32,
    pub liveness_deadline: Duration,
    pub retry_policy: RetryPolicy,
}

impl PipelineSettings {
    pub fn controller(&self) -> ControllerSettings {
        ControllerSettings {
            poll_interval: self.poll_interval,
            recent_limit: self.recent_limit,
            drain_timeout: self.drain_timeout,
        }
    }

    pub fn consumer(&self) -> ConsumerSettings {
        ConsumerSettings {
            flush_threshold: self.flush_threshold.max(1),
            save_attempts: self.checkpoint_save_attempts,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 150,
            page_size: 100,
            recent_limit: 50,
            poll_interval: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(5),
            flush_threshold: 50,
            max_moderation_chunk: 50,
            moderation_status: "heldForReview".to_owned(),
            checkpoint_save_attempts: 3,
            liveness_deadline: Duration::from_secs(600),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// The controller and consumer, wired through one bounded queue.
pub struct Pipeline {
    controller: IngestionController,
    consumer: ModerationConsumer,
    queue: QueueReceiver<Envelope>,
}

impl Pipeline {
    /// Load the checkpoint and assemble both tasks. Nothing runs until `run`.
    pub async fn new(
        settings: &PipelineSettings,
        source: Arc<dyn CommentSource>,
        moderator: Arc<dyn Moderator>,
        matcher: Arc<dyn PhraseMatcher>,
        store: Arc<dyn CheckpointStore>,
        liveness: &HealthRegistry,
    ) -> Self {
        let checkpoint = store.load().await;
        info!(mode = %checkpoint.mode, cursor = %checkpoint.cursor, "loaded checkpoint");

        let (sender, receiver) = queue::bounded(settings.queue_capacity);

        let executor = ActionExecutor::new(
            moderator,
            &settings.moderation_status,
            settings.max_moderation_chunk,
            settings.retry_policy.clone(),
        );
        let (consumer, observed) = ModerationConsumer::new(
            matcher,
            executor,
            store,
            checkpoint,
            settings.consumer(),
            liveness.register("moderation", settings.liveness_deadline),
        );

        let fetcher = SourceFetcher::new(source, settings.page_size, settings.retry_policy.clone());
        let controller = IngestionController::new(
            fetcher,
            sender,
            observed,
            settings.controller(),
            liveness.register("ingestion", settings.liveness_deadline),
        );

        Self {
            controller,
            consumer,
            queue: receiver,
        }
    }

    /// Run both tasks until `cancel` fires and both have quiesced.
    ///
    /// If either task ends on its own, the other one is cancelled too.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), JoinError> {
        let Pipeline {
            controller,
            consumer,
            queue,
        } = self;

        let consumer_cancel = cancel.clone();
        let consumer = tokio::spawn(async move {
            consumer.run(queue, consumer_cancel.clone()).await;
            consumer_cancel.cancel();
        });

        let controller_cancel = cancel.clone();
        let controller = tokio::spawn(async move {
            controller.run(controller_cancel.clone()).await;
            controller_cancel.cancel();
        });

        let (controller_result, consumer_result) = tokio::join!(controller, consumer);
        info!("pipeline stopped");
        controller_result.and(consumer_result)
    }
}
