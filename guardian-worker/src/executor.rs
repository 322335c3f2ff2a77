use std::collections::HashSet;
use std::sync::Arc;

use guardian_common::metrics::{COMMENTS_HIDDEN, MODERATION_CHUNK_FAILURES};
use guardian_common::retry::RetryPolicy;
use tracing::{debug, error};

use crate::error::{ActionError, FailedChunk};
use crate::source::Moderator;

/// Applies the moderation action to batches of comment ids.
pub struct ActionExecutor {
    moderator: Arc<dyn Moderator>,
    status: String,
    max_chunk_size: usize,
    retry_policy: RetryPolicy,
}

impl ActionExecutor {
    pub fn new(
        moderator: Arc<dyn Moderator>,
        status: &str,
        max_chunk_size: usize,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            moderator,
            status: status.to_owned(),
            max_chunk_size: max_chunk_size.max(1),
            retry_policy,
        }
    }

    /// Hide every id in `ids`. An empty batch is a no-op.
    ///
    /// Batches above the remote limit are split into chunks, each retried on its own.
    /// Chunks that still fail are all reported, so only those need another attempt.
    pub async fn hide(&self, ids: &[String]) -> Result<(), ActionError> {
        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        if ids.is_empty() {
            return Ok(());
        }

        let chunks: Vec<&[String]> = ids.chunks(self.max_chunk_size).collect();
        let total_chunks = chunks.len();
        let mut failed = Vec::new();

        for chunk in chunks {
            let result = self
                .retry_policy
                .run(|attempt| {
                    debug!(ids = ?chunk, attempt, status = %self.status, "setting moderation status");
                    self.moderator.set_moderation_status(chunk, &self.status)
                })
                .await;

            match result {
                Ok(()) => {
                    metrics::counter!(COMMENTS_HIDDEN).increment(chunk.len() as u64);
                }
                Err(error) => {
                    error!(ids = ?chunk, %error, "failed to set moderation status");
                    metrics::counter!(MODERATION_CHUNK_FAILURES).increment(1);
                    failed.push(FailedChunk {
                        ids: chunk.to_vec(),
                        error,
                    });
                }
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
}
