use async_trait::async_trait;
use guardian_common::comment::{Comment, CommentPage};

use crate::error::RemoteError;

pub mod youtube;

/// Paginated read access to the comments of the monitored channel.
#[async_trait]
pub trait CommentSource: Send + Sync {
    /// One page of the full listing, newest-first. `None` requests the first page.
    async fn list_page(
        &self,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<CommentPage, RemoteError>;

    /// Up to `limit` of the most recent comments, newest-first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Comment>, RemoteError>;
}

/// Write access to comment moderation status.
#[async_trait]
pub trait Moderator: Send + Sync {
    async fn set_moderation_status(&self, ids: &[String], status: &str)
        -> Result<(), RemoteError>;
}
