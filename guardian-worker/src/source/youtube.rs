use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use guardian_common::comment::{Comment, CommentPage};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{CommentSource, Moderator};
use crate::credentials::TokenProvider;
use crate::error::RemoteError;

/// The API caps `maxResults` for comment thread listings.
const MAX_RESULTS_CAP: usize = 100;
const MAX_ERROR_BODY_BYTES: usize = 512;

/// Comment listing and moderation against the YouTube Data API v3.
pub struct YouTubeClient {
    client: Client,
    base_url: String,
    channel_id: String,
    tokens: Arc<dyn TokenProvider>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListResponse {
    #[serde(default)]
    items: Vec<Thread>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct Thread {
    snippet: ThreadSnippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadSnippet {
    top_level_comment: TopLevelComment,
}

#[derive(Deserialize)]
struct TopLevelComment {
    id: String,
    snippet: CommentSnippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    text_original: Option<String>,
    #[serde(default)]
    text_display: String,
}

impl From<Thread> for Comment {
    fn from(thread: Thread) -> Self {
        let comment = thread.snippet.top_level_comment;
        let text = comment
            .snippet
            .text_original
            .unwrap_or(comment.snippet.text_display);
        Comment::new(comment.id, text)
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

impl YouTubeClient {
    pub fn new(
        client: Client,
        base_url: &str,
        channel_id: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            channel_id: channel_id.to_owned(),
            tokens,
        }
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, RemoteError> {
        let token = self.tokens.access_token().await?;
        Ok(request.bearer_auth(token))
    }

    async fn list_threads(
        &self,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<ThreadListResponse, RemoteError> {
        let max_results = max_results.clamp(1, MAX_RESULTS_CAP).to_string();
        let mut query = vec![
            ("part", "snippet"),
            ("allThreadsRelatedToChannelId", self.channel_id.as_str()),
            ("order", "time"),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let request = self
            .client
            .get(format!("{}/commentThreads", self.base_url))
            .query(&query);
        let response = self.authorized(request).await?.send().await?;
        let response = check_response(response).await?;

        Ok(response.json().await?)
    }
}

#[async_trait]
impl CommentSource for YouTubeClient {
    async fn list_page(
        &self,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<CommentPage, RemoteError> {
        let listing = self.list_threads(page_token, page_size as usize).await?;
        debug!(
            page_token,
            items = listing.items.len(),
            next_page_token = listing.next_page_token.as_deref(),
            "fetched comment page"
        );

        Ok(CommentPage {
            items: listing.items.into_iter().map(Comment::from).collect(),
            next_page_token: listing.next_page_token,
        })
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Comment>, RemoteError> {
        let listing = self.list_threads(None, limit).await?;
        Ok(listing
            .items
            .into_iter()
            .take(limit)
            .map(Comment::from)
            .collect())
    }
}

#[async_trait]
impl Moderator for YouTubeClient {
    async fn set_moderation_status(
        &self,
        ids: &[String],
        status: &str,
    ) -> Result<(), RemoteError> {
        let ids = ids.join(",");
        let request = self
            .client
            .post(format!("{}/comments/setModerationStatus", self.base_url))
            .query(&[("id", ids.as_str()), ("moderationStatus", status)]);
        let response = self.authorized(request).await?.send().await?;
        check_response(response).await?;

        Ok(())
    }
}

/// Turn a non-success response into a classified `RemoteError`.
async fn check_response(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after_header(response.headers());
    let body = response.text().await.unwrap_or_default();
    let message = first_n_bytes(&body, MAX_ERROR_BODY_BYTES).to_owned();

    if is_retryable_status(status) || is_rate_limited(status, &body) {
        Err(RemoteError::Transient {
            status: Some(status.as_u16()),
            message,
            retry_after,
        })
    } else {
        Err(RemoteError::Permanent {
            status: Some(status.as_u16()),
            message,
        })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Quota and rate limit errors come back as 403 with a distinguishing reason.
fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status != StatusCode::FORBIDDEN {
        return false;
    }
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| {
            envelope.error.errors.iter().any(|detail| {
                detail.reason == "rateLimitExceeded" || detail.reason == "userRateLimitExceeded"
            })
        })
        .unwrap_or(false)
}

/// Attempt to parse a Retry-After header, given either as seconds or as an RFC2822 date.
fn parse_retry_after_header(header_map: &reqwest::header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

fn first_n_bytes(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut end = n;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
