use std::sync::Arc;

use futures::stream::{self, Stream};
use guardian_common::comment::Comment;
use guardian_common::metrics::RECENT_WINDOW_OVERFLOW;
use guardian_common::retry::RetryPolicy;
use tracing::warn;

use crate::error::FetchError;
use crate::source::CommentSource;

enum PageState {
    Next(Option<String>),
    Done,
}

/// Cursor-aware reads over a `CommentSource`, with per-request retries.
pub struct SourceFetcher {
    source: Arc<dyn CommentSource>,
    page_size: u32,
    retry_policy: RetryPolicy,
}

impl SourceFetcher {
    pub fn new(source: Arc<dyn CommentSource>, page_size: u32, retry_policy: RetryPolicy) -> Self {
        Self {
            source,
            page_size,
            retry_policy,
        }
    }

    /// Walk every page of the historical listing, newest-first, starting at `resume_from`.
    ///
    /// Each page is fetched lazily and retried on its own. A page that still fails ends the
    /// stream with an error carrying the page token, so a caller can resume from it.
    pub fn fetch_all(
        &self,
        resume_from: Option<String>,
    ) -> impl Stream<Item = Result<Vec<Comment>, FetchError>> + Send + '_ {
        stream::unfold(PageState::Next(resume_from), move |state| async move {
            let page_token = match state {
                PageState::Next(token) => token,
                PageState::Done => return None,
            };

            let result = self
                .retry_policy
                .run(|_| self.source.list_page(page_token.as_deref(), self.page_size))
                .await;

            match result {
                Ok(page) => {
                    let next = if page.is_last() {
                        PageState::Done
                    } else if page.next_page_token == page_token {
                        warn!(page_token = ?page_token, "source returned the same page token, stopping");
                        PageState::Done
                    } else {
                        PageState::Next(page.next_page_token)
                    };
                    Some((Ok(page.items), next))
                }
                Err(source) => Some((
                    Err(FetchError::Page { page_token, source }),
                    PageState::Done,
                )),
            }
        })
    }

    /// Comments strictly newer than `cursor`, newest-first, at most `limit` of them.
    ///
    /// Only one window of `limit` items is read. If more than `limit` comments arrived
    /// since `cursor`, the older ones are not returned; this is reported but not repaired.
    pub async fn fetch_recent(&self, cursor: &str, limit: usize) -> Result<Vec<Comment>, FetchError> {
        let items = self
            .retry_policy
            .run(|_| self.source.list_recent(limit))
            .await
            .map_err(FetchError::Recent)?;

        let window = items.len();
        let mut recent: Vec<Comment> = items
            .into_iter()
            .take_while(|comment| cursor.is_empty() || comment.id != cursor)
            .collect();

        if window_overflowed(cursor, window, recent.len(), limit) {
            warn!(
                cursor,
                window,
                "cursor not found in recent window, older comments may be missed"
            );
            metrics::counter!(RECENT_WINDOW_OVERFLOW).increment(1);
        }

        recent.truncate(limit);
        Ok(recent)
    }
}

/// The cursor fell out of a full window, so comments between it and the window are unseen.
///
/// A short window without the cursor means the listing simply holds fewer comments.
fn window_overflowed(cursor: &str, window: usize, newer: usize, limit: usize) -> bool {
    !cursor.is_empty() && window >= limit && newer == window
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use guardian_common::comment::CommentPage;

    use super::*;
    use crate::error::RemoteError;

    /// Serves scripted responses in order.
    struct ScriptedSource {
        pages: Mutex<Vec<Result<CommentPage, RemoteError>>>,
        recent: Vec<Comment>,
        requested_tokens: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<CommentPage, RemoteError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into_iter().rev().collect()),
                recent: Vec::new(),
                requested_tokens: Mutex::new(Vec::new()),
            }
        }

        fn with_recent(ids: &[&str]) -> Self {
            Self {
                pages: Mutex::new(Vec::new()),
                recent: ids.iter().map(|id| Comment::new(*id, "text")).collect(),
                requested_tokens: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommentSource for ScriptedSource {
        async fn list_page(
            &self,
            page_token: Option<&str>,
            _page_size: u32,
        ) -> Result<CommentPage, RemoteError> {
            self.requested_tokens
                .lock()
                .unwrap()
                .push(page_token.map(str::to_owned));
            self.pages
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(CommentPage::default()))
        }

        async fn list_recent(&self, limit: usize) -> Result<Vec<Comment>, RemoteError> {
            Ok(self.recent.iter().take(limit).cloned().collect())
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> Result<CommentPage, RemoteError> {
        Ok(CommentPage {
            items: ids.iter().map(|id| Comment::new(*id, "text")).collect(),
            next_page_token: next.map(str::to_owned),
        })
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::build(1, Duration::from_millis(1))
            .max_attempts(3)
            .provide()
    }

    fn ids(comments: &[Comment]) -> Vec<&str> {
        comments.iter().map(|c| c.id.as_str()).collect()
    }

    #[tokio::test]
    async fn fetch_all_walks_every_page() {
        let source = Arc::new(ScriptedSource::new(vec![
            page(&["e", "d"], Some("p2")),
            page(&["c", "b"], Some("p3")),
            page(&["a"], Some("")),
        ]));
        let fetcher = SourceFetcher::new(source.clone(), 2, policy());

        let pages: Vec<_> = fetcher.fetch_all(None).collect().await;
        let pages: Vec<Vec<Comment>> = pages.into_iter().map(Result::unwrap).collect();

        assert_eq!(pages.len(), 3);
        assert_eq!(ids(&pages.concat()), vec!["e", "d", "c", "b", "a"]);
        assert_eq!(
            *source.requested_tokens.lock().unwrap(),
            vec![None, Some("p2".to_owned()), Some("p3".to_owned())]
        );
    }

    #[tokio::test]
    async fn fetch_all_retries_a_page_then_continues() {
        let source = Arc::new(ScriptedSource::new(vec![
            page(&["b"], Some("p2")),
            Err(RemoteError::transient("timeout")),
            page(&["a"], None),
        ]));
        let fetcher = SourceFetcher::new(source.clone(), 1, policy());

        let pages: Vec<_> = fetcher.fetch_all(None).collect().await;
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(Result::is_ok));
        assert_eq!(
            *source.requested_tokens.lock().unwrap(),
            vec![None, Some("p2".to_owned()), Some("p2".to_owned())]
        );
    }

    #[tokio::test]
    async fn fetch_all_ends_with_error_naming_the_page() {
        let source = Arc::new(ScriptedSource::new(vec![
            page(&["b"], Some("p2")),
            Err(RemoteError::permanent("forbidden")),
        ]));
        let fetcher = SourceFetcher::new(source, 1, policy());

        let pages: Vec<_> = fetcher.fetch_all(None).collect().await;
        assert_eq!(pages.len(), 2);
        match &pages[1] {
            Err(FetchError::Page { page_token, .. }) => {
                assert_eq!(page_token.as_deref(), Some("p2"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_all_resumes_from_token_and_handles_empty_listing() {
        let source = Arc::new(ScriptedSource::new(vec![page(&[], None)]));
        let fetcher = SourceFetcher::new(source.clone(), 1, policy());

        let pages: Vec<_> = fetcher.fetch_all(Some("p9".to_owned())).collect().await;
        assert_eq!(pages.len(), 1);
        assert!(pages[0].as_ref().unwrap().is_empty());
        assert_eq!(
            *source.requested_tokens.lock().unwrap(),
            vec![Some("p9".to_owned())]
        );
    }

    #[tokio::test]
    async fn fetch_recent_stops_before_cursor() {
        let source = Arc::new(ScriptedSource::with_recent(&["e", "d", "c", "b"]));
        let fetcher = SourceFetcher::new(source, 100, policy());

        let recent = fetcher.fetch_recent("c", 50).await.unwrap();
        assert_eq!(ids(&recent), vec!["e", "d"]);
    }

    #[tokio::test]
    async fn fetch_recent_returns_nothing_when_cursor_is_newest() {
        let source = Arc::new(ScriptedSource::with_recent(&["c"]));
        let fetcher = SourceFetcher::new(source, 100, policy());

        assert!(fetcher.fetch_recent("c", 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_recent_without_cursor_returns_window() {
        let source = Arc::new(ScriptedSource::with_recent(&["e", "d", "c", "b", "a"]));
        let fetcher = SourceFetcher::new(source, 100, policy());

        let recent = fetcher.fetch_recent("", 3).await.unwrap();
        assert_eq!(ids(&recent), vec!["e", "d", "c"]);
    }

    #[test]
    fn overflow_needs_a_full_window_without_the_cursor() {
        assert!(window_overflowed("zz", 50, 50, 50));
        assert!(!window_overflowed("zz", 0, 0, 50));
        assert!(!window_overflowed("zz", 3, 3, 50));
        assert!(!window_overflowed("c", 50, 10, 50));
        assert!(!window_overflowed("", 50, 50, 50));
    }

    #[tokio::test]
    async fn fetch_recent_with_cursor_outside_window_returns_window() {
        let source = Arc::new(ScriptedSource::with_recent(&["e", "d", "c", "b", "a"]));
        let fetcher = SourceFetcher::new(source, 100, policy());

        let recent = fetcher.fetch_recent("zz", 2).await.unwrap();
        assert_eq!(ids(&recent), vec!["e", "d"]);
    }
}
