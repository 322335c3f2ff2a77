use serde::{Deserialize, Serialize};

/// A single comment as read from the remote source. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub text: String,
}

impl Comment {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// One page of a paginated comment listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentPage {
    pub items: Vec<Comment>,
    /// Token for the following page, `None` once the listing is exhausted.
    pub next_page_token: Option<String>,
}

impl CommentPage {
    pub fn is_last(&self) -> bool {
        self.next_page_token
            .as_deref()
            .map_or(true, |token| token.is_empty())
    }
}
