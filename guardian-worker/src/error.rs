use std::time;

use guardian_common::retry::Retryable;
use thiserror::Error;

/// Errors returned by the remote comment source and moderation API.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// Network failures, timeouts, 5xx and rate limiting. Worth retrying.
    #[error("transient remote error (status {status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
        retry_after: Option<time::Duration>,
    },
    /// Authorization and other client errors. Retrying will not help.
    #[error("permanent remote error (status {status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        RemoteError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Transient { status, .. } | RemoteError::Permanent { status, .. } => {
                *status
            }
        }
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    fn retry_after(&self) -> Option<time::Duration> {
        match self {
            RemoteError::Transient { retry_after, .. } => *retry_after,
            RemoteError::Permanent { .. } => None,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        let status = error.status().map(|s| s.as_u16());
        if error.is_decode() || error.is_builder() {
            RemoteError::Permanent {
                status,
                message: error.to_string(),
            }
        } else {
            RemoteError::Transient {
                status,
                message: error.to_string(),
                retry_after: None,
            }
        }
    }
}

impl From<CredentialsError> for RemoteError {
    fn from(error: CredentialsError) -> Self {
        match error {
            CredentialsError::Request(_) => RemoteError::transient(error.to_string()),
            _ => RemoteError::permanent(error.to_string()),
        }
    }
}

/// A fetch cycle aborted after retries were exhausted.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to fetch page {}: {source}", .page_token.as_deref().unwrap_or("<first>"))]
    Page {
        page_token: Option<String>,
        #[source]
        source: RemoteError,
    },
    #[error("failed to fetch recent comments: {0}")]
    Recent(#[source] RemoteError),
}

/// One chunk of a moderation batch that the remote API did not accept.
#[derive(Debug, Clone)]
pub struct FailedChunk {
    pub ids: Vec<String>,
    pub error: RemoteError,
}

/// A hide request where at least one chunk failed after retries.
#[derive(Error, Debug)]
#[error("{} of {total_chunks} moderation chunks failed", .failed.len())]
pub struct ActionError {
    pub failed: Vec<FailedChunk>,
    pub total_chunks: usize,
}

impl ActionError {
    /// Every id that is still unresolved, in chunk order.
    pub fn failed_ids(&self) -> Vec<String> {
        self.failed
            .iter()
            .flat_map(|chunk| chunk.ids.iter().cloned())
            .collect()
    }
}

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no cached token at {0}, provision one through the authorization flow first")]
    MissingToken(String),
    #[error("client secrets in {0} have neither an \"installed\" nor a \"web\" section")]
    MissingClient(String),
    #[error("cached token has no refresh token and is expired")]
    NotRefreshable,
    #[error("token refresh request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint rejected refresh with status {status}: {message}")]
    Rejected { status: u16, message: String },
}
