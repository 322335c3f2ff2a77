use std::fmt;

use guardian_common::comment::Comment;
use tokio::sync::oneshot;

/// The two fetch cycles the controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Full historical scan, newest-first.
    Backfill,
    /// Recent window newer than the cursor, oldest-first.
    Incremental,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Backfill => "backfill",
            CycleKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the consumer reports back once it has retired a whole cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every comment was retired and the checkpoint holds `cursor`.
    Completed { cursor: String },
    /// Some action or save failed. The checkpoint did not move past the failure.
    Failed,
}

/// An item on the queue between controller and consumer.
#[derive(Debug)]
pub enum Envelope {
    Comment {
        comment: Comment,
        kind: CycleKind,
        /// Chronological position within the cycle, higher is newer.
        rank: u64,
    },
    /// Closes a cycle. `complete` is false when the fetch aborted part way.
    EndOfCycle {
        kind: CycleKind,
        complete: bool,
        reply: oneshot::Sender<CycleOutcome>,
    },
}

impl Envelope {
    pub fn comment(&self) -> Option<&Comment> {
        match self {
            Envelope::Comment { comment, .. } => Some(comment),
            Envelope::EndOfCycle { .. } => None,
        }
    }
}

/// How often an idle loop reports liveness.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
