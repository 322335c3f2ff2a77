pub mod checkpoint;
pub mod comment;
pub mod health;
pub mod matcher;
pub mod metrics;
pub mod queue;
pub mod retry;
