pub mod config;
pub mod consumer;
pub mod controller;
pub mod credentials;
pub mod cycle;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod pipeline;
pub mod source;
