pub mod api;
pub mod client;
pub mod config;
pub mod context;
pub mod control;
pub mod flow;
pub mod humanize;
pub mod observability;
pub mod progress;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
pub mod storage;
pub mod worker;
