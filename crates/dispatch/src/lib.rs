//! Entity-change dispatcher for the rule engine.
//!
//! This crate provides:
//! - The centralized [`Dispatcher`](dispatcher::Dispatcher): dedupe,
//!   per-entity debounce, batching, rate limiting, and a bounded worker
//!   pool feeding per-rule engine passes
//! - The entity→rules reverse index with TTL + version invalidation
//! - The token-bucket rate limiter
//! - The failure handler / circuit breaker over rule runtime state
//! - Dispatcher statistics and the status snapshot
//! - The periodic engine ticker driving for-delays and time windows
//! - The admin write path (rule save/delete, suspension management)

pub mod admin;
pub mod dispatcher;
pub mod failure;
pub mod index;
pub mod rate_limiter;
pub mod stats;
pub mod ticker;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherStatus, EntityChangeBatch};
pub use index::EntityRuleIndex;
pub use rate_limiter::TokenBucket;
pub use stats::DispatcherStats;
pub use ticker::EngineTicker;
pub use worker::WorkerPool;
