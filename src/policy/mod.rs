//! Notification policy applied between detection and delivery.
//!
//! This module provides:
//! - [`PolicyEngine`]: suppression, trailing debounce, rate limiting, batching
//! - [`PolicyDecision`] / [`Verdict`]: the per-event outcome
//! - [`into_batches`]: groups emitted decisions for the notifier

mod debounce;
mod engine;
mod rate;

pub use debounce::Debouncer;
pub use engine::{
    Batch, BatchId, DEFAULT_BATCH_SIZE, DEFAULT_DEBOUNCE_WINDOW, DEFAULT_RATE_LIMIT_PER_MIN,
    PolicyDecision, PolicyEngine, PolicySettings, Verdict, into_batches,
};
pub use rate::{RATE_WINDOW, RateLimiter};
