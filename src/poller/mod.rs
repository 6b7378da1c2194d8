//! Poll loop: fetch, detect, apply policy, deliver, commit.
//!
//! This module provides:
//! - [`Poller`]: Owns one cycle's worth of components and runs the loop
//! - [`PollSettings`]: Interval, jitter and backoff bounds
//! - [`Cycle`] / [`CycleReport`]: What a single cycle did

mod runner;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

pub use runner::Poller;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::detect::Event;
use crate::netmap::SourceError;
use crate::notify::{DeliveryOutcome, DeliveryResult};
use crate::policy::{PolicyDecision, Verdict};
use crate::retry::RetryPolicy;
use crate::state::StateError;

/// Default delay between successful cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default upper bound of the random delay added to every sleep.
pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(1);

/// Default first backoff after a failed cycle.
pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(500);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default deadline for `run --once`.
pub const DEFAULT_POLL_ONCE_TIMEOUT: Duration = Duration::from_secs(120);

/// How the loop learns about netmap changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    /// Ask the source to push changes; falls back to polling when the
    /// source cannot.
    #[default]
    Realtime,
    /// Poll on a fixed interval.
    Poll,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Realtime => "realtime",
            Self::Poll => "poll",
        })
    }
}

impl FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "realtime" => Ok(Self::Realtime),
            "poll" => Ok(Self::Poll),
            other => Err(format!(
                "unknown source mode '{other}', expected 'realtime' or 'poll'"
            )),
        }
    }
}

/// Timing of the poll loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    /// Delay between successful cycles.
    pub poll_interval: Duration,
    /// Upper bound of the uniform jitter added to every sleep.
    pub poll_jitter: Duration,
    /// First backoff after a failure.
    pub backoff_min: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Treat the first cycle without stored state as a silent baseline.
    pub suppress_initial_burst: bool,
    /// Requested source mode.
    pub source_mode: SourceMode,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_jitter: DEFAULT_POLL_JITTER,
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
            suppress_initial_burst: true,
            source_mode: SourceMode::default(),
        }
    }
}

impl PollSettings {
    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the jitter bound.
    #[must_use]
    pub const fn with_poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Sets the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    /// Enables or disables the silent baseline cycle.
    #[must_use]
    pub const fn with_suppress_initial_burst(mut self, suppress: bool) -> Self {
        self.suppress_initial_burst = suppress;
        self
    }

    /// Sets the source mode.
    #[must_use]
    pub const fn with_source_mode(mut self, mode: SourceMode) -> Self {
        self.source_mode = mode;
        self
    }

    /// Exponential backoff between `backoff_min` and `backoff_max`,
    /// doubling per consecutive failure, with `poll_jitter` on top.
    #[must_use]
    pub const fn backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_initial_delay(self.backoff_min)
            .with_max_delay(self.backoff_max)
            .with_jitter(self.poll_jitter)
    }
}

/// Error type for a failed cycle.
///
/// A continuous loop logs these and backs off; they never end the run.
#[derive(Debug, Error)]
pub enum PollError {
    /// Onboarding or fetching the snapshot failed.
    #[error("Failed to fetch snapshot: {0}")]
    Source(#[from] SourceError),

    /// Loading or committing state failed.
    #[error("State store error: {0}")]
    State(#[from] StateError),
}

/// Outcome of one cycle.
#[derive(Debug)]
pub enum Cycle {
    /// The cycle ran to the end and its state was committed.
    Completed(CycleReport),
    /// Shutdown interrupted the cycle; nothing was committed.
    Cancelled,
}

/// Summary of a completed cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Generation stamped on the accepted snapshot.
    pub generation: u64,
    /// Peers in the accepted snapshot.
    pub peers: usize,
    /// First cycle without stored state; events were not notified.
    pub baseline: bool,
    /// Events produced by the detector pipeline.
    pub events: Vec<Event>,
    /// Non-fatal detector errors.
    pub detector_errors: usize,
    /// Policy decisions, including events released from earlier cycles.
    pub decisions: Vec<PolicyDecision>,
    /// Per-sink delivery results; empty in dry-run mode.
    pub deliveries: Vec<DeliveryResult>,
}

impl CycleReport {
    /// Number of events the policy approved.
    #[must_use]
    pub fn emitted(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| matches!(d.verdict, Verdict::Emit(_)))
            .count()
    }

    /// Number of deliveries that reached a sink.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|r| matches!(r.outcome, DeliveryOutcome::Delivered { .. }))
            .count()
    }

    /// Number of deliveries that gave up.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|r| matches!(r.outcome, DeliveryOutcome::Failed { .. }))
            .count()
    }
}
