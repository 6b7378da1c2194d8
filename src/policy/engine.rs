//! The policy engine: suppression, debounce, rate limiting and batching.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use super::debounce::Debouncer;
use super::rate::RateLimiter;
use crate::detect::Event;

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

/// Default trailing quiet period.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(3);
/// Default emissions allowed per rolling minute.
pub const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 120;
/// Default maximum batch size.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Tunables for [`PolicyEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySettings {
    /// Trailing quiet period; zero passes events straight through.
    pub debounce_window: Duration,
    /// Cool-down after an emission during which the same identity is dropped; zero disables.
    pub suppression_window: Duration,
    /// Emissions allowed per rolling minute; zero disables.
    pub rate_limit_per_min: u32,
    /// Maximum events per batch. Must be positive.
    pub batch_size: usize,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            suppression_window: Duration::ZERO,
            rate_limit_per_min: DEFAULT_RATE_LIMIT_PER_MIN,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl PolicySettings {
    /// Sets the debounce window.
    #[must_use]
    pub const fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Sets the suppression window.
    #[must_use]
    pub const fn with_suppression_window(mut self, window: Duration) -> Self {
        self.suppression_window = window;
        self
    }

    /// Sets the per-minute rate limit.
    #[must_use]
    pub const fn with_rate_limit_per_min(mut self, limit: u32) -> Self {
        self.rate_limit_per_min = limit;
        self
    }

    /// Sets the batch size.
    ///
    /// # Panics
    ///
    /// Panics if `batch_size` is zero.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        self.batch_size = batch_size;
        self
    }
}

/// Identifies a batch: the engine cycle that produced it and its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId {
    /// Engine cycle (one per [`PolicyEngine::apply`] call).
    pub cycle: u64,
    /// Zero-based batch index within the cycle.
    pub index: usize,
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cycle, self.index)
    }
}

/// Outcome of the policy for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Approved for delivery in the given batch.
    Emit(BatchId),
    /// Superseded by a later occurrence of the same attribute.
    Debounced,
    /// Same identity was emitted within the suppression window.
    Suppressed,
    /// Dropped because the rolling rate budget was exhausted.
    RateLimited,
}

impl Verdict {
    /// Short lowercase name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Emit(_) => "emit",
            Self::Debounced => "debounced",
            Self::Suppressed => "suppressed",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// An event paired with its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// The event the verdict applies to.
    pub event: Event,
    /// What the policy decided.
    pub verdict: Verdict,
}

impl PolicyDecision {
    /// Returns the batch if the event was emitted.
    #[must_use]
    pub const fn batch(&self) -> Option<BatchId> {
        match self.verdict {
            Verdict::Emit(id) => Some(id),
            _ => None,
        }
    }
}

/// A group of approved events delivered together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Batch identity.
    pub id: BatchId,
    /// Events in delivery order.
    pub events: Vec<Event>,
}

/// Groups emitted decisions into batches, preserving order.
#[must_use]
pub fn into_batches(decisions: &[PolicyDecision]) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    for decision in decisions {
        let Some(id) = decision.batch() else {
            continue;
        };
        match batches.last_mut() {
            Some(batch) if batch.id == id => batch.events.push(decision.event.clone()),
            _ => batches.push(Batch {
                id,
                events: vec![decision.event.clone()],
            }),
        }
    }
    batches
}

/// Stateful filter between detection and delivery.
///
/// State (pending debounces, last emissions, the rate log) lives in memory
/// and is owned by a single poller, so no locking is involved. Held events
/// are the exception: the poller persists them with each commit through
/// [`pending_events`](Self::pending_events).
///
/// Each call to [`apply`](Self::apply) is one cycle:
///
/// 1. Held events whose quiet period has elapsed are released.
/// 2. Each new event is checked against the suppression window, then held
///    by the debouncer (or released at once when debounce is disabled).
/// 3. Released events are ordered by `(occurred_at, arrival)` and pass the
///    rate limiter; survivors are chunked into batches.
///
/// Events still held produce no decision until a later cycle releases them.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    settings: PolicySettings,
    debouncer: Debouncer,
    limiter: RateLimiter,
    last_emitted: HashMap<String, SystemTime>,
    cycle: u64,
    emitted_in_cycle: usize,
    next_seq: u64,
}

impl PolicyEngine {
    /// Creates an engine with empty state.
    #[must_use]
    pub fn new(settings: PolicySettings) -> Self {
        Self {
            debouncer: Debouncer::new(settings.debounce_window),
            limiter: RateLimiter::new(settings.rate_limit_per_min),
            settings,
            last_emitted: HashMap::new(),
            cycle: 0,
            emitted_in_cycle: 0,
            next_seq: 0,
        }
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    /// Number of events held by the debouncer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.debouncer.len()
    }

    /// Copies of the events held by the debouncer, for persistence.
    #[must_use]
    pub fn pending_events(&self) -> Vec<Event> {
        self.debouncer.held()
    }

    /// Holds events restored from a previous run.
    ///
    /// Each one counts as last seen at its `occurred_at`, so a later
    /// [`apply`](Self::apply) releases it once its quiet period is over.
    pub fn restore_pending(&mut self, events: Vec<Event>) {
        for event in events {
            let seq = self.next_seq;
            self.next_seq += 1;
            let seen = event.occurred_at;
            if let Some(replaced) = self.debouncer.offer(event, seq, seen) {
                tracing::debug!(key = %replaced.dedup_key, "Restored event superseded");
            }
        }
    }

    /// Runs one policy cycle over `events` (in detector order) at `now`.
    pub fn apply(&mut self, events: Vec<Event>, now: SystemTime) -> Vec<PolicyDecision> {
        self.cycle += 1;
        self.emitted_in_cycle = 0;
        self.prune_suppression(now);

        let debounce = !self.settings.debounce_window.is_zero();
        let mut decisions = Vec::new();
        // With debounce disabled only restored events can be held here
        let mut released = self.debouncer.release_due(now);

        for event in events {
            let seq = self.next_seq;
            self.next_seq += 1;

            if self.is_suppressed(&event.identity, now) {
                tracing::debug!(key = %event.identity, "Event suppressed");
                decisions.push(PolicyDecision {
                    event,
                    verdict: Verdict::Suppressed,
                });
                continue;
            }

            if !debounce {
                released.push((seq, event));
                continue;
            }

            if let Some(replaced) = self.debouncer.offer(event, seq, now) {
                tracing::debug!(key = %replaced.dedup_key, "Event debounced");
                decisions.push(PolicyDecision {
                    event: replaced,
                    verdict: Verdict::Debounced,
                });
            }
        }

        self.release(released, now, &mut decisions);
        decisions
    }

    /// Releases every held event immediately, as part of the current cycle.
    ///
    /// Used when no later cycle will run, e.g. single-shot mode.
    pub fn flush(&mut self, now: SystemTime) -> Vec<PolicyDecision> {
        let released = self.debouncer.drain();
        let mut decisions = Vec::new();
        self.release(released, now, &mut decisions);
        decisions
    }

    fn release(
        &mut self,
        mut released: Vec<(u64, Event)>,
        now: SystemTime,
        decisions: &mut Vec<PolicyDecision>,
    ) {
        released.sort_by(|(a_seq, a), (b_seq, b)| {
            a.occurred_at.cmp(&b.occurred_at).then(a_seq.cmp(b_seq))
        });

        for (_, event) in released {
            if !self.limiter.try_acquire(now) {
                tracing::warn!(
                    key = %event.dedup_key,
                    limit = self.settings.rate_limit_per_min,
                    "Rate limit reached, dropping event"
                );
                decisions.push(PolicyDecision {
                    event,
                    verdict: Verdict::RateLimited,
                });
                continue;
            }

            if !self.settings.suppression_window.is_zero() {
                self.last_emitted.insert(event.identity.clone(), now);
            }

            let id = BatchId {
                cycle: self.cycle,
                index: self.emitted_in_cycle / self.settings.batch_size,
            };
            self.emitted_in_cycle += 1;
            decisions.push(PolicyDecision {
                event,
                verdict: Verdict::Emit(id),
            });
        }
    }

    fn is_suppressed(&self, key: &str, now: SystemTime) -> bool {
        let window = self.settings.suppression_window;
        if window.is_zero() {
            return false;
        }
        self.last_emitted
            .get(key)
            .is_some_and(|at| now.duration_since(*at).unwrap_or(Duration::ZERO) < window)
    }

    fn prune_suppression(&mut self, now: SystemTime) {
        let window = self.settings.suppression_window;
        self.last_emitted
            .retain(|_, at| now.duration_since(*at).unwrap_or(Duration::ZERO) < window);
    }
}
