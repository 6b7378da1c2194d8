//! Trailing-edge debounce keyed by coalesce key.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::detect::Event;

/// Holds the latest occurrence per coalesce key until it has been quiet for
/// the whole window.
///
/// # Merge Semantics
///
/// | Scenario | Occurrences in window | Released | Replaced |
/// |----------|-----------------------|----------|----------|
/// | Single | `offline` | `offline` | none |
/// | Flap | `offline → online → offline` | last `offline` | first two |
/// | Independent keys | `offline(a) → offline(b)` | both | none |
///
/// Every new occurrence restarts the quiet period, so a continuously
/// flapping peer is held until it settles.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<String, Pending>,
}

#[derive(Debug, Clone)]
struct Pending {
    event: Event,
    seq: u64,
    last_seen: SystemTime,
}

impl Debouncer {
    /// Creates a debouncer with the given quiet period.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Returns the quiet period.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Number of events currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Holds `event` as the latest occurrence for its coalesce key.
    ///
    /// Returns the occurrence it replaced, if any.
    pub fn offer(&mut self, event: Event, seq: u64, now: SystemTime) -> Option<Event> {
        let key = event.coalesce_key();
        self.pending
            .insert(
                key,
                Pending {
                    event,
                    seq,
                    last_seen: now,
                },
            )
            .map(|replaced| replaced.event)
    }

    /// Removes and returns every held event that has been quiet for the window.
    pub fn release_due(&mut self, now: SystemTime) -> Vec<(u64, Event)> {
        let window = self.window;
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen).unwrap_or(Duration::ZERO) >= window)
            .map(|(key, _)| key.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .map(|p| (p.seq, p.event))
            .collect()
    }

    /// Copies of the held events, oldest arrival first.
    #[must_use]
    pub fn held(&self) -> Vec<Event> {
        let mut held: Vec<&Pending> = self.pending.values().collect();
        held.sort_by_key(|p| p.seq);
        held.into_iter().map(|p| p.event.clone()).collect()
    }

    /// Removes and returns every held event regardless of age.
    pub fn drain(&mut self) -> Vec<(u64, Event)> {
        self.pending
            .drain()
            .map(|(_, p)| (p.seq, p.event))
            .collect()
    }
}
