//! Idempotency ledger: at most one delivery per `(dedup_key, sink)` within a TTL.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Default lifetime of a delivery record.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Proof that an event identity was delivered to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Event identity.
    pub dedup_key: String,
    /// Sink the event was delivered to.
    pub sink: String,
    /// First successful delivery.
    pub first_sent_at: SystemTime,
    /// After this instant the record no longer blocks delivery.
    pub expires_at: SystemTime,
}

impl IdempotencyRecord {
    /// Returns true while the record still blocks delivery.
    #[must_use]
    pub fn is_live(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }
}

/// Delivery records keyed by `(dedup_key, sink)`.
///
/// Expired records are pruned lazily whenever the ledger is consulted or
/// written, so its size is bounded by deliveries within one TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyLedger {
    ttl: Duration,
    records: BTreeMap<(String, String), IdempotencyRecord>,
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new(DEFAULT_IDEMPOTENCY_TTL)
    }
}

impl IdempotencyLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: BTreeMap::new(),
        }
    }

    /// Restores a ledger from persisted records. Later duplicates win.
    #[must_use]
    pub fn from_records(ttl: Duration, records: impl IntoIterator<Item = IdempotencyRecord>) -> Self {
        Self {
            ttl,
            records: records
                .into_iter()
                .map(|r| ((r.dedup_key.clone(), r.sink.clone()), r))
                .collect(),
        }
    }

    /// Returns the record lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of records held, including any not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns true if a live record exists for `(dedup_key, sink)`.
    pub fn contains_live(&mut self, dedup_key: &str, sink: &str, now: SystemTime) -> bool {
        self.prune(now);
        self.records
            .get(&(dedup_key.to_string(), sink.to_string()))
            .is_some_and(|r| r.is_live(now))
    }

    /// Records a successful delivery at `now`.
    ///
    /// An existing live record keeps its original `first_sent_at`.
    pub fn record(&mut self, dedup_key: &str, sink: &str, now: SystemTime) {
        self.prune(now);
        let expires_at = now + self.ttl;
        self.records
            .entry((dedup_key.to_string(), sink.to_string()))
            .and_modify(|r| r.expires_at = expires_at)
            .or_insert_with(|| IdempotencyRecord {
                dedup_key: dedup_key.to_string(),
                sink: sink.to_string(),
                first_sent_at: now,
                expires_at,
            });
    }

    /// Drops every expired record.
    pub fn prune(&mut self, now: SystemTime) {
        self.records.retain(|_, r| r.is_live(now));
    }

    /// Records in `(dedup_key, sink)` order, for persistence.
    #[must_use]
    pub fn records(&self) -> Vec<IdempotencyRecord> {
        self.records.values().cloned().collect()
    }
}
