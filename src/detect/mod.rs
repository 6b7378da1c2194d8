//! Change detection: turns two snapshots into typed events.
//!
//! This module provides:
//! - The event model ([`Event`], [`EventType`], [`Severity`])
//! - The [`Detector`] capability and the built-in detectors
//! - [`DetectorPipeline`], which runs detectors in a fixed configured order

mod event;
mod peer_changes;
mod presence;
mod runtime;


use std::time::SystemTime;

use thiserror::Error;

use crate::netmap::Snapshot;

pub use event::{Event, EventType, Severity, dedup_key};
pub use peer_changes::PeerChangesDetector;
pub use presence::PresenceDetector;
pub use runtime::RuntimeDetector;

/// Names of the built-in detectors, in default order.
pub const KNOWN_DETECTORS: [&str; 3] = [
    PresenceDetector::NAME,
    PeerChangesDetector::NAME,
    RuntimeDetector::NAME,
];

/// Errors recorded while comparing snapshots.
///
/// Per-peer errors never abort detection; they travel alongside the events
/// in [`Detection::errors`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectorError {
    /// A peer record could not be compared.
    #[error("{detector}: invalid peer '{peer}': {reason}")]
    InvalidPeer {
        /// Detector that rejected the peer.
        detector: &'static str,
        /// Peer label (name or id).
        peer: String,
        /// Why the peer was rejected.
        reason: String,
    },

    /// The two snapshots belong to different tailnets.
    #[error("snapshots are not comparable: tailnet '{previous}' vs '{current}'")]
    Incomparable {
        /// Tailnet of the stored snapshot.
        previous: String,
        /// Tailnet of the new snapshot.
        current: String,
    },

    /// A configured detector name has no implementation.
    #[error("unknown detector '{0}'")]
    UnknownDetector(String),
}

/// Output of one detector, or of the whole pipeline.
#[derive(Debug, Default)]
pub struct Detection {
    /// Events in emission order.
    pub events: Vec<Event>,
    /// Non-fatal errors encountered along the way.
    pub errors: Vec<DetectorError>,
}

impl Detection {
    fn extend(&mut self, other: Self) {
        self.events.extend(other.events);
        self.errors.extend(other.errors);
    }
}

/// Compares a previous and current snapshot and reports changes.
///
/// Implementations are pure: the same inputs always produce the same
/// events, in the same order.
pub trait Detector: Send + Sync {
    /// Compares `prev` against `curr`, stamping events with `at`.
    fn detect(&self, prev: &Snapshot, curr: &Snapshot, at: SystemTime) -> Detection;
}

/// Looks up a built-in detector by name.
#[must_use]
pub fn builtin(name: &str) -> Option<Box<dyn Detector>> {
    match name {
        PresenceDetector::NAME => Some(Box::new(PresenceDetector)),
        PeerChangesDetector::NAME => Some(Box::new(PeerChangesDetector)),
        RuntimeDetector::NAME => Some(Box::new(RuntimeDetector)),
        _ => None,
    }
}

struct Stage {
    name: String,
    detector: Box<dyn Detector>,
    enabled: bool,
}

/// Ordered list of `(name, detector, enabled)` stages.
///
/// Stages run in insertion order and their events are concatenated in that
/// order, which downstream batching relies on as a tie-break.
#[derive(Default)]
pub struct DetectorPipeline {
    stages: Vec<Stage>,
}

impl std::fmt::Debug for DetectorPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| (&s.name, s.enabled)))
            .finish()
    }
}

impl DetectorPipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(
        mut self,
        name: impl Into<String>,
        detector: Box<dyn Detector>,
        enabled: bool,
    ) -> Self {
        self.stages.push(Stage {
            name: name.into(),
            detector,
            enabled,
        });
        self
    }

    /// Builds the pipeline from validated configuration.
    ///
    /// `order` lists detector names in execution order; `is_enabled`
    /// reports each one's enabled flag.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::UnknownDetector`] for a name with no
    /// built-in implementation.
    pub fn from_order<S: AsRef<str>>(
        order: &[S],
        is_enabled: impl Fn(&str) -> bool,
    ) -> Result<Self, DetectorError> {
        order.iter().try_fold(Self::new(), |pipeline, name| {
            let name = name.as_ref();
            let detector =
                builtin(name).ok_or_else(|| DetectorError::UnknownDetector(name.to_string()))?;
            Ok(pipeline.with_stage(name, detector, is_enabled(name)))
        })
    }

    /// Names of enabled stages, in execution order.
    #[must_use]
    pub fn enabled_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Runs every enabled stage against the two snapshots.
    ///
    /// Events are tied to `curr.generation` when the snapshot has been
    /// stamped (generation above zero).
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::Incomparable`] when the snapshots name
    /// different tailnets; no detector runs in that case.
    pub fn run(
        &self,
        prev: &Snapshot,
        curr: &Snapshot,
        at: SystemTime,
    ) -> Result<Detection, DetectorError> {
        if !prev.is_comparable_with(curr) {
            return Err(DetectorError::Incomparable {
                previous: prev.tailnet.clone().unwrap_or_default(),
                current: curr.tailnet.clone().unwrap_or_default(),
            });
        }

        let mut detection = Detection::default();
        for stage in self.stages.iter().filter(|s| s.enabled) {
            let output = stage.detector.detect(prev, curr, at);
            tracing::debug!(
                detector = %stage.name,
                events = output.events.len(),
                errors = output.errors.len(),
                "Detector finished"
            );
            detection.extend(output);
        }
        if curr.generation > 0 {
            detection.events = detection
                .events
                .into_iter()
                .map(|event| event.observed_in(curr.generation))
                .collect();
        }
        Ok(detection)
    }
}

/// Joins a set's items with commas; used for discriminators and payloads.
pub(crate) fn join_set<'a, T: std::fmt::Display + 'a>(
    items: impl IntoIterator<Item = &'a T>,
) -> String {
    items
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
