//! Peer join/leave detection.

use std::time::SystemTime;

use super::{Detection, Detector, DetectorError, Event, EventType, Severity, join_set};
use crate::netmap::{PeerRecord, Snapshot};

/// Emits `peer.removed` and `peer.added` from the set difference of peer ids.
///
/// Removals come first, then additions; each group is in ascending id order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceDetector;

impl PresenceDetector {
    /// Registry name.
    pub const NAME: &'static str = "presence";
}

impl Detector for PresenceDetector {
    fn detect(&self, prev: &Snapshot, curr: &Snapshot, at: SystemTime) -> Detection {
        let mut detection = Detection::default();

        for (id, peer) in &prev.peers {
            if !curr.peers.contains_key(id) {
                push_checked(&mut detection, peer, || {
                    event_for(EventType::PeerRemoved, Severity::Warn, peer, at)
                });
            }
        }

        for (id, peer) in &curr.peers {
            if !prev.peers.contains_key(id) {
                push_checked(&mut detection, peer, || {
                    event_for(EventType::PeerAdded, Severity::Info, peer, at)
                });
            }
        }

        detection
    }
}

fn push_checked(detection: &mut Detection, peer: &PeerRecord, build: impl FnOnce() -> Event) {
    if peer.id.is_empty() {
        detection.errors.push(DetectorError::InvalidPeer {
            detector: PresenceDetector::NAME,
            peer: peer.label().to_string(),
            reason: "empty peer id".to_string(),
        });
        return;
    }
    detection.events.push(build());
}

fn event_for(event_type: EventType, severity: Severity, peer: &PeerRecord, at: SystemTime) -> Event {
    Event::new(event_type, severity, &peer.id, at)
        .with("name", &peer.name)
        .with("addresses", join_set(&peer.addresses))
}
