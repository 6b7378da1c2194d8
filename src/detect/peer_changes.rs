//! Attribute changes on peers present in both snapshots.

use std::time::SystemTime;

use super::{Detection, Detector, DetectorError, Event, EventType, Severity, join_set};
use crate::netmap::{PeerRecord, Snapshot};

/// Emits status, address and tag changes for peers present in both snapshots.
///
/// Peers are visited in ascending id order. For each peer the order is:
/// online/offline transition, address change, tag change.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerChangesDetector;

impl PeerChangesDetector {
    /// Registry name.
    pub const NAME: &'static str = "peer_changes";
}

impl Detector for PeerChangesDetector {
    fn detect(&self, prev: &Snapshot, curr: &Snapshot, at: SystemTime) -> Detection {
        let mut detection = Detection::default();

        for (id, before) in &prev.peers {
            let Some(after) = curr.peers.get(id) else {
                continue;
            };
            if id.is_empty() || after.id.is_empty() {
                detection.errors.push(DetectorError::InvalidPeer {
                    detector: Self::NAME,
                    peer: after.label().to_string(),
                    reason: "empty peer id".to_string(),
                });
                continue;
            }
            compare_peer(&mut detection.events, before, after, at);
        }

        detection
    }
}

fn compare_peer(events: &mut Vec<Event>, before: &PeerRecord, after: &PeerRecord, at: SystemTime) {
    if before.online != after.online {
        let (event_type, severity) = if after.online {
            (EventType::PeerOnline, Severity::Info)
        } else {
            (EventType::PeerOffline, Severity::Warn)
        };
        let mut event = Event::new(event_type, severity, &after.id, at).with("name", &after.name);
        if let Some(last_seen) = after.last_seen {
            event = event.with("last_seen", crate::time::rfc3339(last_seen));
        }
        events.push(event);
    }

    if before.addresses != after.addresses {
        let current = join_set(&after.addresses);
        events.push(
            Event::new(EventType::PeerAddressesChanged, Severity::Info, &after.id, at)
                .discriminated_by(&current)
                .with("name", &after.name)
                .with("previous", join_set(&before.addresses))
                .with("current", current),
        );
    }

    if before.tags != after.tags {
        let current = join_set(&after.tags);
        events.push(
            Event::new(EventType::PeerTagsChanged, Severity::Info, &after.id, at)
                .discriminated_by(&current)
                .with("name", &after.name)
                .with("previous", join_set(&before.tags))
                .with("current", current),
        );
    }
}
