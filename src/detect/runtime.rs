//! Changes to the local node.

use std::time::SystemTime;

use super::{Detection, Detector, Event, EventType, Severity, join_set};
use crate::netmap::{SELF_SUBJECT, Snapshot};

/// Backend state considered healthy.
const RUNNING: &str = "Running";

/// Emits `self.*` events for version, relay, address and backend-state changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeDetector;

impl RuntimeDetector {
    /// Registry name.
    pub const NAME: &'static str = "runtime";
}

impl Detector for RuntimeDetector {
    fn detect(&self, prev: &Snapshot, curr: &Snapshot, at: SystemTime) -> Detection {
        let before = &prev.self_node;
        let after = &curr.self_node;
        let mut events = Vec::new();

        let changed = |event_type, severity, previous: String, current: String| {
            Event::new(event_type, severity, SELF_SUBJECT, at)
                .discriminated_by(&current)
                .with("previous", previous)
                .with("current", current)
        };

        if before.version != after.version {
            events.push(changed(
                EventType::SelfVersionChanged,
                Severity::Info,
                before.version.clone(),
                after.version.clone(),
            ));
        }

        if before.relay != after.relay {
            events.push(changed(
                EventType::SelfRelayChanged,
                Severity::Info,
                relay_label(before.relay.as_deref()),
                relay_label(after.relay.as_deref()),
            ));
        }

        if before.addresses != after.addresses {
            events.push(changed(
                EventType::SelfAddressesChanged,
                Severity::Info,
                join_set(&before.addresses),
                join_set(&after.addresses),
            ));
        }

        if before.backend_state != after.backend_state {
            let severity = if after.backend_state == RUNNING {
                Severity::Info
            } else {
                Severity::Critical
            };
            events.push(changed(
                EventType::SelfStateChanged,
                severity,
                before.backend_state.clone(),
                after.backend_state.clone(),
            ));
        }

        Detection {
            events,
            errors: Vec::new(),
        }
    }
}

fn relay_label(relay: Option<&str>) -> String {
    relay.unwrap_or("none").to_string()
}
