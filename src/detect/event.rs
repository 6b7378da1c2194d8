//! Typed change events produced by detectors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// The kind of change an [`Event`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// A peer appeared in the netmap.
    #[serde(rename = "peer.added")]
    PeerAdded,
    /// A peer disappeared from the netmap.
    #[serde(rename = "peer.removed")]
    PeerRemoved,
    /// A known peer came online.
    #[serde(rename = "peer.online")]
    PeerOnline,
    /// A known peer went offline.
    #[serde(rename = "peer.offline")]
    PeerOffline,
    /// A peer's address set changed.
    #[serde(rename = "peer.addresses_changed")]
    PeerAddressesChanged,
    /// A peer's tag set changed.
    #[serde(rename = "peer.tags_changed")]
    PeerTagsChanged,
    /// The local client version changed.
    #[serde(rename = "self.version_changed")]
    SelfVersionChanged,
    /// The local node's preferred relay changed.
    #[serde(rename = "self.relay_changed")]
    SelfRelayChanged,
    /// The local node's address set changed.
    #[serde(rename = "self.addresses_changed")]
    SelfAddressesChanged,
    /// The local backend state changed.
    #[serde(rename = "self.state_changed")]
    SelfStateChanged,
    /// Synthetic event sent by `test-notify`.
    #[serde(rename = "sentinel.test")]
    Test,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::PeerAdded,
        Self::PeerRemoved,
        Self::PeerOnline,
        Self::PeerOffline,
        Self::PeerAddressesChanged,
        Self::PeerTagsChanged,
        Self::SelfVersionChanged,
        Self::SelfRelayChanged,
        Self::SelfAddressesChanged,
        Self::SelfStateChanged,
        Self::Test,
    ];

    /// Canonical dotted name, as used in config routes and envelopes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PeerAdded => "peer.added",
            Self::PeerRemoved => "peer.removed",
            Self::PeerOnline => "peer.online",
            Self::PeerOffline => "peer.offline",
            Self::PeerAddressesChanged => "peer.addresses_changed",
            Self::PeerTagsChanged => "peer.tags_changed",
            Self::SelfVersionChanged => "self.version_changed",
            Self::SelfRelayChanged => "self.relay_changed",
            Self::SelfAddressesChanged => "self.addresses_changed",
            Self::SelfStateChanged => "self.state_changed",
            Self::Test => "sentinel.test",
        }
    }

    /// The attribute family this type belongs to.
    ///
    /// Types in the same family describe successive states of one
    /// attribute, so a later one supersedes an earlier one while debouncing.
    #[must_use]
    pub const fn family(self) -> &'static str {
        match self {
            Self::PeerAdded | Self::PeerRemoved => "presence",
            Self::PeerOnline | Self::PeerOffline => "status",
            Self::PeerAddressesChanged | Self::SelfAddressesChanged => "addresses",
            Self::PeerTagsChanged => "tags",
            Self::SelfVersionChanged => "version",
            Self::SelfRelayChanged => "relay",
            Self::SelfStateChanged => "state",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

/// How urgent an event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warn,
    /// Needs immediate attention.
    Critical,
}

impl Severity {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "critical" => Ok(Self::Critical),
            other => Err(format!(
                "unknown severity '{other}': expected info, warn, or critical"
            )),
        }
    }
}

/// A single detected change.
///
/// # Identity
///
/// `identity` is `"<type>:<subject>"`, extended with `:<discriminator>`
/// when the change carries a new attribute value (for example the new
/// address list). Suppression compares identities.
///
/// `dedup_key` is the identity plus `:g<generation>` once the event is
/// tied to the snapshot it was detected in. Detecting the same transition
/// again against the same stored snapshot yields the same key, while a
/// later transition back to an earlier value gets a new one. Neither key
/// depends on wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// What changed.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// How urgent it is.
    pub severity: Severity,
    /// Peer id, or `"self"`.
    pub subject: String,
    /// When the change was detected.
    pub occurred_at: SystemTime,
    /// Key used for idempotency.
    pub dedup_key: String,
    /// Semantic identity without the transition marker.
    #[serde(default)]
    pub identity: String,
    /// Generation of the snapshot the change was detected in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    /// Human-facing details.
    pub payload: BTreeMap<String, String>,
}

impl Event {
    /// Creates an event whose key has no discriminator.
    #[must_use]
    pub fn new(
        event_type: EventType,
        severity: Severity,
        subject: impl Into<String>,
        occurred_at: SystemTime,
    ) -> Self {
        let subject = subject.into();
        let identity = dedup_key(event_type, &subject, None);
        Self {
            dedup_key: identity.clone(),
            identity,
            generation: None,
            event_type,
            severity,
            subject,
            occurred_at,
            payload: BTreeMap::new(),
        }
    }

    /// Appends a discriminator to the dedup key.
    #[must_use]
    pub fn discriminated_by(mut self, discriminator: &str) -> Self {
        self.identity = dedup_key(self.event_type, &self.subject, Some(discriminator));
        self.rekey();
        self
    }

    /// Ties the event to the snapshot generation it was detected in.
    #[must_use]
    pub fn observed_in(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self.rekey();
        self
    }

    fn rekey(&mut self) {
        self.dedup_key = match self.generation {
            Some(generation) => format!("{}:g{generation}", self.identity),
            None => self.identity.clone(),
        };
    }

    /// Adds a payload entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Identity used to coalesce successive states of one attribute.
    #[must_use]
    pub fn coalesce_key(&self) -> String {
        format!("{}:{}", self.event_type.family(), self.subject)
    }
}

/// Builds a dedup key from semantic identity only.
#[must_use]
pub fn dedup_key(event_type: EventType, subject: &str, discriminator: Option<&str>) -> String {
    match discriminator {
        Some(d) => format!("{}:{subject}:{d}", event_type.as_str()),
        None => format!("{}:{subject}", event_type.as_str()),
    }
}
