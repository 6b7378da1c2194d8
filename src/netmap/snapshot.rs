//! Core netmap types: peers, the self node, and point-in-time snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Subject name used for events about the local node.
pub const SELF_SUBJECT: &str = "self";

/// A single peer as seen in one snapshot.
///
/// Identity is the stable `id`; every other field is compared
/// attribute-by-attribute across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Stable node identifier.
    pub id: String,
    /// Host name (for display only).
    pub name: String,
    /// Tailnet addresses assigned to the peer.
    pub addresses: BTreeSet<IpAddr>,
    /// Whether the coordination server reports the peer as connected.
    pub online: bool,
    /// When the peer was last seen, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<SystemTime>,
    /// ACL tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl PeerRecord {
    /// Creates an online peer with no addresses or tags.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            addresses: BTreeSet::new(),
            online: true,
            last_seen: None,
            tags: BTreeSet::new(),
        }
    }

    /// Sets the online flag.
    #[must_use]
    pub const fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Adds an address.
    #[must_use]
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.addresses.insert(address);
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Human-readable label: the name when present, otherwise the id.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// The local node's view of itself and its connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfRecord {
    /// Stable node identifier.
    pub id: String,
    /// Host name.
    pub name: String,
    /// Tailnet addresses assigned to this node.
    #[serde(default)]
    pub addresses: BTreeSet<IpAddr>,
    /// Whether this node is connected.
    pub online: bool,
    /// Client version string.
    #[serde(default)]
    pub version: String,
    /// Preferred relay (DERP region), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
    /// Backend state, e.g. `Running` or `NeedsLogin`.
    #[serde(default)]
    pub backend_state: String,
}

/// An immutable point-in-time view of tailnet membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonic sequence number, stamped by the poller on acceptance.
    pub generation: u64,
    /// Tailnet name, when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailnet: Option<String>,
    /// When the snapshot was taken.
    pub captured_at: SystemTime,
    /// The local node.
    #[serde(rename = "self")]
    pub self_node: SelfRecord,
    /// Peers keyed by id.
    pub peers: BTreeMap<String, PeerRecord>,
}

impl Snapshot {
    /// Creates an empty snapshot with generation 0.
    #[must_use]
    pub fn empty(captured_at: SystemTime) -> Self {
        Self {
            generation: 0,
            tailnet: None,
            captured_at,
            self_node: SelfRecord::default(),
            peers: BTreeMap::new(),
        }
    }

    /// Builds a snapshot from a peer list. Later duplicates of an id win.
    #[must_use]
    pub fn from_peers(
        captured_at: SystemTime,
        self_node: SelfRecord,
        peers: impl IntoIterator<Item = PeerRecord>,
    ) -> Self {
        Self {
            generation: 0,
            tailnet: None,
            captured_at,
            self_node,
            peers: peers.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Sets the tailnet name.
    #[must_use]
    pub fn with_tailnet(mut self, tailnet: impl Into<String>) -> Self {
        self.tailnet = Some(tailnet.into());
        self
    }

    /// Looks up a peer by id.
    #[must_use]
    pub fn peer(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Number of peers currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.peers.values().filter(|p| p.online).count()
    }

    /// Two snapshots are comparable unless both name a tailnet and the names differ.
    #[must_use]
    pub fn is_comparable_with(&self, other: &Self) -> bool {
        match (&self.tailnet, &other.tailnet) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}
