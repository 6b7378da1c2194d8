//! Netmap layer: snapshot types and the sources that produce them.
//!
//! This module provides:
//! - The snapshot data model ([`Snapshot`], [`PeerRecord`], [`SelfRecord`])
//! - The source abstraction used by the poller ([`SnapshotSource`])
//! - The onboarding state machine ([`onboard`], [`LoginMode`])
//! - A production source driving the `tailscale` CLI ([`TailscaleCli`])

mod snapshot;
mod source;
mod tailscale;

#[cfg(test)]
pub(crate) mod mock;

pub use snapshot::{PeerRecord, SELF_SUBJECT, SelfRecord, Snapshot};
pub use source::{
    Authenticator, LoginMode, OnboardingOptions, SnapshotSource, SourceError, onboard,
};
pub use tailscale::TailscaleCli;
