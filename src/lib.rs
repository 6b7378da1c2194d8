//! Sentinel: tailnet change notifier
//!
//! A library for watching a tailnet's network map, turning snapshot
//! differences into typed events, and delivering deduplicated
//! notifications to stdout, webhooks and Discord.

pub mod config;
pub mod detect;
pub mod netmap;
pub mod notify;
pub mod policy;
pub mod poller;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod time;
