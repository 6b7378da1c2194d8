//! Notification delivery: routing, idempotency and sinks.
//!
//! This module provides types and traits for:
//! - Routing events to sinks ([`Router`], [`RoutingRule`])
//! - At-most-once delivery per sink within a TTL ([`IdempotencyLedger`])
//! - Sink definitions and single delivery attempts ([`Sink`], [`SinkRegistry`])
//! - HTTP abstraction for webhook-style sinks ([`HttpClient`], [`ReqwestClient`])
//! - Batch delivery with retries ([`Notifier`])

mod client;
mod envelope;
mod error;
mod http;
mod ledger;
mod notifier;
mod routing;
mod sink;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{DEFAULT_REQUEST_TIMEOUT, ReqwestClient};
pub use envelope::{Envelope, discord_content, discord_json, envelope_json, event_line};
pub use error::{DeliveryError, HttpError, IsRetryable};
pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use ledger::{DEFAULT_IDEMPOTENCY_TTL, IdempotencyLedger, IdempotencyRecord};
pub use notifier::{DeliveryOutcome, DeliveryResult, Notifier};
pub use routing::{EventTypeFilter, Router, RoutingRule};
pub use sink::{SharedWriter, Sink, SinkKind, SinkRegistry, stdout_writer};
