//! Routes approved events to sinks with idempotency and retry.

use std::collections::HashSet;
use std::time::SystemTime;

use futures::future::join_all;

use super::{DeliveryError, HttpClient, IdempotencyLedger, IsRetryable, Router, Sink, SinkRegistry};
use crate::detect::Event;
use crate::policy::Batch;
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::time::{Sleeper, TokioSleeper};

#[cfg(test)]
#[path = "notifier_tests.rs"]
mod tests;

/// What happened to one `(event, sink)` delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The sink accepted the event.
    Delivered {
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// A live idempotency record already covered this pair.
    Skipped,
    /// Every attempt failed, or the failure was not retryable.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        error: String,
    },
    /// Shutdown interrupted the delivery.
    Cancelled,
}

impl DeliveryOutcome {
    /// Delivered and skipped both count as success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::Skipped)
    }
}

/// Result for one `(event, sink)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Event identity.
    pub dedup_key: String,
    /// Target sink.
    pub sink: String,
    /// Outcome.
    pub outcome: DeliveryOutcome,
}

/// Delivers batches to sinks.
///
/// # Ordering and concurrency
///
/// Within one [`deliver`](Self::deliver) call, each sink receives its
/// events one after another in batch order. Different sinks are served
/// concurrently, and a failing sink never blocks or fails another.
///
/// # Type Parameters
///
/// - `H`: The HTTP client implementation
/// - `S`: The sleeper used between retries (defaults to [`TokioSleeper`])
#[derive(Debug)]
pub struct Notifier<H, S = TokioSleeper> {
    registry: SinkRegistry<H>,
    router: Router,
    ledger: IdempotencyLedger,
    retry_policy: RetryPolicy,
    sleeper: S,
}

impl<H> Notifier<H, TokioSleeper> {
    /// Creates a notifier with an empty ledger and the default retry policy.
    #[must_use]
    pub fn new(registry: SinkRegistry<H>, router: Router) -> Self {
        Self {
            registry,
            router,
            ledger: IdempotencyLedger::default(),
            retry_policy: RetryPolicy::default(),
            sleeper: TokioSleeper,
        }
    }
}

impl<H, S> Notifier<H, S> {
    /// Sets a custom sleeper for retry delays.
    #[must_use]
    pub fn with_sleeper<S2>(self, sleeper: S2) -> Notifier<H, S2> {
        Notifier {
            registry: self.registry,
            router: self.router,
            ledger: self.ledger,
            retry_policy: self.retry_policy,
            sleeper,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Replaces the idempotency ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: IdempotencyLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Returns the idempotency ledger.
    #[must_use]
    pub const fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Returns the sink registry.
    #[must_use]
    pub const fn registry(&self) -> &SinkRegistry<H> {
        &self.registry
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl<H: HttpClient, S: Sleeper> Notifier<H, S> {
    /// Delivers every event of `batch` to its routed sinks.
    ///
    /// Successful deliveries are recorded in the ledger at `now`. Events
    /// with no matching route are logged and dropped.
    pub async fn deliver(
        &mut self,
        batch: &Batch,
        now: SystemTime,
        shutdown: &Shutdown,
    ) -> Vec<DeliveryResult> {
        let mut results = Vec::new();
        let mut queues: Vec<(String, Vec<&Event>)> = Vec::new();
        let mut seen: HashSet<(&str, String)> = HashSet::new();

        for event in &batch.events {
            let sinks = self.router.route(event);
            if sinks.is_empty() {
                tracing::info!(
                    event_type = %event.event_type,
                    subject = %event.subject,
                    "No route matched, dropping event"
                );
                continue;
            }

            for sink in sinks {
                let fresh = seen.insert((event.dedup_key.as_str(), sink.to_string()));
                if !fresh || self.ledger.contains_live(&event.dedup_key, sink, now) {
                    tracing::debug!(key = %event.dedup_key, sink, "Already delivered, skipping");
                    results.push(DeliveryResult {
                        dedup_key: event.dedup_key.clone(),
                        sink: sink.to_string(),
                        outcome: DeliveryOutcome::Skipped,
                    });
                    continue;
                }
                match queues.iter_mut().find(|(name, _)| name == sink) {
                    Some((_, queue)) => queue.push(event),
                    None => queues.push((sink.to_string(), vec![event])),
                }
            }
        }

        let delivered = {
            let this = &*self;
            join_all(
                queues
                    .iter()
                    .map(|(sink, events)| this.drain_queue(sink, events, shutdown)),
            )
            .await
        };

        for result in delivered.into_iter().flatten() {
            if matches!(result.outcome, DeliveryOutcome::Delivered { .. }) {
                self.ledger.record(&result.dedup_key, &result.sink, now);
            }
            results.push(result);
        }
        results
    }

    /// Sends `event` straight to every sink, or only to `only`.
    ///
    /// Routing and the idempotency ledger are bypassed.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::UnknownSink`] if `only` names no sink.
    pub async fn send_test(
        &self,
        event: &Event,
        only: Option<&str>,
        shutdown: &Shutdown,
    ) -> Result<Vec<DeliveryResult>, DeliveryError> {
        let targets: Vec<&Sink> = match only {
            Some(name) => vec![
                self.registry
                    .get(name)
                    .ok_or_else(|| DeliveryError::UnknownSink(name.to_string()))?,
            ],
            None => self.registry.sinks().iter().collect(),
        };

        let outcomes = join_all(
            targets
                .iter()
                .map(|sink| self.deliver_with_retry(sink, event, shutdown)),
        )
        .await;

        Ok(targets
            .iter()
            .zip(outcomes)
            .map(|(sink, outcome)| DeliveryResult {
                dedup_key: event.dedup_key.clone(),
                sink: sink.name.clone(),
                outcome,
            })
            .collect())
    }

    async fn drain_queue(
        &self,
        sink_name: &str,
        events: &[&Event],
        shutdown: &Shutdown,
    ) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(events.len());
        let Some(sink) = self.registry.get(sink_name) else {
            let error = DeliveryError::UnknownSink(sink_name.to_string()).to_string();
            tracing::warn!(sink = sink_name, "Route names an unknown sink");
            return events
                .iter()
                .map(|event| DeliveryResult {
                    dedup_key: event.dedup_key.clone(),
                    sink: sink_name.to_string(),
                    outcome: DeliveryOutcome::Failed {
                        attempts: 0,
                        error: error.clone(),
                    },
                })
                .collect();
        };

        for event in events {
            let outcome = self.deliver_with_retry(sink, event, shutdown).await;
            let cancelled = outcome == DeliveryOutcome::Cancelled;
            results.push(DeliveryResult {
                dedup_key: event.dedup_key.clone(),
                sink: sink.name.clone(),
                outcome,
            });
            if cancelled {
                break;
            }
        }
        results
    }

    async fn deliver_with_retry(
        &self,
        sink: &Sink,
        event: &Event,
        shutdown: &Shutdown,
    ) -> DeliveryOutcome {
        let max_attempts = self.retry_policy.max_attempts;

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                biased;
                () = shutdown.cancelled() => return DeliveryOutcome::Cancelled,
                result = self.registry.send_once(sink, event) => result,
            };

            let error = match result {
                Ok(()) => {
                    tracing::info!(
                        sink = %sink.name,
                        event_type = %event.event_type,
                        subject = %event.subject,
                        attempt,
                        "Notification delivered"
                    );
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(error) => error,
            };

            if !error.is_retryable() || !self.retry_policy.should_retry(attempt) {
                tracing::warn!(
                    sink = %sink.name,
                    key = %event.dedup_key,
                    attempt,
                    error = %error,
                    "Notification dropped"
                );
                return DeliveryOutcome::Failed {
                    attempts: attempt,
                    error: error.to_string(),
                };
            }

            let delay = self
                .retry_policy
                .delay_with_jitter(attempt - 1, &mut rand::thread_rng());
            tracing::debug!(
                sink = %sink.name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Delivery failed, retrying"
            );
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return DeliveryOutcome::Cancelled,
                () = self.sleeper.sleep(delay) => {}
            }
        }

        // max_attempts is at least one, so the loop always returns
        DeliveryOutcome::Failed {
            attempts: max_attempts,
            error: "no delivery attempt was made".to_string(),
        }
    }
}
