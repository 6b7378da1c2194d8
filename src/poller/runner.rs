//! The poll loop itself.

use std::time::SystemTime;

use crate::detect::{DetectorPipeline, Event};
use crate::netmap::{Snapshot, SnapshotSource};
use crate::notify::{DeliveryOutcome, HttpClient, IdempotencyLedger, Notifier};
use crate::policy::{PolicyEngine, into_batches};
use crate::retry::{RetryPolicy, sample_jitter};
use crate::shutdown::Shutdown;
use crate::state::{PersistedState, StateStore};
use crate::time::{Clock, Sleeper, SystemClock, TokioSleeper};

use super::{Cycle, CycleReport, PollError, PollSettings, SourceMode};

/// Runs detect → policy → deliver → commit cycles against a source.
///
/// One cycle runs at a time. Policy state lives here across cycles, and
/// the stored snapshot only advances after a cycle finished delivering.
///
/// # Type Parameters
///
/// * `Src` - The [`SnapshotSource`] providing netmaps
/// * `St` - The [`StateStore`] holding the snapshot and ledger
/// * `H` - The HTTP client used by the notifier
/// * `S` - The [`Sleeper`] for poll, backoff and retry delays (defaults to [`TokioSleeper`])
/// * `C` - The [`Clock`] stamping cycles (defaults to [`SystemClock`])
#[derive(Debug)]
pub struct Poller<Src, St, H, S = TokioSleeper, C = SystemClock> {
    source: Src,
    store: St,
    pipeline: DetectorPipeline,
    policy: PolicyEngine,
    notifier: Notifier<H, S>,
    sleeper: S,
    clock: C,
    settings: PollSettings,
    backoff: RetryPolicy,
    previous: Option<Snapshot>,
    warned_realtime: bool,
}

impl<Src, St, H> Poller<Src, St, H, TokioSleeper, SystemClock>
where
    St: StateStore,
{
    /// Creates a poller, restoring the last snapshot, the ledger and any
    /// held events from `store`.
    ///
    /// The notifier's ledger TTL is kept; its records are replaced by
    /// the stored ones. Held events go back into the policy debouncer.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::State`] if stored state exists but cannot be
    /// loaded.
    pub fn new(
        source: Src,
        store: St,
        pipeline: DetectorPipeline,
        mut policy: PolicyEngine,
        notifier: Notifier<H>,
        settings: PollSettings,
    ) -> Result<Self, PollError> {
        let state = store.load()?.into_state();
        match &state.snapshot {
            Some(snapshot) => tracing::info!(
                generation = snapshot.generation,
                peers = snapshot.peers.len(),
                ledger = state.ledger.len(),
                pending = state.pending.len(),
                "Restored previous state"
            ),
            None => tracing::info!("No previous state found, starting fresh"),
        }

        policy.restore_pending(state.pending);
        let ttl = notifier.ledger().ttl();
        let notifier = notifier.with_ledger(IdempotencyLedger::from_records(ttl, state.ledger));

        Ok(Self {
            source,
            store,
            pipeline,
            policy,
            notifier,
            sleeper: TokioSleeper,
            clock: SystemClock,
            backoff: settings.backoff_policy(),
            settings,
            previous: state.snapshot,
            warned_realtime: false,
        })
    }
}

impl<Src, St, H, S, C> Poller<Src, St, H, S, C> {
    /// Replaces the sleeper used for poll, backoff and retry delays.
    #[must_use]
    pub fn with_sleeper<S2: Clone>(self, sleeper: S2) -> Poller<Src, St, H, S2, C> {
        Poller {
            source: self.source,
            store: self.store,
            pipeline: self.pipeline,
            policy: self.policy,
            notifier: self.notifier.with_sleeper(sleeper.clone()),
            sleeper,
            clock: self.clock,
            settings: self.settings,
            backoff: self.backoff,
            previous: self.previous,
            warned_realtime: self.warned_realtime,
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock<C2>(self, clock: C2) -> Poller<Src, St, H, S, C2> {
        Poller {
            source: self.source,
            store: self.store,
            pipeline: self.pipeline,
            policy: self.policy,
            notifier: self.notifier,
            sleeper: self.sleeper,
            clock,
            settings: self.settings,
            backoff: self.backoff,
            previous: self.previous,
            warned_realtime: self.warned_realtime,
        }
    }

    /// Returns the snapshot source.
    #[must_use]
    pub const fn source(&self) -> &Src {
        &self.source
    }

    /// Returns the state store.
    #[must_use]
    pub const fn store(&self) -> &St {
        &self.store
    }

    /// The last committed snapshot.
    #[must_use]
    pub const fn previous(&self) -> Option<&Snapshot> {
        self.previous.as_ref()
    }

    /// Returns the notifier.
    #[must_use]
    pub const fn notifier(&self) -> &Notifier<H, S> {
        &self.notifier
    }

    /// Returns the policy engine.
    #[must_use]
    pub const fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &PollSettings {
        &self.settings
    }
}

impl<Src, St, H, S, C> Poller<Src, St, H, S, C>
where
    Src: SnapshotSource,
    St: StateStore,
    H: HttpClient,
    S: Sleeper,
    C: Clock,
{
    /// Runs a single cycle without retrying.
    ///
    /// Events still held by the debouncer are released at the end of the
    /// cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if fetching or committing failed. Stored state is
    /// unchanged in that case.
    pub async fn run_once(&mut self, shutdown: &Shutdown, dry_run: bool) -> Result<Cycle, PollError> {
        self.warn_if_push_unavailable();
        let cycle = self.cycle(shutdown, dry_run, true).await?;
        if let Cycle::Completed(report) = &cycle {
            log_report(report);
        }
        Ok(cycle)
    }

    /// Runs cycles until shutdown, or until the first successful cycle
    /// when `continuous` is false.
    ///
    /// Failed cycles are retried after exponential backoff in either mode.
    ///
    /// # Errors
    ///
    /// Currently never returns an error; cycle errors are logged and
    /// retried. Cancellation resolves to `Ok`.
    pub async fn run(
        &mut self,
        shutdown: &Shutdown,
        continuous: bool,
        dry_run: bool,
    ) -> Result<(), PollError> {
        self.warn_if_push_unavailable();
        if dry_run {
            tracing::info!("Dry-run mode enabled, notifications will be logged but not sent");
        }

        let mut failures: u32 = 0;
        loop {
            let delay = match self.cycle(shutdown, dry_run, !continuous).await {
                Ok(Cycle::Cancelled) => {
                    tracing::info!("Shutdown requested, stopping poll loop");
                    return Ok(());
                }
                Ok(Cycle::Completed(report)) => {
                    failures = 0;
                    log_report(&report);
                    if !continuous {
                        return Ok(());
                    }
                    self.settings.poll_interval
                        + sample_jitter(self.settings.poll_jitter, &mut rand::thread_rng())
                }
                Err(error) => {
                    failures = failures.saturating_add(1);
                    let delay = self
                        .backoff
                        .delay_with_jitter(failures - 1, &mut rand::thread_rng());
                    tracing::warn!(
                        error = %error,
                        failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Poll cycle failed, backing off"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping poll loop");
                    return Ok(());
                }
                () = self.sleeper.sleep(delay) => {}
            }
        }
    }

    /// Fetches a snapshot and diffs it against stored state without
    /// applying policy, delivering or committing.
    ///
    /// Returns `None` if shutdown interrupted the fetch.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be fetched.
    pub async fn diff(&self, shutdown: &Shutdown) -> Result<Option<(Snapshot, Vec<Event>)>, PollError> {
        let Some(mut snapshot) = self.fetch(shutdown).await? else {
            return Ok(None);
        };
        snapshot.generation = self.next_generation();
        let (events, _) = self.detect(&snapshot, self.clock.now());
        Ok(Some((snapshot, events)))
    }

    async fn cycle(
        &mut self,
        shutdown: &Shutdown,
        dry_run: bool,
        flush: bool,
    ) -> Result<Cycle, PollError> {
        if shutdown.is_cancelled() {
            return Ok(Cycle::Cancelled);
        }
        let Some(mut snapshot) = self.fetch(shutdown).await? else {
            return Ok(Cycle::Cancelled);
        };

        let now = self.clock.now();
        snapshot.generation = self.next_generation();
        let baseline = self.previous.is_none() && self.settings.suppress_initial_burst;
        let (events, detector_errors) = self.detect(&snapshot, now);

        let mut report = CycleReport {
            generation: snapshot.generation,
            peers: snapshot.peers.len(),
            baseline,
            detector_errors,
            ..CycleReport::default()
        };

        if baseline {
            tracing::info!(
                events = events.len(),
                peers = snapshot.peers.len(),
                "Baseline cycle, recording state without notifying"
            );
        } else {
            let mut decisions = self.policy.apply(events.clone(), now);
            if flush {
                decisions.extend(self.policy.flush(now));
            }

            for batch in into_batches(&decisions) {
                if dry_run {
                    for event in &batch.events {
                        tracing::info!(
                            batch = %batch.id,
                            event_type = %event.event_type,
                            severity = %event.severity,
                            subject = %event.subject,
                            "Dry-run: would notify"
                        );
                    }
                    continue;
                }

                let results = self.notifier.deliver(&batch, now, shutdown).await;
                let cancelled = results
                    .iter()
                    .any(|r| r.outcome == DeliveryOutcome::Cancelled);
                report.deliveries.extend(results);
                if cancelled || shutdown.is_cancelled() {
                    tracing::info!("Delivery interrupted by shutdown, state not committed");
                    return Ok(Cycle::Cancelled);
                }
            }
            report.decisions = decisions;
        }
        report.events = events;

        if shutdown.is_cancelled() {
            return Ok(Cycle::Cancelled);
        }
        let state = PersistedState::new(Some(snapshot.clone()), self.notifier.ledger().records())
            .with_pending(self.policy.pending_events());
        self.store.commit(&state).await?;
        tracing::debug!(generation = snapshot.generation, "Committed state");
        self.previous = Some(snapshot);

        Ok(Cycle::Completed(report))
    }

    async fn fetch(&self, shutdown: &Shutdown) -> Result<Option<Snapshot>, PollError> {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => Ok(None),
            result = async {
                self.source.connect().await?;
                self.source.snapshot().await
            } => Ok(Some(result?)),
        }
    }

    fn next_generation(&self) -> u64 {
        self.previous.as_ref().map_or(1, |p| p.generation + 1)
    }

    /// Diffs `current` against the stored snapshot.
    ///
    /// Without stored state every peer counts as added, while the self
    /// node is compared against itself.
    fn detect(&self, current: &Snapshot, now: SystemTime) -> (Vec<Event>, usize) {
        let empty;
        let previous = if let Some(previous) = &self.previous {
            previous
        } else {
            empty = Snapshot {
                tailnet: current.tailnet.clone(),
                self_node: current.self_node.clone(),
                ..Snapshot::empty(current.captured_at)
            };
            &empty
        };

        match self.pipeline.run(previous, current, now) {
            Ok(detection) => {
                for error in &detection.errors {
                    tracing::warn!(error = %error, "Detector skipped a record");
                }
                (detection.events, detection.errors.len())
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    "Snapshots are not comparable, adopting the new snapshot as baseline"
                );
                (Vec::new(), 1)
            }
        }
    }

    fn warn_if_push_unavailable(&mut self) {
        if self.settings.source_mode != SourceMode::Realtime || self.warned_realtime {
            return;
        }
        self.warned_realtime = true;
        if self.source.supports_push() {
            tracing::debug!("Source supports push, polling remains the safety net");
        } else {
            tracing::warn!(
                interval_secs = self.settings.poll_interval.as_secs(),
                "Realtime mode requested but the source cannot push changes, degrading to polling"
            );
        }
    }
}

fn log_report(report: &CycleReport) {
    let emitted = report.emitted();
    if report.events.is_empty() && emitted == 0 {
        tracing::debug!(generation = report.generation, "No changes detected");
        return;
    }
    tracing::info!(
        generation = report.generation,
        peers = report.peers,
        events = report.events.len(),
        emitted,
        delivered = report.delivered(),
        failed = report.failed(),
        "Cycle complete"
    );
}
