//! Command execution.
//!
//! Wires the validated configuration into the poller, the state store, the
//! snapshot source and the notifier, and runs one subcommand.

use std::fmt::Write as _;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::signal;

use sentinel::config::{Command, ConfigError, ValidatedConfig};
use sentinel::detect::{Event, EventType, Severity};
use sentinel::netmap::{SELF_SUBJECT, Snapshot, SnapshotSource, SourceError, TailscaleCli};
use sentinel::notify::{
    DEFAULT_REQUEST_TIMEOUT, DeliveryError, DeliveryOutcome, DeliveryResult, HttpError,
    IdempotencyLedger, Notifier, ReqwestClient, SinkRegistry, event_line,
};
use sentinel::policy::PolicyEngine;
use sentinel::poller::{Cycle, PollError, Poller};
use sentinel::shutdown::Shutdown;
use sentinel::state::{FileStateStore, LoadResult, StateError, StateLock, StateStore};
use sentinel::time::rfc3339;

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;

/// Error type for runtime execution failures.
#[derive(Debug, Error)]
pub enum RunError {
    /// The configuration could not be turned into components.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failed to create the HTTP client.
    #[error("Failed to create HTTP client: {0}")]
    HttpClient(#[source] HttpError),

    /// A sink could not be prepared or named an unknown sink.
    #[error("Notifier error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Loading, locking or committing state failed.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Fetching the snapshot failed.
    #[error("Failed to fetch snapshot: {0}")]
    Source(#[from] SourceError),

    /// A poll cycle failed.
    #[error(transparent)]
    Poll(#[from] PollError),

    /// Some sinks rejected the test notification.
    #[error("Test notification failed for {0} sink(s)")]
    TestNotify(usize),

    /// Output could not be encoded.
    #[error("Failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RunError {
    /// Returns true if the failure stems from configuration.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Runs `command` against `config`.
///
/// `init` and `version` are handled before configuration is loaded and
/// do nothing here.
///
/// # Errors
///
/// Returns the first error that ends the command.
#[cfg(not(tarpaulin_include))]
pub async fn execute(command: Command, config: ValidatedConfig) -> Result<(), RunError> {
    match command {
        Command::Run { once, dry_run } => run(config, once, dry_run).await,
        Command::Status => {
            print!("{}", status_report(&FileStateStore::new(&config.state_path))?);
            Ok(())
        }
        Command::Diff => diff(config).await,
        Command::DumpNetmap => dump_netmap(&config).await,
        Command::TestNotify { sink } => test_notify(&config, sink.as_deref()).await,
        Command::ValidateConfig => {
            println!("Configuration is valid");
            println!("{config}");
            Ok(())
        }
        Command::Version | Command::Init { .. } => Ok(()),
    }
}

/// Runs the poll loop, or a single cycle with `once`.
#[cfg(not(tarpaulin_include))]
async fn run(config: ValidatedConfig, once: bool, dry_run: bool) -> Result<(), RunError> {
    let lock = StateLock::acquire(&config.state_path)?;
    tracing::debug!(lock = %lock.path().display(), "State lock held");

    let pipeline = config.pipeline()?;
    tracing::info!(
        state = %config.state_path.display(),
        detectors = ?pipeline.enabled_names(),
        sinks = config.sinks.len(),
        mode = %config.poll.source_mode,
        "Sentinel starting"
    );

    let shutdown = install_shutdown();
    let mut poller = Poller::new(
        source(&config),
        FileStateStore::new(&config.state_path),
        pipeline,
        PolicyEngine::new(config.policy.clone()),
        build_notifier(&config)?,
        config.poll.clone(),
    )?;

    if once {
        if dry_run {
            tracing::info!("Dry-run mode enabled, notifications will be logged but not sent");
        }
        let outcome = tokio::time::timeout(
            config.poll_once_timeout,
            poller.run_once(&shutdown, dry_run),
        )
        .await;
        once_result(outcome, config.poll_once_timeout)?;
    } else {
        poller.run(&shutdown, true, dry_run).await?;
    }

    drop(lock);
    Ok(())
}

/// Maps the outcome of `run --once`.
///
/// A cycle cut short by the deadline or by shutdown is not a failure.
/// Nothing was committed, so the next run repeats it.
fn once_result(
    outcome: Result<Result<Cycle, PollError>, tokio::time::error::Elapsed>,
    limit: Duration,
) -> Result<(), RunError> {
    match outcome {
        Ok(Ok(Cycle::Completed(_))) => Ok(()),
        Ok(Ok(Cycle::Cancelled)) => {
            tracing::info!("Shutdown requested, single cycle abandoned");
            Ok(())
        }
        Ok(Err(error)) => Err(error.into()),
        Err(_) => {
            tracing::warn!(
                timeout_secs = limit.as_secs(),
                "Single cycle did not complete in time, nothing was committed"
            );
            Ok(())
        }
    }
}

/// Prints the events the next cycle would detect. Nothing is committed
/// or delivered.
#[cfg(not(tarpaulin_include))]
async fn diff(config: ValidatedConfig) -> Result<(), RunError> {
    let shutdown = install_shutdown();
    let poller = Poller::new(
        source(&config),
        FileStateStore::new(&config.state_path),
        config.pipeline()?,
        PolicyEngine::new(config.policy.clone()),
        build_notifier(&config)?,
        config.poll.clone(),
    )?;

    if let Some((snapshot, events)) = poller.diff(&shutdown).await? {
        print!("{}", render_events(&snapshot, &events));
    }
    Ok(())
}

/// Prints the current snapshot as JSON.
#[cfg(not(tarpaulin_include))]
async fn dump_netmap(config: &ValidatedConfig) -> Result<(), RunError> {
    let shutdown = install_shutdown();
    let source = source(config);

    let snapshot = tokio::select! {
        biased;
        () = shutdown.cancelled() => return Ok(()),
        result = async {
            source.connect().await?;
            source.snapshot().await
        } => result?,
    };

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Sends a `sentinel.test` event to every sink, or to one.
#[cfg(not(tarpaulin_include))]
async fn test_notify(config: &ValidatedConfig, only: Option<&str>) -> Result<(), RunError> {
    let shutdown = install_shutdown();
    let notifier = build_notifier(config)?;

    let results = notifier
        .send_test(&test_event(SystemTime::now()), only, &shutdown)
        .await?;
    print!("{}", render_deliveries(&results));

    match results.iter().filter(|r| !r.outcome.is_success()).count() {
        0 => Ok(()),
        failed => Err(RunError::TestNotify(failed)),
    }
}

/// Builds the production snapshot source.
fn source(config: &ValidatedConfig) -> TailscaleCli {
    TailscaleCli::new(
        config.tsnet.hostname.clone(),
        &config.tsnet.state_dir,
        config.tsnet.onboarding.clone(),
    )
}

/// Builds the notifier with an empty ledger; the poller restores stored
/// records into it.
fn build_notifier(config: &ValidatedConfig) -> Result<Notifier<ReqwestClient>, RunError> {
    let client = ReqwestClient::with_timeout(DEFAULT_REQUEST_TIMEOUT).map_err(RunError::HttpClient)?;
    let registry = SinkRegistry::new(config.sinks.clone(), client)?;

    Ok(Notifier::new(registry, config.router())
        .with_retry_policy(config.retry_policy.clone())
        .with_ledger(IdempotencyLedger::new(config.idempotency_ttl)))
}

/// The event sent by `test-notify`.
fn test_event(now: SystemTime) -> Event {
    Event::new(EventType::Test, Severity::Info, SELF_SUBJECT, now)
        .with("message", "Test notification from sentinel")
}

/// Human-readable summary of stored state.
fn status_report(store: &FileStateStore) -> Result<String, RunError> {
    let mut out = String::new();
    let path = store.path().display();

    let state = match store.load()? {
        LoadResult::NotFound => {
            let _ = writeln!(out, "No state stored at {path}");
            return Ok(out);
        }
        LoadResult::Loaded(state) => state,
    };

    let _ = writeln!(out, "State file:  {path}");
    match &state.snapshot {
        Some(snapshot) => {
            let _ = writeln!(out, "Generation:  {}", snapshot.generation);
            let _ = writeln!(out, "Captured:    {}", rfc3339(snapshot.captured_at));
            let _ = writeln!(
                out,
                "Tailnet:     {}",
                snapshot.tailnet.as_deref().unwrap_or("unknown")
            );
            let _ = writeln!(
                out,
                "Self:        {} ({}, {})",
                snapshot.self_node.name,
                snapshot.self_node.backend_state,
                if snapshot.self_node.online { "online" } else { "offline" }
            );
            let _ = writeln!(
                out,
                "Peers:       {} ({} online)",
                snapshot.peers.len(),
                snapshot.online_count()
            );
        }
        None => {
            let _ = writeln!(out, "Snapshot:    none");
        }
    }

    let now = SystemTime::now();
    let live = state.ledger.iter().filter(|r| r.is_live(now)).count();
    let _ = writeln!(
        out,
        "Ledger:      {} record(s), {live} live",
        state.ledger.len()
    );
    Ok(out)
}

/// One line per event, or a note when nothing changed.
fn render_events(snapshot: &Snapshot, events: &[Event]) -> String {
    let mut out = format!(
        "Snapshot generation {} with {} peer(s)\n",
        snapshot.generation,
        snapshot.peers.len()
    );
    if events.is_empty() {
        out.push_str("No changes\n");
    }
    for event in events {
        out.push_str(&event_line(event));
        out.push('\n');
    }
    out
}

/// One line per `(event, sink)` result.
fn render_deliveries(results: &[DeliveryResult]) -> String {
    results
        .iter()
        .map(|result| {
            let outcome = match &result.outcome {
                DeliveryOutcome::Delivered { attempts } => {
                    format!("delivered after {attempts} attempt(s)")
                }
                DeliveryOutcome::Skipped => "skipped".to_string(),
                DeliveryOutcome::Failed { attempts, error } => {
                    format!("failed after {attempts} attempt(s): {error}")
                }
                DeliveryOutcome::Cancelled => "cancelled".to_string(),
            };
            format!("{:<16} {outcome}\n", result.sink)
        })
        .collect()
}

/// Returns a handle cancelled by Ctrl+C or SIGTERM.
///
/// Excluded from coverage - requires OS signal handling.
#[cfg(not(tarpaulin_include))]
fn install_shutdown() -> Shutdown {
    let (trigger, shutdown) = Shutdown::new();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, stopping...");
        trigger.trigger();
    });
    shutdown
}

/// Completes when a shutdown signal is received. A handler that cannot be
/// installed is logged and never fires.
#[cfg(not(tarpaulin_include))]
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
