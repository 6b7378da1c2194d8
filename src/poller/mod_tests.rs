//! Tests for the poll loop.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::detect::{DetectorPipeline, KNOWN_DETECTORS};
use crate::netmap::mock::ScriptedSource;
use crate::netmap::{PeerRecord, SelfRecord, Snapshot, SourceError};
use crate::notify::mock::MockClient;
use crate::notify::{
    DeliveryOutcome, IdempotencyLedger, Notifier, Router, RoutingRule, Sink, SinkKind,
    SinkRegistry,
};
use crate::policy::{PolicyEngine, PolicySettings};
use crate::shutdown::Shutdown;
use crate::state::PersistedState;
use crate::state::mock::MockStateStore;
use crate::time::{InstantSleeper, ManualClock};

use super::*;

const NOW: u64 = 1_700_000_000;
const TAILNET: &str = "example.ts.net";

type TestPoller =
    Poller<ScriptedSource, MockStateStore, Arc<MockClient>, InstantSleeper, ManualClock>;

fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

fn self_node() -> SelfRecord {
    SelfRecord {
        id: "self-1".to_string(),
        name: "sentinel".to_string(),
        online: true,
        version: "1.70.0".to_string(),
        backend_state: "Running".to_string(),
        ..SelfRecord::default()
    }
}

fn snapshot(ids: &[&str]) -> Snapshot {
    Snapshot::from_peers(
        at(NOW),
        self_node(),
        ids.iter().map(|id| PeerRecord::new(*id, format!("host-{id}"))),
    )
    .with_tailnet(TAILNET)
}

fn stored(ids: &[&str], generation: u64) -> PersistedState {
    let mut previous = snapshot(ids);
    previous.generation = generation;
    PersistedState::new(Some(previous), Vec::new())
}

fn quiet_policy() -> PolicySettings {
    PolicySettings::default().with_debounce_window(Duration::ZERO)
}

fn notifier(client: &Arc<MockClient>) -> Notifier<Arc<MockClient>> {
    let endpoint = url::Url::parse("https://hooks.example.com/sentinel").unwrap();
    let sink = Sink::new("hook", SinkKind::Webhook).with_endpoint(endpoint);
    let registry = SinkRegistry::new(vec![sink], Arc::clone(client)).unwrap();
    Notifier::new(registry, Router::new(vec![RoutingRule::catch_all(["hook"])]))
        .with_ledger(IdempotencyLedger::new(Duration::from_secs(3600)))
}

fn poller(
    source: ScriptedSource,
    store: MockStateStore,
    client: &Arc<MockClient>,
    policy: PolicySettings,
    settings: PollSettings,
) -> TestPoller {
    let pipeline = DetectorPipeline::from_order(&KNOWN_DETECTORS, |_| true).unwrap();
    Poller::new(
        source,
        store,
        pipeline,
        PolicyEngine::new(policy),
        notifier(client),
        settings,
    )
    .unwrap()
    .with_sleeper(InstantSleeper)
    .with_clock(ManualClock::at_secs(NOW))
}

fn completed(cycle: Cycle) -> CycleReport {
    match cycle {
        Cycle::Completed(report) => report,
        Cycle::Cancelled => panic!("Expected a completed cycle"),
    }
}

mod source_mode {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!("realtime".parse::<SourceMode>().unwrap(), SourceMode::Realtime);
        assert_eq!("POLL".parse::<SourceMode>().unwrap(), SourceMode::Poll);
        assert!("push".parse::<SourceMode>().is_err());
    }

    #[test]
    fn default_settings_match_documented_values() {
        let settings = PollSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.poll_jitter, Duration::from_secs(1));
        assert_eq!(settings.backoff_min, Duration::from_millis(500));
        assert_eq!(settings.backoff_max, Duration::from_secs(30));
        assert!(settings.suppress_initial_burst);
        assert_eq!(settings.source_mode, SourceMode::Realtime);
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let policy = PollSettings::default()
            .with_poll_jitter(Duration::ZERO)
            .backoff_policy();

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(20), Duration::from_secs(30));
    }
}

mod first_run {
    use super::*;

    #[tokio::test]
    async fn baseline_cycle_records_state_without_notifying() {
        let client = Arc::new(MockClient::success());
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["a", "b"])]),
            MockStateStore::not_found(),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let report = completed(poller.run_once(&Shutdown::never(), false).await.unwrap());

        assert!(report.baseline);
        assert_eq!(report.events.len(), 2);
        assert!(report.decisions.is_empty());
        assert_eq!(client.calls(), 0);
        let committed = poller.store().last_commit().unwrap();
        assert_eq!(committed.snapshot.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn without_baseline_every_peer_is_reported_added() {
        let client = Arc::new(MockClient::success());
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["a", "b"])]),
            MockStateStore::not_found(),
            &client,
            quiet_policy(),
            PollSettings::default().with_suppress_initial_burst(false),
        );

        let report = completed(poller.run_once(&Shutdown::never(), false).await.unwrap());

        assert!(!report.baseline);
        let keys: Vec<_> = report.events.iter().map(|e| e.dedup_key.as_str()).collect();
        assert_eq!(keys, vec!["peer.added:a:g1", "peer.added:b:g1"]);
        assert_eq!(client.calls(), 2);
    }
}

mod cycle {
    use super::*;

    #[tokio::test]
    async fn changes_are_delivered_then_committed() {
        let client = Arc::new(MockClient::success());
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["b", "c"])]),
            MockStateStore::with_loaded(stored(&["a", "b"], 4)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let report = completed(poller.run_once(&Shutdown::never(), false).await.unwrap());

        assert_eq!(report.generation, 5);
        assert_eq!(report.emitted(), 2);
        assert_eq!(report.delivered(), 2);
        assert_eq!(client.calls(), 2);

        let committed = poller.store().last_commit().unwrap();
        assert_eq!(committed.snapshot.as_ref().unwrap().generation, 5);
        let keys: Vec<_> = committed.ledger.iter().map(|r| r.dedup_key.as_str()).collect();
        assert_eq!(keys, vec!["peer.added:c:g5", "peer.removed:a:g5"]);
        assert_eq!(poller.previous().unwrap().generation, 5);
    }

    #[tokio::test]
    async fn dry_run_commits_without_delivery() {
        let client = Arc::new(MockClient::success());
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["b", "c"])]),
            MockStateStore::with_loaded(stored(&["a", "b"], 1)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let report = completed(poller.run_once(&Shutdown::never(), true).await.unwrap());

        assert_eq!(report.emitted(), 2);
        assert!(report.deliveries.is_empty());
        assert_eq!(client.calls(), 0);
        let committed = poller.store().last_commit().unwrap();
        assert_eq!(committed.snapshot.unwrap().generation, 2);
        assert!(committed.ledger.is_empty());
    }

    #[tokio::test]
    async fn single_cycle_releases_debounced_events() {
        let client = Arc::new(MockClient::success());
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["a", "b"])]),
            MockStateStore::with_loaded(stored(&["a"], 1)),
            &client,
            PolicySettings::default(),
            PollSettings::default(),
        );

        let report = completed(poller.run_once(&Shutdown::never(), false).await.unwrap());

        assert_eq!(report.emitted(), 1);
        assert_eq!(client.calls(), 1);
        assert_eq!(poller.policy().pending(), 0);
    }

    #[tokio::test]
    async fn restored_ledger_skips_already_sent_events() {
        let client = Arc::new(MockClient::success());
        let mut ledger = IdempotencyLedger::new(Duration::from_secs(3600));
        ledger.record("peer.added:c:g4", "hook", at(NOW - 60));
        let mut state = stored(&["a"], 3);
        state.ledger = ledger.records();

        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["a", "c"])]),
            MockStateStore::with_loaded(state),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let report = completed(poller.run_once(&Shutdown::never(), false).await.unwrap());

        assert_eq!(report.deliveries.len(), 1);
        assert_eq!(report.deliveries[0].outcome, DeliveryOutcome::Skipped);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn different_tailnet_becomes_new_baseline() {
        let client = Arc::new(MockClient::success());
        let other = snapshot(&["x"]).with_tailnet("other.ts.net");
        let mut poller = poller(
            ScriptedSource::snapshots([other]),
            MockStateStore::with_loaded(stored(&["a"], 2)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let report = completed(poller.run_once(&Shutdown::never(), false).await.unwrap());

        assert!(report.events.is_empty());
        assert_eq!(report.detector_errors, 1);
        assert_eq!(client.calls(), 0);
        let committed = poller.store().last_commit().unwrap().snapshot.unwrap();
        assert_eq!(committed.tailnet.as_deref(), Some("other.ts.net"));
    }

    #[tokio::test]
    async fn fetch_failure_leaves_state_untouched() {
        let client = Arc::new(MockClient::success());
        let mut poller = poller(
            ScriptedSource::new(vec![Err(SourceError::Unreachable("daemon down".into()))]),
            MockStateStore::with_loaded(stored(&["a"], 2)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let result = poller.run_once(&Shutdown::never(), false).await;

        assert!(matches!(result, Err(PollError::Source(_))));
        assert!(poller.store().commits().is_empty());
        assert_eq!(poller.previous().unwrap().generation, 2);
    }

    #[tokio::test]
    async fn commit_failure_is_reported() {
        let client = Arc::new(MockClient::success());
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["a"])]),
            MockStateStore::with_loaded(stored(&["a"], 2)).failing_commits(),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let result = poller.run_once(&Shutdown::never(), false).await;

        assert!(matches!(result, Err(PollError::State(_))));
        assert_eq!(poller.previous().unwrap().generation, 2);
    }

    #[tokio::test]
    async fn each_transition_is_delivered() {
        let client = Arc::new(MockClient::success());
        let offline = || {
            Snapshot::from_peers(
                at(NOW),
                self_node(),
                [PeerRecord::new("a", "host-a").with_online(false)],
            )
            .with_tailnet(TAILNET)
        };
        let clock = ManualClock::at_secs(NOW);
        let mut poller = poller(
            ScriptedSource::snapshots([offline(), snapshot(&["a"]), offline()]),
            MockStateStore::with_loaded(stored(&["a"], 1)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        )
        .with_clock(clock.clone());

        let mut keys = Vec::new();
        for _ in 0..3 {
            let report = completed(poller.run_once(&Shutdown::never(), false).await.unwrap());
            keys.extend(report.deliveries.into_iter().map(|d| d.dedup_key));
            clock.advance(Duration::from_secs(600));
        }

        assert_eq!(client.calls(), 3);
        assert_eq!(
            keys,
            vec!["peer.offline:a:g2", "peer.online:a:g3", "peer.offline:a:g4"]
        );
    }

    #[tokio::test]
    async fn retried_cycle_keeps_its_keys() {
        let client = Arc::new(MockClient::success());
        let store = MockStateStore::with_loaded(stored(&["a"], 2)).failing_commits();
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["a", "b"]), snapshot(&["a", "b"])]),
            store,
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        assert!(poller.run_once(&Shutdown::never(), false).await.is_err());
        assert!(poller.run_once(&Shutdown::never(), false).await.is_err());

        // The second attempt finds the live ledger record of the first
        assert_eq!(client.calls(), 1);
        assert!(poller.notifier().ledger().records()[0].dedup_key.ends_with(":g3"));
    }
}

mod run_loop {
    use super::*;

    #[tokio::test]
    async fn non_continuous_retries_until_first_success() {
        let client = Arc::new(MockClient::success());
        let mut poller = poller(
            ScriptedSource::new(vec![
                Err(SourceError::Unreachable("daemon down".into())),
                Err(SourceError::InvalidResponse("truncated".into())),
                Ok(snapshot(&["a"])),
            ]),
            MockStateStore::with_loaded(stored(&["a"], 1)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        poller.run(&Shutdown::never(), false, false).await.unwrap();

        assert_eq!(poller.source().fetches(), 3);
        assert_eq!(poller.store().commits().len(), 1);
    }

    #[tokio::test]
    async fn continuous_run_survives_errors_until_shutdown() {
        let client = Arc::new(MockClient::success());
        let (trigger, shutdown) = Shutdown::new();
        let source = ScriptedSource::new(vec![
            Ok(snapshot(&["a"])),
            Err(SourceError::Unreachable("daemon down".into())),
            Ok(snapshot(&["a", "b"])),
        ])
        .stop_when_done(trigger);
        let mut poller = poller(
            source,
            MockStateStore::with_loaded(stored(&["a"], 1)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        poller.run(&shutdown, true, false).await.unwrap();

        let generations: Vec<_> = poller
            .store()
            .commits()
            .iter()
            .map(|s| s.snapshot.as_ref().unwrap().generation)
            .collect();
        assert_eq!(generations, vec![2, 3]);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_interval_after_success_and_backoff_after_failure() {
        let client = Arc::new(MockClient::success());
        let (trigger, shutdown) = Shutdown::new();
        let source = ScriptedSource::new(vec![
            Ok(snapshot(&["a"])),
            Err(SourceError::Unreachable("daemon down".into())),
            Ok(snapshot(&["a"])),
        ])
        .stop_when_done(trigger);
        let settings = PollSettings::default().with_poll_jitter(Duration::ZERO);
        let pipeline = DetectorPipeline::from_order(&KNOWN_DETECTORS, |_| true).unwrap();
        let mut poller = Poller::new(
            source,
            MockStateStore::with_loaded(stored(&["a"], 1)),
            pipeline,
            PolicyEngine::new(quiet_policy()),
            notifier(&client),
            settings,
        )
        .unwrap();

        let started = tokio::time::Instant::now();
        poller.run(&shutdown, true, false).await.unwrap();

        // 10s interval after the first success, 500ms after the failure,
        // 10s after the second success
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(20_500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(21), "elapsed {elapsed:?}");
        assert_eq!(poller.store().commits().len(), 2);
    }

    #[tokio::test]
    async fn held_events_survive_a_restart() {
        let client = Arc::new(MockClient::success());
        let (trigger, shutdown) = Shutdown::new();
        let mut first = poller(
            ScriptedSource::snapshots([snapshot(&["a"])]).stop_when_done(trigger),
            MockStateStore::with_loaded(stored(&["a", "b"], 1)),
            &client,
            PolicySettings::default(),
            PollSettings::default(),
        );

        first.run(&shutdown, true, false).await.unwrap();

        assert_eq!(client.calls(), 0);
        let committed = first.store().last_commit().unwrap();
        assert!(!committed.snapshot.as_ref().unwrap().peers.contains_key("b"));
        let held: Vec<_> = committed.pending.iter().map(|e| e.dedup_key.as_str()).collect();
        assert_eq!(held, vec!["peer.removed:b:g2"]);

        let clock = ManualClock::at_secs(NOW);
        clock.advance(Duration::from_secs(30));
        let mut second = poller(
            ScriptedSource::snapshots([snapshot(&["a"])]),
            MockStateStore::with_loaded(committed),
            &client,
            PolicySettings::default(),
            PollSettings::default(),
        )
        .with_clock(clock);
        assert_eq!(second.policy().pending(), 1);

        let report = completed(second.run_once(&Shutdown::never(), false).await.unwrap());

        assert_eq!(client.calls(), 1);
        assert_eq!(report.deliveries[0].dedup_key, "peer.removed:b:g2");
        assert!(second.store().last_commit().unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_run_commits_nothing() {
        let client = Arc::new(MockClient::success());
        let (trigger, shutdown) = Shutdown::new();
        trigger.trigger();
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["a", "b"])]),
            MockStateStore::with_loaded(stored(&["a"], 1)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        poller.run(&shutdown, true, false).await.unwrap();

        assert_eq!(poller.source().fetches(), 0);
        assert!(poller.store().commits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_hanging_fetch() {
        let client = Arc::new(MockClient::success());
        let (trigger, shutdown) = Shutdown::new();
        let mut poller = poller(
            ScriptedSource::hanging(),
            MockStateStore::with_loaded(stored(&["a"], 1)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let stop = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.trigger();
        };
        let (result, ()) = tokio::join!(poller.run(&shutdown, true, false), stop);

        assert!(result.is_ok());
        assert!(poller.store().commits().is_empty());
    }

    #[tokio::test]
    async fn run_once_reports_cancellation() {
        let client = Arc::new(MockClient::success());
        let (trigger, shutdown) = Shutdown::new();
        trigger.trigger();
        let mut poller = poller(
            ScriptedSource::snapshots([snapshot(&["a"])]),
            MockStateStore::not_found(),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let cycle = poller.run_once(&shutdown, false).await.unwrap();

        assert!(matches!(cycle, Cycle::Cancelled));
        assert!(poller.store().commits().is_empty());
    }
}

mod diff {
    use super::*;

    #[tokio::test]
    async fn diff_reports_events_without_side_effects() {
        let client = Arc::new(MockClient::success());
        let poller = poller(
            ScriptedSource::snapshots([snapshot(&["b"])]),
            MockStateStore::with_loaded(stored(&["a"], 6)),
            &client,
            quiet_policy(),
            PollSettings::default(),
        );

        let (snapshot, events) = poller.diff(&Shutdown::never()).await.unwrap().unwrap();

        assert_eq!(snapshot.generation, 7);
        let keys: Vec<_> = events.iter().map(|e| e.dedup_key.as_str()).collect();
        assert_eq!(keys, vec!["peer.removed:a:g7", "peer.added:b:g7"]);
        assert!(poller.store().commits().is_empty());
        assert_eq!(client.calls(), 0);
    }
}
