//! Tests for the policy engine stages and their composition.

use std::time::{Duration, SystemTime};

use super::*;
use crate::detect::{EventType, Severity};

fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

fn event(event_type: EventType, subject: &str, secs: u64) -> Event {
    Event::new(event_type, Severity::Info, subject, at(secs))
}

fn verdicts(decisions: &[PolicyDecision]) -> Vec<&'static str> {
    decisions.iter().map(|d| d.verdict.as_str()).collect()
}

fn immediate() -> PolicySettings {
    PolicySettings::default().with_debounce_window(Duration::ZERO)
}

mod passthrough {
    use super::*;

    #[test]
    fn zero_windows_emit_everything_in_order() {
        let mut engine = PolicyEngine::new(immediate());
        let events = vec![
            event(EventType::PeerRemoved, "b", 0),
            event(EventType::PeerAdded, "c", 0),
        ];

        let decisions = engine.apply(events, at(0));

        assert_eq!(verdicts(&decisions), vec!["emit", "emit"]);
        assert_eq!(decisions[0].event.subject, "b");
        assert_eq!(decisions[1].event.subject, "c");
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn batch_size_one_splits_in_detector_order() {
        let mut engine = PolicyEngine::new(immediate().with_batch_size(1));
        let events = vec![
            event(EventType::PeerRemoved, "B", 5),
            event(EventType::PeerAdded, "C", 5),
        ];

        let batches = into_batches(&engine.apply(events, at(5)));

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].events[0].dedup_key, "peer.removed:B");
        assert_eq!(batches[1].events[0].dedup_key, "peer.added:C");
        assert!(batches[0].id < batches[1].id);
    }
}

mod debounce {
    use super::*;

    fn settings() -> PolicySettings {
        PolicySettings::default().with_debounce_window(Duration::from_secs(30))
    }

    #[test]
    fn held_until_quiet_period_elapses() {
        let mut engine = PolicyEngine::new(settings());

        assert!(engine.apply(vec![event(EventType::PeerOffline, "a", 0)], at(0)).is_empty());
        assert!(engine.apply(vec![], at(29)).is_empty());

        let decisions = engine.apply(vec![], at(30));
        assert_eq!(verdicts(&decisions), vec!["emit"]);
    }

    #[test]
    fn flapping_peer_emits_final_state_once() {
        let mut engine = PolicyEngine::new(settings());
        let mut emitted = Vec::new();
        let mut debounced = 0;

        let script = [
            (0, EventType::PeerOffline),
            (10, EventType::PeerOnline),
            (20, EventType::PeerOffline),
            (25, EventType::PeerOnline),
        ];
        for (secs, event_type) in script {
            for decision in engine.apply(vec![event(event_type, "a", secs)], at(secs)) {
                match decision.verdict {
                    Verdict::Emit(_) => emitted.push(decision.event),
                    Verdict::Debounced => debounced += 1,
                    other => panic!("unexpected verdict {other:?}"),
                }
            }
        }
        for decision in engine.apply(vec![], at(60)) {
            emitted.push(decision.event);
        }

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event_type, EventType::PeerOnline);
        assert_eq!(debounced, 3);
    }

    #[test]
    fn release_after_window_then_new_period() {
        let mut engine = PolicyEngine::new(settings());
        engine.apply(vec![event(EventType::PeerOffline, "a", 0)], at(0));

        // Quiet period elapsed before the next occurrence arrives
        let decisions = engine.apply(vec![event(EventType::PeerOnline, "a", 40)], at(40));

        assert_eq!(verdicts(&decisions), vec!["emit"]);
        assert_eq!(decisions[0].event.event_type, EventType::PeerOffline);
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn flush_releases_everything() {
        let mut engine = PolicyEngine::new(settings());
        engine.apply(
            vec![
                event(EventType::PeerOffline, "a", 0),
                event(EventType::PeerAdded, "b", 0),
            ],
            at(0),
        );

        let decisions = engine.flush(at(1));

        assert_eq!(verdicts(&decisions), vec!["emit", "emit"]);
        assert_eq!(decisions[0].event.subject, "a");
        assert_eq!(engine.pending(), 0);
    }
}

mod suppression {
    use super::*;

    #[test]
    fn repeats_within_window_are_suppressed() {
        let mut engine = PolicyEngine::new(
            immediate().with_suppression_window(Duration::from_secs(60)),
        );

        let first = engine.apply(vec![event(EventType::PeerOffline, "a", 0)], at(0));
        let repeat = engine.apply(vec![event(EventType::PeerOffline, "a", 30)], at(30));
        let other = engine.apply(vec![event(EventType::PeerOffline, "b", 30)], at(30));
        let later = engine.apply(vec![event(EventType::PeerOffline, "a", 61)], at(61));

        assert_eq!(verdicts(&first), vec!["emit"]);
        assert_eq!(verdicts(&repeat), vec!["suppressed"]);
        assert_eq!(verdicts(&other), vec!["emit"]);
        assert_eq!(verdicts(&later), vec!["emit"]);
    }

    #[test]
    fn later_transitions_share_the_identity() {
        let mut engine = PolicyEngine::new(
            immediate().with_suppression_window(Duration::from_secs(60)),
        );

        let first = engine.apply(
            vec![event(EventType::PeerOffline, "a", 0).observed_in(2)],
            at(0),
        );
        let again = engine.apply(
            vec![event(EventType::PeerOffline, "a", 20).observed_in(4)],
            at(20),
        );

        assert_eq!(verdicts(&first), vec!["emit"]);
        assert_eq!(verdicts(&again), vec!["suppressed"]);
    }

    #[test]
    fn zero_window_never_suppresses() {
        let mut engine = PolicyEngine::new(immediate());
        engine.apply(vec![event(EventType::PeerOffline, "a", 0)], at(0));

        let repeat = engine.apply(vec![event(EventType::PeerOffline, "a", 1)], at(1));
        assert_eq!(verdicts(&repeat), vec!["emit"]);
    }
}

mod rate_limit {
    use super::*;

    fn burst(n: usize, secs: u64) -> Vec<Event> {
        (0..n)
            .map(|i| event(EventType::PeerAdded, &format!("p{i}-{secs}"), secs))
            .collect()
    }

    #[test]
    fn excess_is_dropped_not_queued() {
        let mut engine = PolicyEngine::new(immediate().with_rate_limit_per_min(3));

        let decisions = engine.apply(burst(5, 0), at(0));
        assert_eq!(
            verdicts(&decisions),
            vec!["emit", "emit", "emit", "rate_limited", "rate_limited"]
        );

        assert!(engine.apply(vec![], at(59)).is_empty());
        let refill = engine.apply(burst(1, 60), at(60));
        assert_eq!(verdicts(&refill), vec!["emit"]);
    }

    #[test]
    fn at_most_n_in_any_rolling_minute() {
        let limit = 7;
        let mut engine = PolicyEngine::new(immediate().with_rate_limit_per_min(limit));
        let mut emitted_at = Vec::new();

        // A raw burst of 10 events every 10 seconds for 5 minutes
        for cycle in 0..30u64 {
            let now = cycle * 10;
            for decision in engine.apply(burst(10, now), at(now)) {
                if decision.batch().is_some() {
                    emitted_at.push(now);
                }
            }
        }

        for start in 0..300u64 {
            let count = emitted_at
                .iter()
                .filter(|t| **t >= start && **t < start + 60)
                .count();
            assert!(count <= limit as usize, "window at {start}s held {count}");
        }
    }
}

mod batching {
    use super::*;

    #[test]
    fn chunks_by_batch_size_within_cycle() {
        let mut engine = PolicyEngine::new(immediate().with_batch_size(2));
        let events = (0..5)
            .map(|i| event(EventType::PeerAdded, &format!("p{i}"), 0))
            .collect();

        let batches = into_batches(&engine.apply(events, at(0)));

        let sizes: Vec<_> = batches.iter().map(|b| b.events.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(batches.iter().all(|b| b.id.cycle == 1));
    }

    #[test]
    fn batches_never_span_cycles() {
        let mut engine = PolicyEngine::new(immediate().with_batch_size(10));

        let first = into_batches(&engine.apply(vec![event(EventType::PeerAdded, "a", 0)], at(0)));
        let second = into_batches(&engine.apply(vec![event(EventType::PeerAdded, "b", 1)], at(1)));

        assert_eq!(first[0].id, BatchId { cycle: 1, index: 0 });
        assert_eq!(second[0].id, BatchId { cycle: 2, index: 0 });
    }

    #[test]
    fn released_events_ordered_by_time_then_arrival() {
        let mut engine = PolicyEngine::new(
            PolicySettings::default().with_debounce_window(Duration::from_secs(5)),
        );
        engine.apply(vec![event(EventType::PeerOffline, "late", 3)], at(3));
        engine.apply(
            vec![
                event(EventType::PeerAdded, "z", 1),
                event(EventType::PeerAdded, "y", 1),
            ],
            at(4),
        );

        let decisions = engine.apply(vec![], at(10));
        let subjects: Vec<_> = decisions.iter().map(|d| d.event.subject.as_str()).collect();

        assert_eq!(subjects, vec!["z", "y", "late"]);
    }
}

mod restore {
    use super::*;

    fn debounced() -> PolicySettings {
        PolicySettings::default().with_debounce_window(Duration::from_secs(3))
    }

    #[test]
    fn held_events_are_exported() {
        let mut engine = PolicyEngine::new(debounced());
        engine.apply(
            vec![
                event(EventType::PeerRemoved, "b", 10),
                event(EventType::PeerAdded, "c", 10),
            ],
            at(10),
        );

        let held: Vec<_> = engine
            .pending_events()
            .into_iter()
            .map(|e| e.subject)
            .collect();
        assert_eq!(held, vec!["b", "c"]);
        assert_eq!(engine.pending(), 2);
    }

    #[test]
    fn restored_events_release_after_quiet_period() {
        let mut engine = PolicyEngine::new(debounced());
        engine.restore_pending(vec![event(EventType::PeerRemoved, "b", 10)]);

        let early = engine.apply(Vec::new(), at(11));
        let due = engine.apply(Vec::new(), at(13));

        assert!(early.is_empty());
        assert_eq!(verdicts(&due), vec!["emit"]);
        assert_eq!(due[0].event.subject, "b");
    }

    #[test]
    fn restored_events_release_at_once_without_debounce() {
        let mut engine = PolicyEngine::new(immediate());
        engine.restore_pending(vec![event(EventType::PeerRemoved, "b", 10)]);

        let decisions = engine.apply(vec![event(EventType::PeerAdded, "c", 20)], at(20));

        let subjects: Vec<_> = decisions.iter().map(|d| d.event.subject.as_str()).collect();
        assert_eq!(subjects, vec!["b", "c"]);
        assert_eq!(engine.pending(), 0);
    }
}
