//! Scripted snapshot source for poller and command tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Snapshot, SnapshotSource, SourceError};
use crate::shutdown::ShutdownTrigger;

/// Answers fetches from a script, then hangs.
///
/// When a trigger is attached it fires as soon as the script runs out,
/// which ends a continuous poll loop after the last scripted cycle.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Snapshot, SourceError>>>,
    fetches: AtomicUsize,
    stop: Option<ShutdownTrigger>,
}

impl ScriptedSource {
    /// Serves `script` in order.
    pub fn new(script: Vec<Result<Snapshot, SourceError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Serves the given snapshots in order.
    pub fn snapshots(snapshots: impl IntoIterator<Item = Snapshot>) -> Self {
        Self::new(snapshots.into_iter().map(Ok).collect())
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self::default()
    }

    /// Fires `trigger` once the script is exhausted.
    pub fn stop_when_done(mut self, trigger: ShutdownTrigger) -> Self {
        self.stop = Some(trigger);
        self
    }

    /// Number of snapshot requests made.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SnapshotSource for ScriptedSource {
    async fn connect(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn snapshot(&self) -> Result<Snapshot, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        if let Some(step) = next {
            return step;
        }
        if let Some(ref trigger) = self.stop {
            trigger.trigger();
        }
        std::future::pending().await
    }
}
