//! Cross-device mapping reconciliation and the periodic sync driver.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::duration_millis;
use crate::models::{FabricCode, MappingTable};
use crate::state::SyncState;
use crate::Result;

const RECENT_ERROR_LIMIT: usize = 5;

/// Counts reported by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub local_to_cloud: usize,
    pub cloud_to_local: usize,
}

/// What a reconciliation pass has to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Local entries the mapping store lacks or holds an older value for.
    pub push: MappingTable,
    /// Remote entries to merge into the local caches.
    pub merge: MappingTable,
    /// Pending entries the mapping store already agrees with.
    pub confirmed: MappingTable,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.push.is_empty() && self.merge.is_empty() && self.confirmed.is_empty()
    }
}

/// Diff the local persisted table against the fetched remote table.
///
/// Last writer wins: a differing entry is pushed when it was written locally
/// since the last confirmed push, otherwise the remote value is merged.
pub fn plan_sync(
    local: &MappingTable,
    remote: &MappingTable,
    pending: &BTreeSet<FabricCode>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    for (code, value) in local {
        match remote.get(code) {
            None => {
                plan.push.insert(code.clone(), value.clone());
            }
            Some(remote_value) if remote_value != value => {
                if pending.contains(code) {
                    plan.push.insert(code.clone(), value.clone());
                } else {
                    plan.merge.insert(code.clone(), remote_value.clone());
                }
            }
            Some(_) => {
                if pending.contains(code) {
                    plan.confirmed.insert(code.clone(), value.clone());
                }
            }
        }
    }
    for (code, remote_value) in remote {
        if !local.contains_key(code) {
            plan.merge.insert(code.clone(), remote_value.clone());
        }
    }
    plan
}

/// Point-in-time view of sync health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    /// Unix ms of the last successful pass.
    pub last_sync_at: Option<i64>,
    pub needs_sync: bool,
    pub interval_secs: u64,
    pub runs: u64,
    pub failures: u64,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<String>,
    /// Newest last, at most five.
    pub recent_errors: Vec<String>,
}

#[derive(Debug, Default)]
struct TrackerState {
    state: SyncState,
    last_sync_at: Option<i64>,
    runs: u64,
    failures: u64,
    last_report: Option<SyncReport>,
    recent_errors: VecDeque<String>,
}

/// Records the outcome of every reconciliation pass.
#[derive(Debug)]
pub struct SyncTracker {
    interval: Duration,
    inner: Mutex<TrackerState>,
}

impl SyncTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(TrackerState::default()),
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    pub fn begin(&self) {
        self.lock().state = SyncState::Syncing;
    }

    pub fn succeed(&self, now: i64, report: SyncReport) {
        let mut inner = self.lock();
        inner.state = SyncState::Synced;
        inner.last_sync_at = Some(now);
        inner.runs += 1;
        inner.last_report = Some(report);
    }

    pub fn fail(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.state = SyncState::Error;
        inner.runs += 1;
        inner.failures += 1;
        if inner.recent_errors.len() == RECENT_ERROR_LIMIT {
            inner.recent_errors.pop_front();
        }
        inner.recent_errors.push_back(message.into());
    }

    /// Mark the tracker offline, e.g. when no mapping store is configured.
    pub fn offline(&self) {
        self.lock().state = SyncState::Offline;
    }

    pub fn snapshot(&self, now: i64) -> SyncStatus {
        let inner = self.lock();
        let needs_sync = inner
            .last_sync_at
            .map_or(true, |last| now - last >= duration_millis(self.interval));
        SyncStatus {
            state: inner.state,
            last_sync_at: inner.last_sync_at,
            needs_sync,
            interval_secs: self.interval.as_secs(),
            runs: inner.runs,
            failures: inner.failures,
            last_report: inner.last_report,
            last_error: inner.recent_errors.back().cloned(),
            recent_errors: inner.recent_errors.iter().cloned().collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Something that can run one reconciliation pass.
pub trait Reconcile: Clone + Send + Sync + 'static {
    fn reconcile(&self) -> impl Future<Output = Result<SyncReport>> + Send;
}

/// Runs [`Reconcile::reconcile`] immediately and then on a fixed interval.
///
/// `start` and `stop` are idempotent. Stopping aborts the scheduled task so
/// nothing runs after teardown; dropping the driver stops it too.
#[derive(Debug)]
pub struct AutoSync<R> {
    target: R,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Reconcile> AutoSync<R> {
    pub const fn new(target: R, interval: Duration) -> Self {
        Self {
            target,
            interval,
            task: Mutex::new(None),
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the periodic task. Returns `false` when it is already running or
    /// no async runtime is available.
    pub fn start(&self) -> bool {
        let mut task = self.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Auto-sync already running");
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Auto-sync needs a Tokio runtime; not started");
            return false;
        };

        let target = self.target.clone();
        let period = self.interval;
        *task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match target.reconcile().await {
                    Ok(report) => debug!(
                        local_to_cloud = report.local_to_cloud,
                        cloud_to_local = report.cloud_to_local,
                        "Scheduled mapping sync finished"
                    ),
                    Err(error) => warn!(%error, "Scheduled mapping sync failed"),
                }
            }
        }));
        info!(interval_secs = period.as_secs(), "Auto-sync started");
        true
    }

    /// Stop the periodic task. Returns `false` when it was not running.
    pub fn stop(&self) -> bool {
        let Some(handle) = self.lock().take() else {
            return false;
        };
        let was_running = !handle.is_finished();
        handle.abort();
        if was_running {
            info!("Auto-sync stopped");
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R> Drop for AutoSync<R> {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = task {
            handle.abort();
        }
    }
}
