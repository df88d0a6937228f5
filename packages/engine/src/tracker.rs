use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::runs::ExecutionRun;
use crate::transport::RunHistorySource;
use crate::usage::billable_minutes;

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum gap between authoritative refetches for one key.
    pub refresh_interval: Duration,
    /// Cadence of the local display recompute while a run is live.
    pub tick_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// Where a key sits in its tracking lifecycle, derived purely from the
/// cached snapshot so missed notifications cannot wedge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingPhase {
    /// No cached runs yet.
    Idle,
    /// At least one cached run is still running.
    Tracking,
    /// Cached runs exist and none is running.
    Settled,
}

#[derive(Debug)]
struct KeyTasks {
    refresh: JoinHandle<()>,
    tick: JoinHandle<()>,
}

#[derive(Debug)]
struct KeyState {
    /// High-water mark; the only value ever published.
    max_minutes: i64,
    last_fetch_at: Option<DateTime<Utc>>,
    cached_runs: Vec<ExecutionRun>,
    display: watch::Sender<i64>,
    /// Bumped per key incarnation so a fetch already in flight when the key
    /// is disposed and re-tracked cannot write into the new state.
    epoch: u64,
    tasks: Option<KeyTasks>,
}

#[derive(Debug)]
struct Inner {
    source: Arc<dyn RunHistorySource>,
    config: TrackerConfig,
    keys: Mutex<HashMap<String, KeyState>>,
    epoch_counter: AtomicU64,
}

/// Per-key monotonic "minutes used" figure, reconciling a slow authoritative
/// refetch with a fast local tick. The published value never decreases.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    inner: Arc<Inner>,
}

impl UsageTracker {
    pub fn new(source: Arc<dyn RunHistorySource>, config: TrackerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                keys: Mutex::new(HashMap::new()),
                epoch_counter: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to the display value for a key. Emits only when the value
    /// actually changes; the initial value is 0.
    pub async fn observe(&self, key: &str) -> watch::Receiver<i64> {
        let mut keys = self.inner.keys.lock().await;
        self.ensure_key(&mut keys, key).display.subscribe()
    }

    /// Start the refresh and tick timers for a key. Both are started
    /// together and stopped together by [`UsageTracker::dispose`]. Idempotent
    /// while the key is already tracked.
    pub async fn track(&self, key: &str) {
        let mut keys = self.inner.keys.lock().await;
        let state = self.ensure_key(&mut keys, key);
        if state.tasks.is_some() {
            return;
        }

        let refresh = {
            let tracker = self.clone();
            let key = key.to_string();
            let interval = self.inner.config.refresh_interval;
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    timer.tick().await;
                    tracker.refresh(&key).await;
                }
            })
        };
        let tick = {
            let tracker = self.clone();
            let key = key.to_string();
            let interval = self.inner.config.tick_interval;
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    timer.tick().await;
                    tracker.tick(&key).await;
                }
            })
        };

        state.tasks = Some(KeyTasks { refresh, tick });
        tracing::debug!(key = %key, "usage tracking started");
    }

    /// Refetch the authoritative snapshot for a key unless one was fetched
    /// within the refresh interval, then recompute. A failed fetch keeps the
    /// previous snapshot and retries on the next interval.
    pub async fn refresh(&self, key: &str) -> i64 {
        let now = Utc::now();
        let (epoch, should_fetch) = {
            let mut keys = self.inner.keys.lock().await;
            let state = self.ensure_key(&mut keys, key);
            let fresh = state
                .last_fetch_at
                .map(|at| {
                    (now - at).to_std().unwrap_or(Duration::ZERO)
                        < self.inner.config.refresh_interval
                })
                .unwrap_or(false);
            (state.epoch, !fresh)
        };

        if should_fetch {
            match self.inner.source.fetch_runs(key).await {
                Ok(runs) => {
                    let mut keys = self.inner.keys.lock().await;
                    if let Some(state) = keys.get_mut(key) {
                        if state.epoch == epoch {
                            state.cached_runs = runs;
                            state.last_fetch_at = Some(Utc::now());
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "run history fetch failed; keeping cached snapshot");
                }
            }
        }

        self.recompute(key).await
    }

    /// Fold the current snapshot into the monotonic display value and
    /// publish it if it changed. Returns the published value.
    pub async fn recompute(&self, key: &str) -> i64 {
        let mut keys = self.inner.keys.lock().await;
        let Some(state) = keys.get_mut(key) else {
            return 0;
        };
        let candidate = billable_minutes(&state.cached_runs, Utc::now());
        let display = candidate.max(state.max_minutes);
        state.max_minutes = display;
        state.display.send_if_modified(|value| {
            if *value == display {
                false
            } else {
                *value = display;
                true
            }
        });
        display
    }

    /// Lightweight display-interval path: recompute only while some cached
    /// run is still running, so a settled key stops publishing churn.
    pub async fn tick(&self, key: &str) {
        let live = {
            let keys = self.inner.keys.lock().await;
            keys.get(key)
                .map(|state| state.cached_runs.iter().any(ExecutionRun::is_running))
                .unwrap_or(false)
        };
        if live {
            self.recompute(key).await;
        }
    }

    pub async fn phase(&self, key: &str) -> TrackingPhase {
        let keys = self.inner.keys.lock().await;
        match keys.get(key) {
            None => TrackingPhase::Idle,
            Some(state) if state.cached_runs.is_empty() => TrackingPhase::Idle,
            Some(state) if state.cached_runs.iter().any(ExecutionRun::is_running) => {
                TrackingPhase::Tracking
            }
            Some(_) => TrackingPhase::Settled,
        }
    }

    /// Snapshot of the cached runs for a key.
    pub async fn runs(&self, key: &str) -> Vec<ExecutionRun> {
        let keys = self.inner.keys.lock().await;
        keys.get(key)
            .map(|state| state.cached_runs.clone())
            .unwrap_or_default()
    }

    /// Stop both timers for a key and drop its state. Safe to call
    /// repeatedly; a no-op for unknown keys.
    pub async fn dispose(&self, key: &str) {
        let removed = self.inner.keys.lock().await.remove(key);
        if let Some(mut state) = removed {
            if let Some(tasks) = state.tasks.take() {
                tasks.refresh.abort();
                tasks.tick.abort();
            }
            tracing::debug!(key = %key, "usage tracking stopped");
        }
    }

    pub async fn dispose_all(&self) {
        let drained: Vec<(String, KeyState)> = {
            let mut keys = self.inner.keys.lock().await;
            keys.drain().collect()
        };
        for (key, mut state) in drained {
            if let Some(tasks) = state.tasks.take() {
                tasks.refresh.abort();
                tasks.tick.abort();
            }
            tracing::debug!(key = %key, "usage tracking stopped");
        }
    }

    pub async fn tracked_keys(&self) -> Vec<String> {
        let keys = self.inner.keys.lock().await;
        let mut tracked = keys
            .iter()
            .filter(|(_, state)| state.tasks.is_some())
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        tracked.sort();
        tracked
    }

    fn ensure_key<'a>(
        &self,
        keys: &'a mut HashMap<String, KeyState>,
        key: &str,
    ) -> &'a mut KeyState {
        keys.entry(key.to_string()).or_insert_with(|| {
            let (display, _rx) = watch::channel(0);
            KeyState {
                max_minutes: 0,
                last_fetch_at: None,
                cached_runs: Vec::new(),
                display,
                epoch: self.inner.epoch_counter.fetch_add(1, Ordering::SeqCst),
                tasks: None,
            }
        })
    }
}
