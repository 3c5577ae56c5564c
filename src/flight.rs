//! Per-key single-flight execution, min-interval throttling, and the
//! recommendation history that keeps items from being surfaced twice.
//!
//! Concurrent callers with the same operation key share one future; the
//! entry is removed atomically when it resolves, so the next run starts
//! fresh. A minimum interval between runs of the same key is enforced
//! inside the shared future, which collapses the throttle to exactly one
//! place.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::clock::{Clock, Sleeper, TokioClock, TokioSleeper};
use crate::context::FetchContext;
use crate::types::{Recommendation, RecommendationMode};

#[derive(Debug, Clone, Copy)]
pub struct FlightConfig {
    /// Minimum spacing between executions of the same key.
    pub min_interval: Duration,
    /// How long throttle timestamps and history entries live.
    pub retention: Duration,
    /// How often expired entries are swept (opportunistic, on entry).
    pub cleanup_cadence: Duration,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            retention: Duration::from_secs(600),
            cleanup_cadence: Duration::from_secs(60),
        }
    }
}

type SharedRun<T> = Shared<BoxFuture<'static, T>>;

pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    inflight: Arc<DashMap<String, SharedRun<T>>>,
    last_fetched: Arc<DashMap<String, Instant>>,
    config: FlightConfig,
    last_cleanup: Mutex<Instant>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new(config: FlightConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        Self {
            inflight: Arc::new(DashMap::new()),
            last_fetched: Arc::new(DashMap::new()),
            config,
            last_cleanup: Mutex::new(clock.now()),
            clock,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_time_sources(mut self, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        self.last_cleanup = Mutex::new(clock.now());
        self.clock = clock;
        self.sleeper = sleeper;
        self
    }

    /// At-most-one in-flight execution per key. Callers arriving while a
    /// run is active await the same shared future and observe the same
    /// value. The throttle delay runs inside the shared future, before
    /// `action`; cancellation cuts the delay short and is then `action`'s
    /// concern.
    pub async fn run<F>(&self, key: &str, ctx: &FetchContext, action: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.maybe_cleanup();

        let shared = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let run = self.leader_future(key.to_string(), ctx.clone(), action);
                slot.insert(run.clone());
                run
            }
        };
        shared.await
    }

    fn leader_future<F>(&self, key: String, ctx: FetchContext, action: F) -> SharedRun<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let inflight = Arc::clone(&self.inflight);
        let last_fetched = Arc::clone(&self.last_fetched);
        let clock = Arc::clone(&self.clock);
        let sleeper = Arc::clone(&self.sleeper);
        let min_interval = self.config.min_interval;

        async move {
            let since_last = last_fetched
                .get(&key)
                .map(|t| clock.now().saturating_duration_since(*t));
            if let Some(elapsed) = since_last
                && elapsed < min_interval
            {
                let delay = min_interval - elapsed;
                tokio::select! {
                    _ = sleeper.sleep(delay) => {}
                    _ = ctx.cancellation().cancelled() => {}
                }
            }

            let result = action.await;
            last_fetched.insert(key.clone(), clock.now());
            inflight.remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    /// Number of keys currently executing.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Sweep expired throttle timestamps, at most once per cadence.
    fn maybe_cleanup(&self) {
        let now = self.clock.now();
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) < self.config.cleanup_cadence {
                return;
            }
            *last = now;
        }
        let retention = self.config.retention;
        self.last_fetched
            .retain(|_, stamp| now.saturating_duration_since(*stamp) < retention);
    }
}

/// Case-insensitive seen-set of normalized recommendation keys with a
/// retention window. `dedupe` and `filter` serialize on one lock so an
/// insertion completed by one fetch is visible to every later read.
pub struct RecommendationHistory {
    entries: Mutex<HashMap<String, Instant>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl RecommendationHistory {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
            clock: Arc::new(TokioClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// In-batch dedup by normalized key; first occurrence wins. Items
    /// without a usable identity (empty artist, or empty album in album
    /// mode) are dropped. Survivors are inserted into history.
    pub fn dedupe(
        &self,
        items: Vec<Recommendation>,
        mode: RecommendationMode,
    ) -> Vec<Recommendation> {
        let now = self.clock.now();
        let mut seen: HashSet<String> = HashSet::new();
        let mut survivors = Vec::with_capacity(items.len());
        let mut entries = self.entries.lock();
        for item in items {
            if !item.is_complete(mode) {
                continue;
            }
            let key = item.key(mode);
            if seen.insert(key.clone()) {
                entries.insert(key, now);
                survivors.push(item);
            }
        }
        survivors
    }

    /// Remove items whose key is already in history, unless the key is
    /// in `session_allow` (the keys this very fetch just inserted).
    pub fn filter(
        &self,
        items: Vec<Recommendation>,
        mode: RecommendationMode,
        session_allow: &HashSet<String>,
    ) -> Vec<Recommendation> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.retain(|_, stamp| now.saturating_duration_since(*stamp) < self.retention);
        items
            .into_iter()
            .filter(|item| {
                let key = item.key(mode);
                session_allow.contains(&key) || !entries.contains_key(&key)
            })
            .collect()
    }

    /// True when the key is currently suppressed.
    pub fn is_suppressed(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|stamp| now.saturating_duration_since(*stamp) < self.retention)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
