//! Per-backend health metrics and derived status.
//!
//! Records are value-typed and replaced atomically under the map entry
//! lock, so concurrent successes and failures always produce a
//! linearizable sequence. Status is derived on read, never stored.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::clock::{Clock, Sleeper, TokioClock, TokioSleeper};
use crate::metrics::SharedMetrics;
use crate::retry::BackoffPolicy;

/// Consecutive failures at which a backend is unhealthy.
const UNHEALTHY_CONSECUTIVE: u32 = 5;
/// Consecutive failures at which a backend is degraded.
const DEGRADED_CONSECUTIVE: u32 = 2;
/// Success rate below which a backend with enough samples is degraded.
const DEGRADED_SUCCESS_RATE: f64 = 0.5;
/// Minimum samples before the success-rate rule applies.
const DEGRADED_MIN_TOTAL: u64 = 10;
/// Recorded traffic after which `check` trusts metrics and skips the
/// probe entirely.
const PROBE_SKIP_TOTAL: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub last_fail: Option<Instant>,
    pub avg_response_ms: f64,
    pub last_error: Option<String>,
}

impl HealthRecord {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.success as f64 / self.total as f64
    }

    pub fn status(&self) -> BackendStatus {
        if self.consecutive_failures >= UNHEALTHY_CONSECUTIVE {
            return BackendStatus::Unhealthy;
        }
        if self.consecutive_failures >= DEGRADED_CONSECUTIVE
            || (self.total > DEGRADED_MIN_TOTAL && self.success_rate() < DEGRADED_SUCCESS_RATE)
        {
            return BackendStatus::Degraded;
        }
        if self.total == 0 {
            return BackendStatus::Unknown;
        }
        BackendStatus::Healthy
    }
}

pub struct HealthMonitor {
    records: DashMap<String, HealthRecord>,
    last_probe: DashMap<String, Instant>,
    probe_interval: Duration,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    metrics: SharedMetrics,
}

impl HealthMonitor {
    pub fn new(probe_interval: Duration, metrics: SharedMetrics) -> Self {
        Self {
            records: DashMap::new(),
            last_probe: DashMap::new(),
            probe_interval,
            clock: Arc::new(TokioClock),
            sleeper: Arc::new(TokioSleeper),
            metrics,
        }
    }

    pub fn with_time_sources(mut self, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        self.clock = clock;
        self.sleeper = sleeper;
        self
    }

    pub fn record_success(&self, backend: &str, rtt_ms: u64) {
        let now = self.clock.now();
        let mut entry = self.records.entry(backend.to_string()).or_default();
        let prior_successes = entry.success;
        entry.avg_response_ms = (entry.avg_response_ms * prior_successes as f64 + rtt_ms as f64)
            / (prior_successes + 1) as f64;
        entry.total += 1;
        entry.success += 1;
        entry.consecutive_failures = 0;
        entry.last_success = Some(now);
        drop(entry);
        self.metrics.record(
            "health.consecutive_failures",
            0.0,
            &[("backend", backend)],
        );
    }

    pub fn record_failure(&self, backend: &str, reason: &str) {
        let now = self.clock.now();
        let mut entry = self.records.entry(backend.to_string()).or_default();
        entry.total += 1;
        entry.fail += 1;
        entry.consecutive_failures += 1;
        entry.last_fail = Some(now);
        entry.last_error = Some(reason.to_string());
        let consecutive = entry.consecutive_failures;
        drop(entry);
        self.metrics.record(
            "health.consecutive_failures",
            consecutive as f64,
            &[("backend", backend)],
        );
        if consecutive == UNHEALTHY_CONSECUTIVE {
            tracing::warn!(backend, consecutive, "backend crossed unhealthy threshold");
        }
    }

    /// Metrics-derived status without probing.
    pub fn status(&self, backend: &str) -> BackendStatus {
        self.records
            .get(backend)
            .map(|r| r.status())
            .unwrap_or(BackendStatus::Unknown)
    }

    pub fn snapshot(&self, backend: &str) -> Option<HealthRecord> {
        self.records.get(backend).map(|r| r.clone())
    }

    /// Active check. With enough recorded traffic the metrics speak for
    /// themselves and no probe runs; otherwise at most one probe per
    /// `probe_interval` per backend, retried with jittered backoff.
    ///
    /// A failed probe counts as a backend failure. A successful probe is
    /// liveness evidence, not a request sample: it upgrades Unknown to
    /// Healthy but does not touch the running averages.
    pub async fn check<F, Fut>(&self, backend: &str, probe: F) -> BackendStatus
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let traffic = self.records.get(backend).map(|r| r.total).unwrap_or(0);
        if traffic >= PROBE_SKIP_TOTAL {
            return self.status(backend);
        }

        let now = self.clock.now();
        let due = self
            .last_probe
            .get(backend)
            .is_none_or(|t| now.saturating_duration_since(*t) >= self.probe_interval);
        if !due {
            return self.status(backend);
        }
        self.last_probe.insert(backend.to_string(), now);

        let policy = BackoffPolicy::probe();
        for attempt in 0..policy.max_attempts {
            match probe().await {
                Ok(()) => {
                    return match self.status(backend) {
                        BackendStatus::Unknown => BackendStatus::Healthy,
                        derived => derived,
                    };
                }
                Err(reason) => {
                    tracing::debug!(backend, attempt, %reason, "probe attempt failed");
                    if attempt + 1 < policy.max_attempts {
                        self.sleeper.sleep(policy.delay(attempt)).await;
                    } else {
                        self.record_failure(backend, &reason);
                    }
                }
            }
        }
        self.status(backend)
    }
}
