//! Per-resource token-bucket rate limiter with bounded queue admission.
//!
//! Each resource gets its own bucket: capacity `max_requests`, refilled
//! continuously at `capacity / period`. A caller consumes exactly one
//! token per execution regardless of how long the action runs. Callers
//! that cannot consume immediately occupy one of `max_queue_size` wait
//! slots; when the queue is full the call fails fast so backpressure
//! propagates instead of queueing unboundedly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::clock::{Clock, Sleeper, TokioClock, TokioSleeper};
use crate::config::RateSettings;
use crate::context::FetchContext;
use crate::error::DiggerError;
use crate::metrics::SharedMetrics;

/// Snapshot of one resource's admission state.
#[derive(Debug, Clone, PartialEq)]
pub struct RateStats {
    /// Successful executions within the current rolling period.
    pub in_period: usize,
    /// Callers currently holding a wait slot.
    pub queued: usize,
    /// Calls rejected because the queue was full or the wait timed out.
    pub rejected: u64,
    pub avg_wait_ms: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    /// Grant times within the last period, for `in_period` stats.
    grants: VecDeque<Instant>,
}

struct Resource {
    settings: RateSettings,
    bucket: Mutex<Bucket>,
    /// Wait slots. Holding a permit means "queued for a token".
    queue: Semaphore,
    /// FIFO turn lock: the head waiter owns the next available token.
    turn: tokio::sync::Mutex<()>,
    rejected: AtomicU64,
    wait_total_ms: AtomicU64,
    wait_count: AtomicU64,
}

impl Resource {
    fn new(settings: RateSettings, now: Instant) -> Self {
        Self {
            queue: Semaphore::new(settings.max_queue_size),
            turn: tokio::sync::Mutex::new(()),
            bucket: Mutex::new(Bucket {
                tokens: settings.max_requests as f64,
                last_refill: now,
                grants: VecDeque::new(),
            }),
            settings,
            rejected: AtomicU64::new(0),
            wait_total_ms: AtomicU64::new(0),
            wait_count: AtomicU64::new(0),
        }
    }

    fn refill_rate_per_sec(&self) -> f64 {
        self.settings.max_requests as f64 / self.settings.period().as_secs_f64().max(f64::EPSILON)
    }

    /// Refill and try to take one token. Returns the wait hint until the
    /// next token when the bucket is dry. Monotonic clock: elapsed time
    /// can never be negative, so wall-clock jumps cannot mint tokens.
    fn try_consume(&self, now: Instant) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let capacity = self.settings.max_requests as f64;
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate_per_sec())
            .min(capacity);
        bucket.last_refill = now;

        let period = self.settings.period();
        while bucket
            .grants
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= period)
        {
            bucket.grants.pop_front();
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.grants.push_back(now);
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_rate_per_sec()))
        }
    }
}

pub struct RateLimiter {
    resources: DashMap<String, Arc<Resource>>,
    defaults: RateSettings,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    metrics: SharedMetrics,
}

impl RateLimiter {
    pub fn new(defaults: RateSettings, metrics: SharedMetrics) -> Self {
        Self {
            resources: DashMap::new(),
            defaults,
            clock: Arc::new(TokioClock),
            sleeper: Arc::new(TokioSleeper),
            metrics,
        }
    }

    /// Swap the time sources (tests drive a manual clock through this).
    pub fn with_time_sources(mut self, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        self.clock = clock;
        self.sleeper = sleeper;
        self
    }

    /// Install or replace per-resource settings. Resets the bucket.
    pub fn configure(&self, resource: &str, settings: RateSettings) {
        self.resources.insert(
            resource.to_string(),
            Arc::new(Resource::new(settings, self.clock.now())),
        );
    }

    fn resource(&self, name: &str) -> Arc<Resource> {
        self.resources
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Resource::new(self.defaults.clone(), self.clock.now())))
            .clone()
    }

    /// Gate `action` behind the resource's bucket. One token per call;
    /// transient failures inside `action` are the caller's concern.
    pub async fn execute<T, F, Fut>(
        &self,
        resource: &str,
        ctx: &FetchContext,
        action: F,
    ) -> Result<T, DiggerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let res = self.resource(resource);
        let started = self.clock.now();

        // Fast path: token available right now, no queueing.
        if res.try_consume(started).is_err() {
            self.wait_for_token(resource, &res, ctx, started).await?;
        }

        let waited = self.clock.now().saturating_duration_since(started);
        res.wait_total_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
        res.wait_count.fetch_add(1, Ordering::Relaxed);

        Ok(action().await)
    }

    /// Queue for a token. The semaphore bounds how many callers may wait;
    /// the turn mutex hands tokens out in FIFO order. No bucket lock is
    /// ever held across an await.
    async fn wait_for_token(
        &self,
        name: &str,
        res: &Arc<Resource>,
        ctx: &FetchContext,
        started: Instant,
    ) -> Result<(), DiggerError> {
        let Ok(_slot) = res.queue.try_acquire() else {
            res.rejected.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .record("rate.rejected", 1.0, &[("resource", name)]);
            return Err(DiggerError::RateLimitRejected {
                resource: name.to_string(),
            });
        };
        self.metrics.record(
            "rate.queued",
            (res.settings.max_queue_size - res.queue.available_permits()) as f64,
            &[("resource", name)],
        );

        let wait_cap = res
            .settings
            .timeout()
            .map(|t| started + t)
            .unwrap_or(ctx.deadline())
            .min(ctx.deadline());

        let _turn = tokio::select! {
            guard = res.turn.lock() => guard,
            _ = ctx.cancellation().cancelled() => {
                return Err(DiggerError::Cancelled(
                    self.clock.now().saturating_duration_since(started).as_millis() as u64,
                ));
            }
        };

        loop {
            let now = self.clock.now();
            let hint = match res.try_consume(now) {
                Ok(()) => return Ok(()),
                Err(hint) => hint,
            };
            if now >= wait_cap {
                res.rejected.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .record("rate.rejected", 1.0, &[("resource", name)]);
                return Err(DiggerError::RateLimitRejected {
                    resource: name.to_string(),
                });
            }
            let nap = hint.min(wait_cap.saturating_duration_since(now));
            tokio::select! {
                _ = self.sleeper.sleep(nap) => {}
                _ = ctx.cancellation().cancelled() => {
                    return Err(DiggerError::Cancelled(
                        self.clock.now().saturating_duration_since(started).as_millis() as u64,
                    ));
                }
            }
        }
    }

    pub fn stats(&self, resource: &str) -> RateStats {
        let res = self.resource(resource);
        let now = self.clock.now();
        let in_period = {
            let mut bucket = res.bucket.lock();
            let period = res.settings.period();
            while bucket
                .grants
                .front()
                .is_some_and(|&t| now.saturating_duration_since(t) >= period)
            {
                bucket.grants.pop_front();
            }
            bucket.grants.len()
        };
        let waits = res.wait_count.load(Ordering::Relaxed);
        RateStats {
            in_period,
            queued: res.settings.max_queue_size - res.queue.available_permits(),
            rejected: res.rejected.load(Ordering::Relaxed),
            avg_wait_ms: if waits == 0 {
                0.0
            } else {
                res.wait_total_ms.load(Ordering::Relaxed) as f64 / waits as f64
            },
        }
    }
}
