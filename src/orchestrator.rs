//! Top-level fetch entry: single-flight gate, health gate, iterative
//! strategy, then dedup and history retention.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, LibraryProfile};
use crate::config::Settings;
use crate::context::FetchContext;
use crate::error::DiggerError;
use crate::fingerprint::fingerprint;
use crate::flight::{FlightConfig, RecommendationHistory, SingleFlight};
use crate::health::{BackendStatus, HealthMonitor};
use crate::limiter::RateLimiter;
use crate::metrics::SharedMetrics;
use crate::planner::PromptPlanner;
use crate::planner::tokenizer::TokenizerRegistry;
use crate::provider::Generator;
use crate::provider::registry::GeneratorRegistry;
use crate::strategy::IterativeStrategy;
use crate::types::{Recommendation, RequestSpec};

/// One configured backend as reported to the host.
#[derive(Debug, Clone)]
pub struct BackendSummary {
    pub id: String,
    pub status: BackendStatus,
    pub context_window: u32,
}

pub struct Orchestrator {
    settings: Settings,
    catalog: Arc<dyn Catalog>,
    registry: Arc<GeneratorRegistry>,
    strategy: Arc<IterativeStrategy>,
    health: Arc<HealthMonitor>,
    limiter: Arc<RateLimiter>,
    flight: SingleFlight<Vec<Recommendation>>,
    history: Arc<RecommendationHistory>,
    metrics: SharedMetrics,
}

impl Orchestrator {
    /// Build the full stack from settings, with HTTP adapters for every
    /// configured backend.
    pub fn new(
        settings: Settings,
        catalog: Arc<dyn Catalog>,
        metrics: SharedMetrics,
    ) -> Result<Self, DiggerError> {
        settings.validate()?;
        let registry = Arc::new(GeneratorRegistry::from_settings(&settings, "default")?);
        Self::assemble(settings, catalog, registry, metrics)
    }

    /// Build the stack over caller-supplied generators (tests, custom
    /// transports).
    pub fn with_generators(
        settings: Settings,
        catalog: Arc<dyn Catalog>,
        generators: Vec<Arc<dyn Generator>>,
        metrics: SharedMetrics,
    ) -> Result<Self, DiggerError> {
        settings.validate()?;
        let registry = Arc::new(GeneratorRegistry::from_generators(generators));
        Self::assemble(settings, catalog, registry, metrics)
    }

    fn assemble(
        settings: Settings,
        catalog: Arc<dyn Catalog>,
        registry: Arc<GeneratorRegistry>,
        metrics: SharedMetrics,
    ) -> Result<Self, DiggerError> {
        let limiter = Arc::new(RateLimiter::new(settings.rate.clone(), Arc::clone(&metrics)));
        let health = Arc::new(HealthMonitor::new(
            settings.health_check_interval(),
            Arc::clone(&metrics),
        ));
        let planner = Arc::new(PromptPlanner::new(
            TokenizerRegistry::new(),
            &settings.plan_cache,
            settings.comprehensive_token_override,
            Arc::clone(&metrics),
        ));
        let strategy = Arc::new(IterativeStrategy::new(
            planner,
            Arc::clone(&limiter),
            Arc::clone(&health),
            Arc::clone(&metrics),
        ));
        let flight = SingleFlight::new(FlightConfig {
            min_interval: settings.min_interval(),
            retention: settings.history_retention(),
            cleanup_cadence: settings.cleanup_cadence(),
        });
        let history = Arc::new(RecommendationHistory::new(settings.history_retention()));

        Ok(Self {
            settings,
            catalog,
            registry,
            strategy,
            health,
            limiter,
            flight,
            history,
            metrics,
        })
    }

    /// Fetch up to `spec.target_count` fresh recommendations.
    ///
    /// Concurrent calls with the same operation key coalesce into one
    /// logical fetch. Failures inside the fetch produce an empty list
    /// with a reason in metrics; only an invalid request errors.
    pub async fn fetch(&self, spec: &RequestSpec) -> Result<Vec<Recommendation>, DiggerError> {
        self.fetch_with_token(spec, &CancellationToken::new()).await
    }

    /// [`Self::fetch`] composed with a caller cancellation handle; the
    /// per-fetch timeout and the caller's signal race, first one wins.
    pub async fn fetch_with_token(
        &self,
        spec: &RequestSpec,
        caller: &CancellationToken,
    ) -> Result<Vec<Recommendation>, DiggerError> {
        self.settings.validate_request(spec)?;

        let ctx = FetchContext::with_timeout_and_token(self.settings.fetch_timeout(), caller);
        let operation_key = self.operation_key(spec);
        let started = Instant::now();

        tracing::info!(
            correlation_id = ctx.correlation_id(),
            operation_key = %operation_key,
            backend = %spec.backend_id,
            target = spec.target_count,
            "recommendation fetch started"
        );
        self.metrics
            .record("fetch.started", 1.0, &[("backend", &spec.backend_id)]);

        let run = {
            let spec = spec.clone();
            let catalog = Arc::clone(&self.catalog);
            let registry = Arc::clone(&self.registry);
            let strategy = Arc::clone(&self.strategy);
            let health = Arc::clone(&self.health);
            let history = Arc::clone(&self.history);
            let metrics = Arc::clone(&self.metrics);
            let ctx = ctx.clone();
            async move {
                Self::run_fetch(spec, catalog, registry, strategy, health, history, metrics, ctx)
                    .await
            }
        };
        let items = self.flight.run(&operation_key, &ctx, run).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics.record(
            "fetch.elapsed_ms",
            elapsed_ms as f64,
            &[("backend", &spec.backend_id)],
        );
        tracing::info!(
            correlation_id = ctx.correlation_id(),
            elapsed_ms,
            returned = items.len(),
            "recommendation fetch complete"
        );
        Ok(items)
    }

    async fn run_fetch(
        spec: RequestSpec,
        catalog: Arc<dyn Catalog>,
        registry: Arc<GeneratorRegistry>,
        strategy: Arc<IterativeStrategy>,
        health: Arc<HealthMonitor>,
        history: Arc<RecommendationHistory>,
        metrics: SharedMetrics,
        ctx: FetchContext,
    ) -> Vec<Recommendation> {
        let Some(generator) = registry.get(&spec.backend_id) else {
            // validate_request checked the settings table; a custom
            // registry may still lack the backend.
            metrics.record(
                "fetch.empty_reason",
                1.0,
                &[("backend", &spec.backend_id), ("reason", "unknown_backend")],
            );
            return Vec::new();
        };
        generator.update_model(&spec.model_id);

        let prober = Arc::clone(&generator);
        let status = health
            .check(&spec.backend_id, move || {
                let prober = Arc::clone(&prober);
                async move { prober.probe().await.map_err(|e| e.to_string()) }
            })
            .await;
        if status == BackendStatus::Unhealthy {
            tracing::warn!(
                correlation_id = ctx.correlation_id(),
                backend = %spec.backend_id,
                "backend unhealthy, skipping fetch"
            );
            metrics.record(
                "fetch.empty_reason",
                1.0,
                &[
                    ("backend", &spec.backend_id),
                    ("reason", "backend_unhealthy"),
                ],
            );
            return Vec::new();
        }

        let profile = LibraryProfile::from_catalog(catalog.as_ref());
        let items = strategy
            .recommend(&generator, &spec, &profile, catalog.as_ref(), &history, &ctx)
            .await;

        let deduped = history.dedupe(items, spec.mode);
        let session_allow: std::collections::HashSet<String> =
            deduped.iter().map(|item| item.key(spec.mode)).collect();
        let fresh = history.filter(deduped, spec.mode, &session_allow);

        if fresh.is_empty() {
            metrics.record(
                "fetch.empty_reason",
                1.0,
                &[("backend", &spec.backend_id), ("reason", "no_results")],
            );
        }
        fresh
    }

    /// Synchronous host edge: runs one fetch to completion on a fresh
    /// single-threaded executor. Must not be called from async code.
    pub fn fetch_blocking(&self, spec: &RequestSpec) -> Result<Vec<Recommendation>, DiggerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build blocking-edge runtime");
        runtime.block_on(self.fetch(spec))
    }

    fn operation_key(&self, spec: &RequestSpec) -> String {
        let library = self.catalog.library_fingerprint();
        fingerprint(&[
            &spec.backend_id,
            &spec.model_id,
            &spec.target_count.to_string(),
            spec.mode.as_str(),
            spec.discovery.as_str(),
            spec.tier.as_str(),
            &library,
        ])
    }

    pub fn health_status(&self, backend_id: &str) -> BackendStatus {
        self.health.status(backend_id)
    }

    /// Configured backends with their current status, for host UIs.
    pub fn backends(&self) -> Vec<BackendSummary> {
        self.registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                let generator = self.registry.get(id)?;
                Some(BackendSummary {
                    id: id.to_string(),
                    status: self.health.status(id),
                    context_window: generator.capability().context_window,
                })
            })
            .collect()
    }

    pub fn rate_stats(&self, resource: &str) -> crate::limiter::RateStats {
        self.limiter.stats(resource)
    }

    /// Forget every suppressed recommendation.
    pub fn clear_history(&self) {
        self.history.clear();
    }
}
