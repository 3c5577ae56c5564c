//! Multi-round refinement: keep asking until the target count of unique,
//! library-free recommendations is reached or the iteration budget runs
//! out.
//!
//! Generators repeat themselves, so each round over-requests by a
//! growing multiplier and feeds the previous round's rejects back as
//! negative context. Any generator error terminates the loop and
//! returns what has been collected; nothing propagates.

use std::collections::HashSet;
use std::sync::Arc;

use crate::catalog::{Catalog, LibraryProfile, library_keys};
use crate::context::FetchContext;
use crate::flight::RecommendationHistory;
use crate::health::HealthMonitor;
use crate::limiter::RateLimiter;
use crate::metrics::SharedMetrics;
use crate::parse::parse_recommendations;
use crate::planner::{IterativeContext, PromptPlanner};
use crate::provider::Generator;
use crate::types::{Recommendation, RequestSpec};

/// Iteration budget per fetch.
pub const MAX_ITERATIONS: u32 = 3;
/// Per-round request cap, bounding end-to-end cost.
pub const MAX_REQUEST_SIZE: usize = 50;
/// Stop iterating once the unique yield of a round is this good...
const SUCCESS_RATE_STOP: f64 = 0.7;
/// ...and the overall fill ratio is at least this.
const FILL_RATIO_STOP: f64 = 0.8;

fn multiplier(iteration: u32) -> f64 {
    match iteration {
        1 => 1.5,
        2 => 2.0,
        _ => 3.0,
    }
}

/// How many items to ask for this round, given the shortfall.
fn request_size(needed: usize, iteration: u32) -> usize {
    let inflated = (needed as f64 * multiplier(iteration)).ceil() as usize;
    needed.max(inflated).min(MAX_REQUEST_SIZE)
}

pub struct IterativeStrategy {
    planner: Arc<PromptPlanner>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
    metrics: SharedMetrics,
}

impl IterativeStrategy {
    pub fn new(
        planner: Arc<PromptPlanner>,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthMonitor>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            planner,
            limiter,
            health,
            metrics,
        }
    }

    /// Converge on up to `spec.target_count` unique recommendations that
    /// are not in the library and not suppressed by recent history.
    /// History-suppressed items count as rejects and feed the next
    /// round's negative context.
    pub async fn recommend(
        &self,
        generator: &Arc<dyn Generator>,
        spec: &RequestSpec,
        profile: &LibraryProfile,
        catalog: &dyn Catalog,
        history: &RecommendationHistory,
        ctx: &FetchContext,
    ) -> Vec<Recommendation> {
        let target = spec.target_count;
        let lib_keys = library_keys(catalog, spec.mode);

        let mut collected: Vec<Recommendation> = Vec::with_capacity(target);
        let mut collected_keys: HashSet<String> = HashSet::new();
        let mut rejected_keys: HashSet<String> = HashSet::new();

        for iteration in 1..=MAX_ITERATIONS {
            let needed = target - collected.len();
            let size = request_size(needed, iteration);

            let iterative = (iteration > 1).then(|| IterativeContext {
                iteration,
                rejected_total: rejected_keys.len(),
                rejected_keys: rejected_keys.iter().cloned().collect(),
                collected_artists: collected.iter().map(|r| r.artist.clone()).collect(),
            });

            let plan = self.planner.plan(
                spec,
                profile,
                catalog,
                generator.capability(),
                size,
                iterative.as_ref(),
            );
            tracing::debug!(
                correlation_id = ctx.correlation_id(),
                iteration,
                request_size = size,
                prompt_tokens = plan.estimated_tokens_post,
                compressed = plan.compressed,
                trimmed = plan.trimmed,
                "planned iteration prompt"
            );

            let backend = spec.backend_id.as_str();
            let generator = Arc::clone(generator);
            let prompt = plan.prompt.clone();
            let invoke_ctx = ctx.clone();
            let outcome = self
                .limiter
                .execute(backend, ctx, move || async move {
                    generator.invoke(&prompt, &invoke_ctx).await
                })
                .await;

            let reply = match outcome {
                Ok(Ok(reply)) => {
                    self.health.record_success(backend, reply.elapsed_ms);
                    if let Some(input) = reply.input_tokens {
                        self.metrics.record(
                            "fetch.input_tokens",
                            input as f64,
                            &[("backend", backend)],
                        );
                    }
                    if let Some(output) = reply.output_tokens {
                        self.metrics.record(
                            "fetch.output_tokens",
                            output as f64,
                            &[("backend", backend)],
                        );
                    }
                    reply
                }
                Ok(Err(err)) => {
                    if err.affects_health() {
                        self.health.record_failure(backend, &err.to_string());
                    }
                    if collected.is_empty() {
                        self.metrics.record(
                            "fetch.empty_reason",
                            1.0,
                            &[("backend", backend), ("reason", err.empty_reason())],
                        );
                    }
                    tracing::debug!(
                        correlation_id = ctx.correlation_id(),
                        iteration,
                        reason = err.empty_reason(),
                        "iteration aborted: {err}"
                    );
                    break;
                }
                Err(err) => {
                    // Admission failure (queue full, wait timeout,
                    // cancel): local, no health impact.
                    tracing::debug!(
                        correlation_id = ctx.correlation_id(),
                        iteration,
                        reason = err.empty_reason(),
                        "iteration not admitted: {err}"
                    );
                    break;
                }
            };

            let parsed = parse_recommendations(&reply.text);
            if parsed.is_empty() {
                if collected.is_empty() {
                    self.metrics.record(
                        "fetch.empty_reason",
                        1.0,
                        &[("backend", backend), ("reason", "parse_empty")],
                    );
                }
                tracing::debug!(
                    correlation_id = ctx.correlation_id(),
                    iteration,
                    "generator reply parsed to zero items"
                );
                break;
            }

            let received = parsed.len();
            let mut unique = 0usize;
            for item in parsed {
                if !item.is_complete(spec.mode) {
                    continue;
                }
                let key = item.key(spec.mode);
                if lib_keys.contains(&key)
                    || collected_keys.contains(&key)
                    || history.is_suppressed(&key)
                {
                    rejected_keys.insert(key);
                    continue;
                }
                collected_keys.insert(key);
                collected.push(item);
                unique += 1;
            }

            let success_rate = unique as f64 / received as f64;
            let fill_ratio = collected.len() as f64 / target as f64;
            tracing::debug!(
                correlation_id = ctx.correlation_id(),
                iteration,
                received,
                unique,
                success_rate,
                collected = collected.len(),
                "iteration complete"
            );
            self.metrics.record(
                "fetch.iteration_success_rate",
                success_rate,
                &[("backend", backend)],
            );

            let keep_going = collected.len() < target
                && iteration < MAX_ITERATIONS
                && (success_rate < SUCCESS_RATE_STOP || fill_ratio < FILL_RATIO_STOP);
            if !keep_going {
                break;
            }
        }

        collected.truncate(target);
        collected
    }
}
