//! Token estimation behind a pluggable per-model registry.

use std::collections::HashMap;
use std::sync::Arc;

/// Estimates how many tokens a piece of text costs for some model.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Default estimator used when no model-specific tokenizer is known:
/// `max(words * 1.3, chars * 0.25)`, rounded up. Deliberately
/// pessimistic for prose-heavy prompts.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> u32 {
        let words = text.split_whitespace().count() as f64;
        let chars = text.chars().count() as f64;
        (words * 1.3).max(chars * 0.25).ceil() as u32
    }
}

/// Registry of tokenizers keyed by model id, falling back to the
/// heuristic for unknown models.
pub struct TokenizerRegistry {
    by_model: HashMap<String, Arc<dyn TokenEstimator>>,
    fallback: Arc<dyn TokenEstimator>,
}

impl Default for TokenizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenizerRegistry {
    pub fn new() -> Self {
        Self {
            by_model: HashMap::new(),
            fallback: Arc::new(HeuristicEstimator),
        }
    }

    pub fn register(&mut self, model_id: &str, estimator: Arc<dyn TokenEstimator>) {
        self.by_model.insert(model_id.to_string(), estimator);
    }

    pub fn for_model(&self, model_id: &str) -> Arc<dyn TokenEstimator> {
        self.by_model
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}
