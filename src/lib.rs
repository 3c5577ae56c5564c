//! digger turns a music library into a bounded, deduplicated set of
//! suggestions by driving external text-generation backends.
//!
//! The host hands over a read-only [`catalog::Catalog`], a validated
//! [`config::Settings`], and a [`types::RequestSpec`]; the
//! [`orchestrator::Orchestrator`] returns up to `target_count` unique
//! recommendations that are neither in the library nor recently
//! surfaced, staying live under partial backend failure.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod flight;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod parse;
pub mod planner;
pub mod provider;
pub mod redact;
pub mod retry;
pub mod strategy;
pub mod types;

pub use error::DiggerError;
pub use orchestrator::Orchestrator;
pub use types::{
    DiscoveryMode, Recommendation, RecommendationMode, RequestSpec, SamplingTier,
};
