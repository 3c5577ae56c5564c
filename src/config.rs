//! Settings for the orchestrator core. Validation is fatal at
//! construction; nothing here fails at runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DiggerError;
use crate::types::RequestSpec;

/// Which wire format a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Loopback/private HTTP, `{model, prompt, options}` body,
    /// `{response}` reply.
    LocalCompletion,
    /// Loopback/private HTTP, chat-shaped `{messages}` body,
    /// `{choices[0].message.content}` reply.
    LocalChat,
    /// Vendor HTTPS messages API with bearer/header credential and
    /// optional extended-reasoning budget.
    CloudMessages,
}

impl BackendKind {
    pub fn is_local(self) -> bool {
        matches!(self, Self::LocalCompletion | Self::LocalChat)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    pub id: String,
    pub kind: BackendKind,
    pub base_url: String,
    /// Opaque credential; required for cloud backends, ignored for local.
    #[serde(default)]
    pub credential: Option<String>,
    /// Liveness endpoint for health probes. Defaults to `base_url`.
    #[serde(default)]
    pub probe_url: Option<String>,
    /// Context window of the default model, in tokens.
    pub context_window: u32,
    /// Hard prompt ceiling below the context window, when the vendor
    /// imposes one.
    #[serde(default)]
    pub prompt_ceiling: Option<u32>,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend_timeout_secs() -> u64 {
    90
}

impl BackendSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSettings {
    #[serde(default = "default_rate_capacity")]
    pub max_requests: u32,
    #[serde(default = "default_rate_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_rate_queue")]
    pub max_queue_size: usize,
    /// Cap on how long an admitted caller may wait for a token.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_rate_capacity() -> u32 {
    10
}
fn default_rate_period_secs() -> u64 {
    60
}
fn default_rate_queue() -> usize {
    8
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            max_requests: default_rate_capacity(),
            period_secs: default_rate_period_secs(),
            max_queue_size: default_rate_queue(),
            timeout_secs: None,
        }
    }
}

impl RateSettings {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCacheSettings {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    64
}
fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for PlanCacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl PlanCacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub backends: Vec<BackendSettings>,

    /// Minimum spacing between fetches for the same operation key.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// How long surfaced recommendations stay suppressed.
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: u64,
    /// How often stale throttle/history entries are swept.
    #[serde(default = "default_cleanup_cadence_secs")]
    pub cleanup_cadence_secs: u64,
    /// Minimum spacing between liveness probes per backend.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// End-to-end deadline for one fetch.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default)]
    pub rate: RateSettings,
    #[serde(default)]
    pub plan_cache: PlanCacheSettings,

    /// Cap on the comprehensive tier's target tokens, when the operator
    /// wants to bound prompt spend regardless of context window.
    #[serde(default)]
    pub comprehensive_token_override: Option<u32>,
}

fn default_min_interval_secs() -> u64 {
    5
}
fn default_history_retention_secs() -> u64 {
    600
}
fn default_cleanup_cadence_secs() -> u64 {
    60
}
fn default_health_check_interval_secs() -> u64 {
    300
}
fn default_fetch_timeout_secs() -> u64 {
    120
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            min_interval_secs: default_min_interval_secs(),
            history_retention_secs: default_history_retention_secs(),
            cleanup_cadence_secs: default_cleanup_cadence_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            rate: RateSettings::default(),
            plan_cache: PlanCacheSettings::default(),
            comprehensive_token_override: None,
        }
    }
}

impl Settings {
    /// Parse settings from a TOML document and validate them.
    pub fn from_toml_str(raw: &str) -> Result<Self, DiggerError> {
        let settings: Settings = toml::from_str(raw)
            .map_err(|e| DiggerError::InvalidConfig(format!("toml parse: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Build settings from `DIGGER_*` environment variables. Backends
    /// register only when their variable is present; a warning is logged
    /// for each absent one so operators can see why a backend is
    /// missing.
    pub fn from_env() -> Result<Self, DiggerError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// [`Self::from_env`] over an injectable variable source.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, DiggerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_var<T: std::str::FromStr>(
            raw: Option<String>,
            name: &str,
            default: T,
        ) -> Result<T, DiggerError> {
            match raw {
                None => Ok(default),
                Some(value) => value.trim().parse().map_err(|_| {
                    DiggerError::InvalidConfig(format!("{name}: cannot parse {value:?}"))
                }),
            }
        }

        let mut backends = Vec::new();

        if let Some(url) = lookup("DIGGER_OLLAMA_URL") {
            let probe = url.trim_end_matches('/').replace("/api/generate", "/api/tags");
            backends.push(BackendSettings {
                id: "ollama".to_string(),
                kind: BackendKind::LocalCompletion,
                base_url: url,
                credential: None,
                probe_url: Some(probe),
                context_window: parse_var(
                    lookup("DIGGER_OLLAMA_CONTEXT"),
                    "DIGGER_OLLAMA_CONTEXT",
                    8192,
                )?,
                prompt_ceiling: None,
                timeout_secs: default_backend_timeout_secs(),
            });
        } else {
            tracing::warn!("DIGGER_OLLAMA_URL not set, ollama backend unavailable");
        }

        if let Some(url) = lookup("DIGGER_LMSTUDIO_URL") {
            backends.push(BackendSettings {
                id: "lmstudio".to_string(),
                kind: BackendKind::LocalChat,
                base_url: url,
                credential: None,
                probe_url: None,
                context_window: parse_var(
                    lookup("DIGGER_LMSTUDIO_CONTEXT"),
                    "DIGGER_LMSTUDIO_CONTEXT",
                    8192,
                )?,
                prompt_ceiling: None,
                timeout_secs: default_backend_timeout_secs(),
            });
        } else {
            tracing::warn!("DIGGER_LMSTUDIO_URL not set, lmstudio backend unavailable");
        }

        if let Some(key) = lookup("DIGGER_ANTHROPIC_API_KEY") {
            backends.push(BackendSettings {
                id: "anthropic".to_string(),
                kind: BackendKind::CloudMessages,
                base_url: "https://api.anthropic.com/v1/messages".to_string(),
                credential: Some(key),
                probe_url: None,
                context_window: 200_000,
                prompt_ceiling: None,
                timeout_secs: default_backend_timeout_secs(),
            });
        } else {
            tracing::warn!("DIGGER_ANTHROPIC_API_KEY not set, anthropic backend unavailable");
        }

        if backends.is_empty() {
            tracing::error!("no backends configured, every fetch will fail validation");
        }

        let settings = Settings {
            backends,
            min_interval_secs: parse_var(
                lookup("DIGGER_MIN_INTERVAL_SECS"),
                "DIGGER_MIN_INTERVAL_SECS",
                default_min_interval_secs(),
            )?,
            history_retention_secs: parse_var(
                lookup("DIGGER_HISTORY_RETENTION_SECS"),
                "DIGGER_HISTORY_RETENTION_SECS",
                default_history_retention_secs(),
            )?,
            cleanup_cadence_secs: parse_var(
                lookup("DIGGER_CLEANUP_CADENCE_SECS"),
                "DIGGER_CLEANUP_CADENCE_SECS",
                default_cleanup_cadence_secs(),
            )?,
            health_check_interval_secs: parse_var(
                lookup("DIGGER_HEALTH_CHECK_INTERVAL_SECS"),
                "DIGGER_HEALTH_CHECK_INTERVAL_SECS",
                default_health_check_interval_secs(),
            )?,
            fetch_timeout_secs: parse_var(
                lookup("DIGGER_FETCH_TIMEOUT_SECS"),
                "DIGGER_FETCH_TIMEOUT_SECS",
                default_fetch_timeout_secs(),
            )?,
            rate: RateSettings {
                max_requests: parse_var(
                    lookup("DIGGER_RATE_MAX_REQUESTS"),
                    "DIGGER_RATE_MAX_REQUESTS",
                    default_rate_capacity(),
                )?,
                period_secs: parse_var(
                    lookup("DIGGER_RATE_PERIOD_SECS"),
                    "DIGGER_RATE_PERIOD_SECS",
                    default_rate_period_secs(),
                )?,
                max_queue_size: parse_var(
                    lookup("DIGGER_RATE_QUEUE"),
                    "DIGGER_RATE_QUEUE",
                    default_rate_queue(),
                )?,
                timeout_secs: match lookup("DIGGER_RATE_TIMEOUT_SECS") {
                    Some(raw) => Some(parse_var(
                        Some(raw),
                        "DIGGER_RATE_TIMEOUT_SECS",
                        0u64,
                    )?),
                    None => None,
                },
            },
            plan_cache: PlanCacheSettings {
                capacity: parse_var(
                    lookup("DIGGER_PLAN_CACHE_CAPACITY"),
                    "DIGGER_PLAN_CACHE_CAPACITY",
                    default_cache_capacity(),
                )?,
                ttl_secs: parse_var(
                    lookup("DIGGER_PLAN_CACHE_TTL_SECS"),
                    "DIGGER_PLAN_CACHE_TTL_SECS",
                    default_cache_ttl_secs(),
                )?,
            },
            comprehensive_token_override: match lookup("DIGGER_COMPREHENSIVE_TOKEN_OVERRIDE") {
                Some(raw) => Some(parse_var(
                    Some(raw),
                    "DIGGER_COMPREHENSIVE_TOKEN_OVERRIDE",
                    0u32,
                )?),
                None => None,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    pub fn cleanup_cadence(&self) -> Duration {
        Duration::from_secs(self.cleanup_cadence_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn backend(&self, id: &str) -> Option<&BackendSettings> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn validate(&self) -> Result<(), DiggerError> {
        if self.rate.max_requests == 0 {
            return Err(DiggerError::InvalidConfig(
                "rate.max_requests must be >= 1".to_string(),
            ));
        }
        if self.rate.period_secs == 0 {
            return Err(DiggerError::InvalidConfig(
                "rate.period_secs must be > 0".to_string(),
            ));
        }
        if self.plan_cache.capacity == 0 {
            return Err(DiggerError::InvalidConfig(
                "plan_cache.capacity must be >= 1".to_string(),
            ));
        }
        if self.plan_cache.ttl_secs == 0 {
            return Err(DiggerError::InvalidConfig(
                "plan_cache.ttl_secs must be > 0".to_string(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(DiggerError::InvalidConfig(
                "fetch_timeout_secs must be > 0".to_string(),
            ));
        }
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(DiggerError::InvalidConfig(
                    "backend id must be non-empty".to_string(),
                ));
            }
            if reqwest::Url::parse(&backend.base_url).is_err() {
                return Err(DiggerError::InvalidConfig(format!(
                    "backend {}: base_url is not a valid URL",
                    backend.id
                )));
            }
            if backend.context_window == 0 {
                return Err(DiggerError::InvalidConfig(format!(
                    "backend {}: context_window must be > 0",
                    backend.id
                )));
            }
            if backend.kind == BackendKind::CloudMessages
                && backend.credential.as_deref().is_none_or(str::is_empty)
            {
                return Err(DiggerError::InvalidConfig(format!(
                    "backend {}: cloud backends require a credential",
                    backend.id
                )));
            }
        }
        Ok(())
    }

    /// Validate a per-fetch request against these settings.
    pub fn validate_request(&self, spec: &RequestSpec) -> Result<(), DiggerError> {
        if spec.target_count == 0 {
            return Err(DiggerError::InvalidConfig(
                "target_count must be >= 1".to_string(),
            ));
        }
        if self.backend(&spec.backend_id).is_none() {
            return Err(DiggerError::InvalidConfig(format!(
                "unknown backend: {}",
                spec.backend_id
            )));
        }
        Ok(())
    }
}
