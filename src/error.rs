use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiggerError {
    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("rate limit rejected for {resource}")]
    RateLimitRejected { resource: String },

    #[error("transient backend error from {backend}: {message}")]
    BackendTransient {
        backend: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {backend}: {message}")]
    BackendAuth { backend: String, message: String },

    #[error("bad request rejected by {backend} ({status}): {message}")]
    BackendBadRequest {
        backend: String,
        status: u16,
        message: String,
    },

    #[error("response parsed to zero items")]
    ParseEmpty,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DiggerError {
    /// Extract the backend id from structured error variants.
    /// Returns None for variants that don't carry backend context.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::BackendTransient { backend, .. } => Some(backend),
            Self::BackendAuth { backend, .. } => Some(backend),
            Self::BackendBadRequest { backend, .. } => Some(backend),
            _ => None,
        }
    }

    /// True for errors worth another attempt at the generator boundary.
    /// Auth and bad-request responses never are; neither is cancellation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendTransient { .. })
    }

    /// True when the failure should count against the backend's health.
    /// Rate-limit rejections and caller cancellations are local events
    /// and must not poison the health record.
    pub fn affects_health(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded(_)
                | Self::BackendTransient { .. }
                | Self::BackendAuth { .. }
                | Self::BackendBadRequest { .. }
        )
    }

    /// Short stable tag used as the `fetch.empty_reason` metric value.
    pub fn empty_reason(&self) -> &'static str {
        match self {
            Self::Cancelled(_) => "cancelled",
            Self::DeadlineExceeded(_) => "deadline",
            Self::RateLimitRejected { .. } => "rate_limited",
            Self::BackendTransient { .. } => "backend_transient",
            Self::BackendAuth { .. } => "backend_auth",
            Self::BackendBadRequest { .. } => "backend_bad_request",
            Self::ParseEmpty => "parse_empty",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}
