//! Explicit per-fetch context: correlation id, deadline, cancellation.
//!
//! Replaces the ambient "current request id" pattern; every public
//! operation takes a [`FetchContext`] and the id travels with the task
//! across all suspension points.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct FetchContext {
    correlation_id: String,
    deadline: Instant,
    cancel: CancellationToken,
}

impl FetchContext {
    /// Fresh context with a generated correlation id and the given
    /// timeout from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            correlation_id: new_correlation_id(),
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Context composed with a caller-supplied cancellation handle.
    /// First signal wins: the child token trips on either the caller's
    /// token or an explicit `cancel()` on this context.
    pub fn with_timeout_and_token(timeout: Duration, caller: &CancellationToken) -> Self {
        Self {
            correlation_id: new_correlation_id(),
            deadline: Instant::now() + timeout,
            cancel: caller.child_token(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Derived context sharing this fetch's id and cancellation but with
    /// a tighter deadline. Never extends the parent deadline.
    pub fn narrowed(&self, timeout: Duration) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            deadline: self.deadline.min(Instant::now() + timeout),
            cancel: self.cancel.clone(),
        }
    }
}

/// Correlation id in the `<timestamp>_<8 hex>` wire format, sent as
/// `X-Correlation-Id` on every outbound call.
fn new_correlation_id() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    format!("{ts}_{}", hex::encode(bytes))
}
