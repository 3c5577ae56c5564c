use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Monotonic time source. Injectable so tests can drive time explicitly;
/// the default reads tokio's clock, which `tokio::time::pause` controls.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Cooperative sleep. Implementations must return promptly when the
/// runtime advances past the deadline; they never busy-wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
