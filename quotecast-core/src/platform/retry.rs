use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::warn;

use super::{PlatformError, PlatformResult};

/// Credential refresh seam consumed by [`RetryPolicy::run`]. The live
/// session implements this; tests substitute counters.
#[async_trait]
pub trait Relogin: Send + Sync {
    async fn relogin(&self) -> PlatformResult<()>;
}

/// For stores that authenticate per request (API key) and never need a
/// session refresh.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRefresh;

#[async_trait]
impl Relogin for NoRefresh {
    async fn relogin(&self) -> PlatformResult<()> {
        Ok(())
    }
}

/// Bounded exponential backoff that re-drives the *entire* operation, so a
/// refreshed credential is re-read on the next attempt instead of a stale
/// copy being reused mid-operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: usize,
    base_delay: Duration,
    factor: u32,
}

impl RetryPolicy {
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_secs(1),
            factor: 2,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub async fn run<T, F, Fut>(&self, auth: &dyn Relogin, mut operation: F) -> PlatformResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PlatformResult<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1usize;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.attempts && error.is_recoverable() => {
                    warn!(attempt, error = %error, "operation failed, retrying");
                    if error.requires_login() {
                        if let Err(login_error) = auth.relogin().await {
                            if !login_error.is_recoverable() {
                                return Err(login_error);
                            }
                            warn!(error = %login_error, "session refresh failed, will retry");
                        }
                    }
                    sleep(delay).await;
                    delay *= self.factor;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
