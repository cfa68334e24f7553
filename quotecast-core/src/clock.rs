use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::debug;

/// Wall-clock seam for the lifecycle loop. Waiting for an instant that has
/// already passed is a no-op.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn wait_until(&self, deadline: DateTime<Utc>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn wait_until(&self, deadline: DateTime<Utc>) {
        let remaining = deadline - Utc::now();
        if let Ok(span) = remaining.to_std() {
            debug!(deadline = %deadline, "waiting for wall-clock deadline");
            sleep(span).await;
        }
    }
}
