use crate::error::KetchError;
use async_trait::async_trait;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A timestamp the leader promises not to publish a commit before real time
/// has passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProposedTimestamp(u64);

impl ProposedTimestamp {
    pub fn from_millis(millis: u64) -> Self {
        ProposedTimestamp(millis)
    }

    pub fn millis(&self) -> u64 {
        self.0
    }
}

/// Monotonic clock seam used by rounds.
///
/// `propose` reads the current time; `sleep_until_past` resolves once real
/// time has strictly advanced beyond the proposed value, or fails with
/// `TimeUncertain` when `max_wait` elapses first.
#[async_trait]
pub trait TimeSource: Send + Sync {
    fn propose(&self) -> ProposedTimestamp;

    async fn sleep_until_past(
        &self,
        ts: ProposedTimestamp,
        max_wait: Duration,
    ) -> Result<(), KetchError>;
}

/// System-clock implementation.
pub struct SystemTimeSource;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl TimeSource for SystemTimeSource {
    fn propose(&self) -> ProposedTimestamp {
        ProposedTimestamp(now_millis())
    }

    async fn sleep_until_past(
        &self,
        ts: ProposedTimestamp,
        max_wait: Duration,
    ) -> Result<(), KetchError> {
        let started = Instant::now();
        loop {
            let now = now_millis();
            if now > ts.millis() {
                return Ok(());
            }
            let remaining = Duration::from_millis(ts.millis() - now + 1);
            if started.elapsed() + remaining > max_wait {
                return Err(KetchError::TimeUncertain);
            }
            tokio::time::sleep(remaining).await;
        }
    }
}
