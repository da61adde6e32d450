//! Bounded retry of tracker fetches with exponential backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::tracker::{BugRecord, FetchError, TrackerAdapter};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial: Duration::from_millis(config.backoff_initial_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
        }
    }

    /// Delay before retrying after `failed` attempts, without jitter.
    pub fn base_delay(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(20);
        self.initial.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn delay(&self, failed: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay(failed) + Duration::from_millis(extra)
    }
}

/// How a fetch ended once retries were exhausted or not needed.
#[derive(Debug)]
pub enum FetchOutcome {
    Complete(Vec<BugRecord>),
    /// Records obtained before the fetch gave up. The caller persists them
    /// even though the result set is incomplete.
    Partial { records: Vec<BugRecord>, error: FetchError },
    Failed(FetchError),
}

/// State of an in-progress fetch that survives cancellation, so a caller
/// that times the fetch out can still report attempts and keep the records.
#[derive(Debug, Default)]
pub struct FetchProgress {
    attempts: AtomicU32,
    best: Mutex<Option<Vec<BugRecord>>>,
}

impl FetchProgress {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Largest partial result seen so far.
    pub fn take_partial(&self) -> Option<Vec<BugRecord>> {
        self.best.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn offer(&self, records: Vec<BugRecord>) {
        let mut best = self.best.lock().unwrap_or_else(|e| e.into_inner());
        if best.as_ref().map_or(true, |b| records.len() > b.len()) {
            *best = Some(records);
        }
    }
}

/// Fetch `filter`, retrying transient failures up to the policy's attempt
/// limit.
///
/// A partial result is never discarded: the largest partial set seen across
/// attempts is returned if no attempt completes.
pub async fn fetch_with_retry(
    tracker: &dyn TrackerAdapter,
    filter: &str,
    fields: &[String],
    policy: &RetryPolicy,
    progress: &FetchProgress,
) -> FetchOutcome {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        progress.attempts.store(attempt, Ordering::SeqCst);

        let error = match tracker.fetch(filter, fields).await {
            Ok(records) => {
                debug!(attempt, records = records.len(), "tracker fetch complete");
                return FetchOutcome::Complete(records);
            }
            Err(FetchError::Partial { records, source }) => {
                progress.offer(records);
                *source
            }
            Err(e) => e,
        };

        if !error.is_transient() || attempt >= policy.max_attempts {
            return match progress.take_partial() {
                Some(records) => FetchOutcome::Partial { records, error },
                None => FetchOutcome::Failed(error),
            };
        }

        let delay = policy.delay(attempt);
        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "tracker fetch failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
