use apiary_core::{KernelError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

/// Bounded exponential backoff for lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(thresholds: &apiary_core::config::Thresholds) -> Self {
        Self {
            attempts: thresholds.lock_retry_attempts.max(1),
            base_delay: Duration::from_millis(thresholds.lock_retry_base_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at one second.
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(10);
        (self.base_delay * factor).min(Duration::from_secs(1))
    }
}

/// Exclusive advisory lock on `<segment>.lock`.
/// Automatically released when dropped.
pub struct SegmentLock {
    _file: File,
}

impl SegmentLock {
    /// Single non-blocking attempt. `Ok(None)` when another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(_) => Ok(None),
        }
    }

    /// Acquire with retries, surfacing `LockContention` once they run out.
    pub fn acquire(path: &Path, segment: &str, retry: RetryPolicy) -> Result<Self> {
        for attempt in 0..retry.attempts {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if attempt + 1 < retry.attempts {
                let delay = retry.delay(attempt);
                tracing::debug!(segment, attempt, ?delay, "segment lock busy, backing off");
                std::thread::sleep(delay);
            }
        }
        tracing::warn!(segment, attempts = retry.attempts, "segment lock contention");
        Err(KernelError::LockContention {
            segment: segment.to_string(),
            attempts: retry.attempts,
        })
    }
}
