//! Tunables, passed explicitly into each component's constructor.

use std::time::Duration;

/// Limits of the [`AdmissionPool`](crate::pool::AdmissionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of transactions in the main pool.
    pub capacity: usize,
    /// Maximum number of out-of-order transactions held back.
    pub cache_capacity: usize,
    /// Maximum number of pooled plus cached transactions per sender.
    pub sender_tx_limit: usize,
    /// Age after which a pooled transaction is dropped.
    pub tx_ttl: Duration,
    /// Period of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            capacity: 10_000,
            cache_capacity: 10_000,
            sender_tx_limit: 64,
            tx_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_sender_tx_limit(mut self, limit: usize) -> Self {
        self.sender_tx_limit = limit;
        self
    }

    pub fn with_tx_ttl(mut self, ttl: Duration) -> Self {
        self.tx_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Time bounds applied to push notes.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Oldest acceptable note timestamp, relative to now.
    pub max_note_age: Duration,
    /// How far in the future a note timestamp may lie.
    pub max_future_drift: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            max_note_age: Duration::from_secs(60 * 60),
            max_future_drift: Duration::ZERO,
        }
    }
}

impl ValidatorConfig {
    pub fn with_max_note_age(mut self, age: Duration) -> Self {
        self.max_note_age = age;
        self
    }

    pub fn with_max_future_drift(mut self, drift: Duration) -> Self {
        self.max_future_drift = drift;
        self
    }
}

/// Settings shared by the watcher and the reference syncer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Worker threads per component.
    pub workers: usize,
    /// Period of the watcher's lag scan.
    pub scan_interval: Duration,
    /// Attempts to bring a diverged reference into agreement before giving up.
    pub max_compat_retries: u32,
    /// Delay before a diverged reference is retried.
    pub compat_backoff: Duration,
    /// Sleep of an idle worker.
    pub idle_backoff: Duration,
    /// Upper bound of the random extra sleep added to `idle_backoff`.
    pub idle_jitter: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            workers: 4,
            scan_interval: Duration::from_secs(5),
            max_compat_retries: 3,
            compat_backoff: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(500),
            idle_jitter: Duration::from_millis(250),
        }
    }
}

impl SyncConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_max_compat_retries(mut self, retries: u32) -> Self {
        self.max_compat_retries = retries;
        self
    }

    pub fn with_compat_backoff(mut self, backoff: Duration) -> Self {
        self.compat_backoff = backoff;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration, jitter: Duration) -> Self {
        self.idle_backoff = backoff;
        self.idle_jitter = jitter;
        self
    }
}
