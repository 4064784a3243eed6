//! Tuning knobs for producers, consumers, processors, and proxy clients.
//!
//! Every struct here has public fields and a [`Default`] implementation, so
//! callers override only what they need with struct-update syntax.

use std::ops::Range;
use std::time::Duration;

use crate::auth::BearerToken;

/// Configuration for a [`Consumer`](crate::Consumer) poll loop.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eda_runtime::ConsumerConfig;
///
/// let config = ConsumerConfig {
///     consumer_group: "billing".to_string(),
///     max_batch: 10,
///     ..ConsumerConfig::default()
/// };
/// assert_eq!(config.max_batch, 10);
/// assert_eq!(config.loop_error_backoff, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name of the consumer group. Each group keeps its own read index and
    /// tracked-id list per partition.
    ///
    /// Default: `"default"`.
    pub consumer_group: String,

    /// Maximum number of log entries fetched in one window.
    ///
    /// Default: 50.
    pub max_batch: u64,

    /// Range the idle sleep is drawn from when the partition has nothing to
    /// read. A wake signal from the monitor cuts the sleep short.
    ///
    /// Default: 2.5s to 5s.
    pub idle_jitter: Range<Duration>,

    /// Number of single-key reads attempted for an entry that is missing
    /// from a window before it is skipped.
    ///
    /// Default: 50.
    pub missing_entry_attempts: u32,

    /// Delay between missing-entry reads.
    ///
    /// Default: 100 milliseconds.
    pub missing_entry_delay: Duration,

    /// Number of attempts made for each store round-trip in the poll step.
    ///
    /// Default: 3.
    pub store_attempts: u32,

    /// Delay between store round-trip attempts.
    ///
    /// Default: 1 second.
    pub store_retry_delay: Duration,

    /// Pause after a failed poll step before the loop runs again.
    ///
    /// Default: 5 seconds.
    pub loop_error_backoff: Duration,

    /// Tracked-id count above which the set is trimmed.
    ///
    /// Default: 10 000.
    pub tracked_high_water: usize,

    /// Tracked-id count the set is trimmed down to.
    ///
    /// Default: 5 000.
    pub tracked_low_water: usize,

    /// Delete entry keys once their window has been processed.
    ///
    /// Default: `false`.
    pub clean_keys: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "default".to_string(),
            max_batch: 50,
            idle_jitter: Duration::from_millis(2_500)..Duration::from_millis(5_000),
            missing_entry_attempts: 50,
            missing_entry_delay: Duration::from_millis(100),
            store_attempts: 3,
            store_retry_delay: Duration::from_secs(1),
            loop_error_backoff: Duration::from_secs(5),
            tracked_high_water: 10_000,
            tracked_low_water: 5_000,
            clean_keys: false,
        }
    }
}

/// Configuration for a [`Producer`](crate::Producer).
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Attempts for the index increment and for the entry write.
    ///
    /// Default: 20.
    pub attempts: u32,

    /// Fixed delay between attempts.
    ///
    /// Default: 1 second.
    pub retry_delay: Duration,

    /// Raw-deflate each batch before storing it.
    ///
    /// Default: `true`.
    pub compress: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            attempts: 20,
            retry_delay: Duration::from_secs(1),
            compress: true,
        }
    }
}

/// Retry policy applied by a [`Processor`](crate::Processor) to each work
/// item.
///
/// After failed attempt `n` (1-based) the processor waits
/// `(5 + n) * n * delay_unit` before the next one, so with the default
/// unit of one second the waits are 6s, 14s, 24s, 36s and so on.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eda_runtime::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay(1), Duration::from_secs(6));
/// assert_eq!(policy.delay(3), Duration::from_secs(24));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    ///
    /// Default: 10.
    pub max_attempts: u32,

    /// Base unit the backoff formula is multiplied by.
    ///
    /// Default: 1 second.
    pub delay_unit: Duration,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_unit.saturating_mul((5 + attempt).saturating_mul(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_unit: Duration::from_secs(1),
        }
    }
}

/// Configuration for the [`Monitor`](crate::Monitor) subscription loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Base delay for exponential backoff when the subscription drops.
    ///
    /// After a failure the loop waits `reconnect_base_delay`, then twice
    /// that, and so on up to
    /// [`reconnect_max_delay`](MonitorConfig::reconnect_max_delay). A
    /// successful subscribe resets the backoff.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,

    /// Maximum delay between reconnection attempts.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Client settings shared by the HTTP, gRPC and function-invocation
/// processors.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Per-call timeout enforced by the transport client. A timeout is a
    /// processing failure and goes through the retry policy.
    ///
    /// Default: 30 seconds.
    pub timeout: Duration,

    /// Bearer token sent with every HTTP and gRPC call.
    ///
    /// Default: none.
    pub bearer_token: Option<BearerToken>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            bearer_token: None,
        }
    }
}
