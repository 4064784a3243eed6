//! Crate-level error types for the log store, producers, consumers,
//! processors, and runtime configuration.

/// Error returned by a [`LogStore`](crate::LogStore) or
/// [`ChangeFeed`](crate::ChangeFeed) operation.
///
/// Every variant is considered transient by the producer and consumer
/// retry loops: they are retried with a fixed delay and only surface once
/// the retry budget is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The Redis driver reported a protocol, I/O, or server error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A counter key holds something that is not an unsigned integer.
    #[error("key '{key}' does not hold a valid index: {value}")]
    InvalidIndex {
        /// The offending key.
        key: String,
        /// The raw value found under the key.
        value: String,
    },
}

/// Error returned when encoding or decoding a stored log entry.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Raw-deflate compression or decompression failed.
    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),

    /// The entry is not a JSON array of events.
    #[error("malformed batch: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error returned from [`Producer::produce`](crate::Producer::produce) and
/// [`Publisher::publish`](crate::Publisher::publish).
///
/// This is the only error a publisher ever observes synchronously: handler
/// failures happen asynchronously on the consuming side.
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    /// `produce` was called with no events.
    #[error("cannot produce an empty batch")]
    EmptyBatch,

    /// The topic is not part of the runtime configuration.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// The topic is configured as disabled.
    #[error("topic '{0}' is disabled")]
    TopicDisabled(String),

    /// The requested partition does not exist for the topic.
    #[error("partition {partition} out of range for topic with {partitions} partitions")]
    PartitionOutOfRange {
        /// The requested partition.
        partition: u32,
        /// The topic's partition count.
        partitions: u32,
    },

    /// The batch could not be serialized or compressed.
    #[error("encoding failed: {0}")]
    Codec(#[from] CodecError),

    /// The observer set for a published event could not be read, so its
    /// notifications were not sent. The event itself was stored.
    #[error("observer lookup failed for {key}: {source}")]
    Observers {
        /// The observer set key.
        key: String,
        /// The store error.
        #[source]
        source: StoreError,
    },

    /// The store write failed after the full retry budget.
    #[error("store write failed for {topic}/{partition} (index {index:?}): {source}")]
    Store {
        /// Topic being written to.
        topic: String,
        /// Partition being written to.
        partition: u32,
        /// The acquired write index, if the increment succeeded.
        index: Option<u64>,
        /// The last store error.
        #[source]
        source: StoreError,
    },
}

/// Error produced while processing a single event.
///
/// Every variant except [`Disposed`](ProcessError::Disposed) and
/// [`Busy`](ProcessError::Busy) is subject to the processor retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// A local handler returned an error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The remote target answered with a non-success status.
    #[error("remote target returned status {status}: {message}")]
    Remote {
        /// HTTP status, gRPC code, or function-invocation status.
        status: u16,
        /// Error text reported by the remote target.
        message: String,
    },

    /// The remote target answered but did not echo the event it was given.
    #[error(
        "remote target echoed {actual_name}/{actual_id}, expected {expected_name}/{expected_id}"
    )]
    ContractViolation {
        /// Event name that was sent.
        expected_name: String,
        /// Event id that was sent.
        expected_id: String,
        /// Event name in the response.
        actual_name: String,
        /// Event id in the response.
        actual_id: String,
    },

    /// The call could not be completed (connection refused, timeout, bad
    /// response body).
    #[error("transport error: {0}")]
    Transport(String),

    /// Every retry attempt failed.
    #[error("processing failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: String,
    },

    /// The processor already holds a work item.
    #[error("processor is busy")]
    Busy,

    /// The component was disposed before or during processing.
    #[error("object has been disposed")]
    Disposed,
}

impl From<reqwest::Error> for ProcessError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ProcessError::Remote {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => ProcessError::Transport(err.to_string()),
        }
    }
}

impl From<tonic::Status> for ProcessError {
    fn from(status: tonic::Status) -> Self {
        ProcessError::Remote {
            status: status.code() as u16,
            message: status.message().to_string(),
        }
    }
}

/// Error returned from [`EventRouter::route`](crate::EventRouter::route).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The broker (or its scheduler) has been disposed.
    #[error("object has been disposed")]
    Disposed,
}

/// Error raised by the consumer poll step.
///
/// Caught by the poll loop, logged, and followed by a fixed backoff; it is
/// never fatal to the process. Entries that cannot be decoded are skipped
/// inside the step and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// A store round-trip failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The broker was disposed while the window was in flight. The read
    /// index is left untouched so the window is redelivered on restart.
    #[error("broker disposed while routing")]
    Disposed,

    /// Some routed events were dropped without a result while the consumer
    /// was still running. The read index is left untouched so the window
    /// is redelivered; completed events are already tracked.
    #[error("{abandoned} routed events were abandoned without a result")]
    Incomplete {
        /// Events without a result.
        abandoned: usize,
    },
}

/// Fatal configuration error, raised synchronously at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Two handlers were registered for the same event name or observer key.
    #[error("duplicate handler registration for '{key}': {existing} and {duplicate}")]
    DuplicateHandler {
        /// Event name or observer key.
        key: String,
        /// Handler type registered first.
        existing: String,
        /// Handler type registered second.
        duplicate: String,
    },

    /// Two topics share the same name.
    #[error("duplicate topic: {0}")]
    DuplicateTopic(String),

    /// A setting references a topic that was never configured.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// A topic definition is inconsistent.
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic {
        /// Topic name.
        topic: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A broker was given a different number of consumers and processors.
    #[error("broker needs one processor per consumer (got {consumers} consumers, {processors} processors)")]
    CardinalityMismatch {
        /// Number of consumers.
        consumers: usize,
        /// Number of processors.
        processors: usize,
    },

    /// No log store was configured.
    #[error("no log store configured")]
    MissingStore,

    /// A setting is out of range.
    #[error("invalid setting: {0}")]
    Invalid(String),

    /// A remote processor client could not be constructed.
    #[error("processor client setup failed: {0}")]
    ProcessorClient(String),

    /// The runtime has already been started.
    #[error("runtime already started")]
    AlreadyStarted,

    /// Connecting to the log store failed.
    #[error("store connection failed: {0}")]
    Store(#[from] StoreError),
}
