//! Worker slots that execute one event at a time.
//!
//! A [`Processor`] owns the retry policy, the busy flag, and disposal; the
//! actual work of one attempt is delegated to an [`EventProcessor`]: a
//! local handler call or a call to a remote target.

mod grpc;
mod http;
mod lambda;
mod local;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::Instrument;

pub use self::grpc::GrpcProcessor;
pub use self::http::HttpProcessor;
pub use self::lambda::LambdaProcessor;
pub use self::local::LocalProcessor;
use crate::config::RetryPolicy;
use crate::dead_letter::append_dead_letter;
use crate::error::ProcessError;
use crate::event::RoutedEvent;
use crate::scheduler::WorkItem;

/// One attempt at processing an event.
#[tonic::async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    /// Short name of the transport, for logs (`"local"`, `"http"`, ...).
    fn kind(&self) -> &'static str;

    /// Process `event` once.
    ///
    /// # Errors
    ///
    /// Any error fails the attempt and is subject to the retry policy.
    async fn process_once(&self, event: &RoutedEvent) -> Result<(), ProcessError>;

    /// Release transport resources. Called once, on disposal.
    async fn dispose(&self) {}
}

/// Metadata and payload sent to remote targets. The JSON form is the HTTP
/// request body and the function-invocation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    /// Consumer that read the event.
    pub consumer_id: String,
    /// Topic it was read from.
    pub topic: String,
    /// Partition it was read from.
    pub partition: u32,
    /// Event name.
    pub event_name: String,
    /// The serialized event.
    pub payload: String,
    /// Observer instance, for observer notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_id: Option<String>,
}

impl RemoteRequest {
    /// Build the request for `routed`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Transport`] if the event cannot be
    /// serialized.
    pub fn from_routed(routed: &RoutedEvent) -> Result<Self, ProcessError> {
        let payload = serde_json::to_string(&routed.event)
            .map_err(|e| ProcessError::Transport(format!("event serialization failed: {e}")))?;
        Ok(Self {
            consumer_id: routed.consumer_id.clone(),
            topic: routed.topic.clone(),
            partition: routed.partition,
            event_name: routed.event.name.clone(),
            payload,
            observer_id: routed.observer_id.clone(),
        })
    }
}

/// What a remote target answers on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResponse {
    /// Echo of the event name.
    pub event_name: String,
    /// Echo of the event id.
    pub event_id: String,
}

/// What a remote target answers on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFailure {
    /// Status reported by the target.
    pub status_code: u16,
    /// Error message reported by the target.
    pub error: String,
}

/// Check that a remote target echoed back the event it was sent.
pub(crate) fn verify_echo(
    routed: &RoutedEvent,
    event_name: &str,
    event_id: &str,
) -> Result<(), ProcessError> {
    if event_name == routed.event.name && event_id == routed.event.id {
        return Ok(());
    }
    Err(ProcessError::ContractViolation {
        expected_name: routed.event.name.clone(),
        expected_id: routed.event.id.clone(),
        actual_name: event_name.to_string(),
        actual_id: event_id.to_string(),
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// --- Worker slot ---

/// A worker slot: runs one [`WorkItem`] at a time with retries.
pub struct Processor {
    name: String,
    inner: Arc<dyn EventProcessor>,
    policy: RetryPolicy,
    dead_letter_path: Option<PathBuf>,
    busy: AtomicBool,
    disposed: AtomicBool,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("name", &self.name)
            .field("kind", &self.inner.kind())
            .field("busy", &self.is_busy())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Processor {
    /// Create a slot named `name` (used in logs) around `inner`.
    pub fn new(name: impl Into<String>, inner: Arc<dyn EventProcessor>, policy: RetryPolicy) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            name: name.into(),
            inner,
            policy,
            dead_letter_path: None,
            busy: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Append exhausted events to the JSONL file at `path`.
    pub fn with_dead_letter_path(mut self, path: Option<PathBuf>) -> Self {
        self.dead_letter_path = path;
        self
    }

    /// Slot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` between receiving a work item and completing it.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Returns `true` once [`dispose`](Processor::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Process `item`, retrying per the policy, and complete its handle
    /// exactly once.
    ///
    /// After failed attempt `n` the slot waits [`RetryPolicy::delay`]`(n)`.
    /// Disposal cuts the wait short and rejects the item with
    /// [`ProcessError::Disposed`]. Once every attempt has failed, the event
    /// is logged with its full payload and, if configured, appended to the
    /// dead-letter file.
    ///
    /// # Returns
    ///
    /// The same result the item's completion handle receives.
    pub async fn process(&self, item: WorkItem) -> Result<(), ProcessError> {
        let WorkItem { event, done } = item;

        if self.is_disposed() {
            let _ = done.send(Err(ProcessError::Disposed));
            return Err(ProcessError::Disposed);
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            let _ = done.send(Err(ProcessError::Busy));
            return Err(ProcessError::Busy);
        }

        let result = self.run_attempts(&event).await;

        self.busy.store(false, Ordering::Release);
        // The receiver may be gone if the consumer was disposed.
        let _ = done.send(result.clone());
        result
    }

    async fn run_attempts(&self, routed: &RoutedEvent) -> Result<(), ProcessError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if self.is_disposed() {
                return Err(ProcessError::Disposed);
            }
            attempt += 1;

            let span = tracing::debug_span!(
                "process_attempt",
                processor = %self.name,
                kind = self.inner.kind(),
                event_id = %routed.event.id,
                event_name = %routed.event.name,
                attempt,
            );
            // Each attempt runs on its own task so a panicking handler fails
            // the attempt instead of unwinding through the slot.
            let inner = Arc::clone(&self.inner);
            let event = routed.clone();
            let outcome =
                tokio::spawn(async move { inner.process_once(&event).await }.instrument(span))
                    .await;
            let error = match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(ProcessError::Disposed)) => return Err(ProcessError::Disposed),
                Ok(Err(e)) => e,
                Err(e) if e.is_panic() => {
                    ProcessError::Handler(format!("panicked: {}", panic_message(e.into_panic())))
                }
                Err(_) => return Err(ProcessError::Disposed),
            };

            if attempt >= max_attempts {
                self.give_up(routed, attempt, &error);
                return Err(ProcessError::Exhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            let delay = self.policy.delay(attempt);
            tracing::warn!(
                processor = %self.name,
                topic = %routed.topic,
                partition = routed.partition,
                event_id = %routed.event.id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "event processing failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.wait_for(|disposed| *disposed) => {
                    return Err(ProcessError::Disposed);
                }
            }
        }
    }

    fn give_up(&self, routed: &RoutedEvent, attempts: u32, error: &ProcessError) {
        let payload = serde_json::to_string(&routed.event).unwrap_or_default();
        tracing::error!(
            processor = %self.name,
            topic = %routed.topic,
            partition = routed.partition,
            consumer_id = %routed.consumer_id,
            handler = routed.registration.handler_type_name(),
            attempts,
            error = %error,
            payload = %payload,
            "event processing failed after exhausting retries"
        );
        if let Some(path) = &self.dead_letter_path
            && let Err(e) = append_dead_letter(path, routed, &error.to_string())
        {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "failed to append dead letter"
            );
        }
    }

    /// Stop accepting work, cancel any pending retry wait, and release the
    /// transport. An attempt already in flight runs to completion.
    ///
    /// Calling `dispose` more than once is safe.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        self.inner.dispose().await;
        tracing::debug!(processor = %self.name, "processor disposed");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::event::EventEnvelope;
    use crate::registration::{HandlerRegistry, RegistrationKey};

    /// Fails the first `failures` attempts, then succeeds.
    pub(crate) struct Flaky {
        pub(crate) failures: u32,
        pub(crate) calls: AtomicU32,
    }

    #[tonic::async_trait]
    impl EventProcessor for Flaky {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn process_once(&self, _event: &RoutedEvent) -> Result<(), ProcessError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ProcessError::Handler(format!("failure {call}")))
            } else {
                Ok(())
            }
        }
    }

    pub(crate) fn routed(name: &str, id: &str, key: &str) -> RoutedEvent {
        let registry = HandlerRegistry::builder()
            .remote(RegistrationKey::Event(name.to_string()), "TestHandler")
            .build()
            .expect("build should succeed");
        RoutedEvent {
            event: EventEnvelope::new(name, key).with_id(id),
            partition_key: key.to_string(),
            topic: "orders".to_string(),
            partition: 0,
            consumer_id: "{app-orders-0}-default".to_string(),
            registration: registry.resolve(name).expect("registered"),
            observer_id: None,
        }
    }

    pub(crate) fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}
