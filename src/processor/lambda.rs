//! Processing by synchronous function invocation.

use aws_config::BehaviorVersion;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::config::ProxyConfig;
use crate::error::ProcessError;
use crate::event::RoutedEvent;
use crate::processor::{EventProcessor, RemoteFailure, RemoteResponse, verify_echo};

/// Invokes a named function with `RequestResponse` semantics for each
/// event.
///
/// The event JSON is the invocation payload; consumer, topic, partition
/// and event name travel base64-encoded in the client context under
/// `custom`.
#[derive(Debug, Clone)]
pub struct LambdaProcessor {
    client: aws_sdk_lambda::Client,
    function_name: String,
}

impl LambdaProcessor {
    /// Create a processor for `function_name`, loading credentials and
    /// region from the environment.
    pub async fn new(function_name: impl Into<String>, config: &ProxyConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.timeout)
                    .build(),
            )
            .load()
            .await;
        Self::from_client(aws_sdk_lambda::Client::new(&sdk_config), function_name)
    }

    /// Create a processor around an existing client.
    pub fn from_client(client: aws_sdk_lambda::Client, function_name: impl Into<String>) -> Self {
        Self {
            client,
            function_name: function_name.into(),
        }
    }

    /// Name of the invoked function.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }
}

/// Base64 client context carrying the routing metadata of `routed`.
pub(crate) fn client_context(routed: &RoutedEvent) -> String {
    let mut custom = serde_json::json!({
        "consumerId": routed.consumer_id,
        "topic": routed.topic,
        "partition": routed.partition,
        "eventName": routed.event.name,
    });
    if let Some(observer_id) = &routed.observer_id {
        custom["observerId"] = serde_json::Value::String(observer_id.clone());
    }
    STANDARD.encode(serde_json::json!({ "custom": custom }).to_string())
}

/// Shape of an unhandled function error.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnhandledError {
    error_message: String,
}

/// Turn an invocation result into the attempt's outcome.
fn interpret(
    routed: &RoutedEvent,
    status: i32,
    function_error: Option<&str>,
    payload: &[u8],
) -> Result<(), ProcessError> {
    let status_code = u16::try_from(status).unwrap_or(u16::MAX);
    if function_error.is_some() || status != 200 {
        let message = serde_json::from_slice::<RemoteFailure>(payload)
            .map(|failure| failure.error)
            .or_else(|_| serde_json::from_slice::<UnhandledError>(payload).map(|e| e.error_message))
            .unwrap_or_else(|_| {
                function_error
                    .map(str::to_string)
                    .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned())
            });
        return Err(ProcessError::Remote {
            status: status_code,
            message,
        });
    }
    if let Ok(failure) = serde_json::from_slice::<RemoteFailure>(payload) {
        return Err(ProcessError::Remote {
            status: failure.status_code,
            message: failure.error,
        });
    }
    let echo: RemoteResponse = serde_json::from_slice(payload)
        .map_err(|e| ProcessError::Transport(format!("invalid invocation result: {e}")))?;
    verify_echo(routed, &echo.event_name, &echo.event_id)
}

#[tonic::async_trait]
impl EventProcessor for LambdaProcessor {
    fn kind(&self) -> &'static str {
        "lambda"
    }

    async fn process_once(&self, routed: &RoutedEvent) -> Result<(), ProcessError> {
        let payload = serde_json::to_vec(&routed.event)
            .map_err(|e| ProcessError::Transport(format!("event serialization failed: {e}")))?;
        let output = self
            .client
            .invoke()
            .function_name(&self.function_name)
            .invocation_type(InvocationType::RequestResponse)
            .client_context(client_context(routed))
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|e| ProcessError::Transport(DisplayErrorContext(&e).to_string()))?;

        let body: &[u8] = output.payload().map(|b| b.as_ref()).unwrap_or_default();
        interpret(routed, output.status_code(), output.function_error(), body)
    }
}
