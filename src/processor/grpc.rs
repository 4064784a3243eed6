//! Processing by unary gRPC call to a remote target.

use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use crate::auth::BearerInterceptor;
use crate::config::ProxyConfig;
use crate::error::{ConfigError, ProcessError};
use crate::event::RoutedEvent;
use crate::processor::{EventProcessor, RemoteRequest, verify_echo};
use crate::proto;
use crate::proto::processor_client::ProcessorClient;

type Authed = InterceptedService<Channel, BearerInterceptor>;

/// Forwards each event to `eda.processor.v1.Processor/Process`.
///
/// The channel connects lazily on first use and reconnects on its own;
/// `Clone` is cheap and shares it.
#[derive(Debug, Clone)]
pub struct GrpcProcessor {
    endpoint: String,
    client: ProcessorClient<Authed>,
    health: HealthClient<Authed>,
}

impl GrpcProcessor {
    /// Create a processor for the target at `endpoint`
    /// (e.g. `"http://10.0.0.7:50051"`).
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ProcessorClient`] if `endpoint` is not a valid
    /// URI.
    pub fn new(endpoint: impl Into<String>, config: &ProxyConfig) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into();
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| ConfigError::ProcessorClient(format!("invalid endpoint {endpoint}: {e}")))?
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .connect_lazy();
        let interceptor = BearerInterceptor {
            token: config.bearer_token.clone(),
        };
        Ok(Self {
            endpoint,
            client: ProcessorClient::with_interceptor(channel.clone(), interceptor.clone()),
            health: HealthClient::with_interceptor(channel, interceptor),
        })
    }

    /// Returns `true` if the target's standard health service reports
    /// `SERVING` for the whole server.
    pub async fn health(&self) -> bool {
        let request = HealthCheckRequest {
            service: String::new(),
        };
        match self.health.clone().check(request).await {
            Ok(resp) => resp.into_inner().status == ServingStatus::Serving as i32,
            Err(status) => {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    code = ?status.code(),
                    "health check failed"
                );
                false
            }
        }
    }
}

impl From<RemoteRequest> for proto::ProcessRequest {
    fn from(request: RemoteRequest) -> Self {
        Self {
            consumer_id: request.consumer_id,
            topic: request.topic,
            partition: request.partition,
            event_name: request.event_name,
            payload: request.payload,
            observer_id: request.observer_id.unwrap_or_default(),
        }
    }
}

#[tonic::async_trait]
impl EventProcessor for GrpcProcessor {
    fn kind(&self) -> &'static str {
        "grpc"
    }

    async fn process_once(&self, routed: &RoutedEvent) -> Result<(), ProcessError> {
        let request: proto::ProcessRequest = RemoteRequest::from_routed(routed)?.into();
        let echo = self
            .client
            .clone()
            .process(tonic::Request::new(request))
            .await?
            .into_inner();
        verify_echo(routed, &echo.event_name, &echo.event_id)
    }
}
