//! Processing by HTTP call to a remote target.

use crate::auth::BearerToken;
use crate::config::ProxyConfig;
use crate::error::{ConfigError, ProcessError};
use crate::event::RoutedEvent;
use crate::processor::{EventProcessor, RemoteFailure, RemoteRequest, RemoteResponse, verify_echo};

/// Forwards each event to `POST {base_url}/process?event={name}`.
///
/// A 2xx answer must echo the event's name and id; anything else fails the
/// attempt.
#[derive(Debug, Clone)]
pub struct HttpProcessor {
    client: reqwest::Client,
    base_url: String,
    token: Option<BearerToken>,
}

impl HttpProcessor {
    /// Create a processor for the target at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ProcessorClient`] if the HTTP client cannot be
    /// built.
    pub fn new(base_url: impl Into<String>, config: &ProxyConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::ProcessorClient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: config.bearer_token.clone(),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.as_ref().and_then(BearerToken::header_value) {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        }
    }

    /// Returns `true` if `GET {base_url}/health` answers 2xx.
    pub async fn health(&self) -> bool {
        match self
            .authorized(self.client.get(format!("{}/health", self.base_url)))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(target_url = %self.base_url, error = %e, "health check failed");
                false
            }
        }
    }
}

#[tonic::async_trait]
impl EventProcessor for HttpProcessor {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn process_once(&self, routed: &RoutedEvent) -> Result<(), ProcessError> {
        let request = RemoteRequest::from_routed(routed)?;
        let resp = self
            .authorized(self.client.post(format!("{}/process", self.base_url)))
            .query(&[("event", routed.event.name.as_str())])
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<RemoteFailure>(&body)
                .map(|failure| failure.error)
                .unwrap_or(body);
            return Err(ProcessError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        let echo: RemoteResponse = resp
            .json()
            .await
            .map_err(|e| ProcessError::Transport(format!("invalid response body: {e}")))?;
        verify_echo(routed, &echo.event_name, &echo.event_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::processor::test_support::routed;

    /// Serve canned HTTP responses, one per connection, recording each
    /// request's head and body.
    async fn serve(responses: Vec<(u16, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 64 * 1024];
                let mut read = 0;
                // Read the head, then as much body as Content-Length says.
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    let text = String::from_utf8_lossy(&buf[..read]).to_string();
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let length = text[..head_end]
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())?
                            })
                            .unwrap_or(0);
                        if read >= head_end + 4 + length {
                            break;
                        }
                    }
                }
                recorded
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&buf[..read]).to_string());
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), seen)
    }

    fn config() -> ProxyConfig {
        ProxyConfig {
            timeout: Duration::from_secs(5),
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn success_requires_matching_echo() {
        let (url, seen) = serve(vec![(
            200,
            r#"{"eventName":"OrderPlaced","eventId":"e-1"}"#.to_string(),
        )])
        .await;
        let processor = HttpProcessor::new(url, &config()).expect("client");
        processor
            .process_once(&routed("OrderPlaced", "e-1", "k"))
            .await
            .expect("echo matches");

        let request = seen.lock().unwrap()[0].clone();
        assert!(request.starts_with("POST /process?event=OrderPlaced "));
        assert!(request.contains("\"consumerId\""));
        assert!(request.contains("\"eventName\":\"OrderPlaced\""));
        assert!(!request.to_ascii_lowercase().contains("authorization"));
    }

    #[tokio::test]
    async fn bearer_token_is_sent() {
        let (url, seen) = serve(vec![(
            200,
            r#"{"eventName":"OrderPlaced","eventId":"e-1"}"#.to_string(),
        )])
        .await;
        let config = ProxyConfig {
            bearer_token: Some(BearerToken::new("s3cret")),
            ..config()
        };
        let processor = HttpProcessor::new(url, &config).expect("client");
        processor
            .process_once(&routed("OrderPlaced", "e-1", "k"))
            .await
            .expect("echo matches");
        let request = seen.lock().unwrap()[0].to_ascii_lowercase();
        assert!(request.contains("authorization: bearer s3cret"));
    }

    #[tokio::test]
    async fn mismatched_echo_is_a_failure() {
        let (url, _) = serve(vec![(
            200,
            r#"{"eventName":"OrderPlaced","eventId":"other"}"#.to_string(),
        )])
        .await;
        let processor = HttpProcessor::new(url, &config()).expect("client");
        let err = processor
            .process_once(&routed("OrderPlaced", "e-1", "k"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::ContractViolation { .. }));
    }

    #[tokio::test]
    async fn error_status_reports_remote_message() {
        let (url, _) = serve(vec![(
            500,
            r#"{"statusCode":500,"error":"db down"}"#.to_string(),
        )])
        .await;
        let processor = HttpProcessor::new(url, &config()).expect("client");
        let err = processor
            .process_once(&routed("OrderPlaced", "e-1", "k"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProcessError::Remote {
                status: 500,
                message: "db down".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unreachable_target_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let processor = HttpProcessor::new(format!("http://{addr}/"), &config()).expect("client");
        let err = processor
            .process_once(&routed("OrderPlaced", "e-1", "k"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Transport(_)));
        assert!(!processor.health().await);
    }

    #[tokio::test]
    async fn health_reports_serving() {
        let (url, seen) = serve(vec![(200, "{}".to_string())]).await;
        let processor = HttpProcessor::new(url, &config()).expect("client");
        assert!(processor.health().await);
        assert!(seen.lock().unwrap()[0].starts_with("GET /health "));
    }
}
