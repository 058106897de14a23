// HTTP transport to the remote collector
//
// The engine only needs "POST this JSON, tell me the status". `UreqTransport`
// does that with a blocking ureq agent moved onto the blocking pool.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Transport task failed: {0}")]
    Internal(String),
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// JSON text
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Anything that can POST a JSON body
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Non-2xx answers are `Ok` with their status; only failures to get an
    /// answer at all are errors.
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

// ============================================================================
// UREQ TRANSPORT
// ============================================================================

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }

    fn post_blocking(agent: &ureq::Agent, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut call = agent
            .post(&request.url)
            .set("Content-Type", "application/json");
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }

        match call.send_string(&request.body) {
            Ok(response) => Ok(HttpResponse {
                status: response.status(),
            }),
            Err(ureq::Error::Status(status, _)) => Ok(HttpResponse { status }),
            Err(ureq::Error::Transport(transport)) => Err(map_transport_error(&transport)),
        }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn map_transport_error(transport: &ureq::Transport) -> TransportError {
    match transport.kind() {
        ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
            TransportError::InvalidRequest(transport.to_string())
        }
        ureq::ErrorKind::Io if transport.to_string().contains("timed out") => TransportError::Timeout,
        _ => TransportError::Connection(transport.to_string()),
    }
}

#[async_trait]
impl HttpTransport for UreqTransport {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let agent = self.agent.clone();
        debug!("POST {} ({} bytes)", request.url, request.body.len());
        tokio::task::spawn_blocking(move || Self::post_blocking(&agent, &request))
            .await
            .map_err(|e| TransportError::Internal(e.to_string()))?
    }
}
