//! Socket client for the compute endpoint (one connection per call).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::codec::{read_frame, write_frame, FrameError, DEFAULT_MAX_FRAME_BYTES};
use super::protocol::{codes, ComputeFailure, ComputeRequest, ComputeResponse};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ComputeError {
    /// The endpoint answered with an error response.
    #[error("compute error {}: {}", .0.error, .0.description())]
    Remote(ComputeFailure),

    #[error("compute connection error: {0}")]
    Transport(String),

    #[error("compute protocol error: {0}")]
    Protocol(String),

    #[error("compute call timed out after {0:?}")]
    Timeout(Duration),

    #[error("job deadline exceeded")]
    DeadlineExceeded,
}

impl ComputeError {
    /// Uniform failure view used by the routing engine.
    pub fn to_failure(&self) -> ComputeFailure {
        match self {
            ComputeError::Remote(failure) => failure.clone(),
            ComputeError::Transport(msg) => ComputeFailure::new(codes::CONNECTION, msg.clone()),
            ComputeError::Protocol(msg) => ComputeFailure::new(codes::PROTOCOL, msg.clone()),
            ComputeError::Timeout(after) => ComputeFailure::new(
                codes::TIMEOUT,
                format!("compute call exceeded {:.3}s", after.as_secs_f64()),
            ),
            ComputeError::DeadlineExceeded => {
                ComputeFailure::new(codes::DEADLINE_EXCEEDED, "job deadline exceeded")
            }
        }
    }
}

impl From<FrameError> for ComputeError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::TooLarge { .. } => ComputeError::Protocol(value.to_string()),
            FrameError::Io(_) | FrameError::Closed => ComputeError::Transport(value.to_string()),
        }
    }
}

/// Something that can run one compute call.
#[async_trait]
pub trait ComputeEndpoint: Send + Sync {
    async fn call(&self, request: &ComputeRequest) -> Result<Value, ComputeError>;
}

#[async_trait]
impl<T> ComputeEndpoint for Arc<T>
where
    T: ComputeEndpoint + ?Sized,
{
    async fn call(&self, request: &ComputeRequest) -> Result<Value, ComputeError> {
        (**self).call(request).await
    }
}

/// `tcp://host:port` or `unix:///path/to.sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(std::path::PathBuf),
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() || !addr.contains(':') {
                return Err(format!("tcp endpoint needs host:port, got {s:?}"));
            }
            Ok(Endpoint::Tcp(addr.to_string()))
        } else if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(format!("unix endpoint needs a socket path, got {s:?}"));
            }
            Ok(Endpoint::Unix(path.into()))
        } else {
            Err(format!("unsupported compute endpoint {s:?} (expected tcp:// or unix://)"))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocketComputeClient {
    endpoint: Endpoint,
    max_frame_bytes: usize,
}

impl SocketComputeClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn exchange<S>(&self, mut stream: S, body: &[u8]) -> Result<Value, ComputeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_frame(&mut stream, body).await?;
        let reply = read_frame(&mut stream, self.max_frame_bytes).await?;

        match serde_json::from_slice::<ComputeResponse>(&reply) {
            Ok(ComputeResponse::Ok { result }) => Ok(result),
            Ok(ComputeResponse::Error(failure)) => Err(ComputeError::Remote(failure)),
            Err(e) => Err(ComputeError::Protocol(format!("undecodable response: {e}"))),
        }
    }
}

#[async_trait]
impl ComputeEndpoint for SocketComputeClient {
    async fn call(&self, request: &ComputeRequest) -> Result<Value, ComputeError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| ComputeError::Protocol(format!("unencodable request: {e}")))?;
        debug!(endpoint = %self.endpoint, bytes = body.len(), "calling compute endpoint");

        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| ComputeError::Transport(format!("connect {addr}: {e}")))?;
                self.exchange(stream, &body).await
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| ComputeError::Transport(format!("connect {}: {e}", path.display())))?;
                self.exchange(stream, &body).await
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(ComputeError::Transport(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }
}
