//! Classification service: TCP listener speaking the ROI protocol.
//!
//! One request per connection: read header → classify → write response →
//! close. Rejected requests are closed without sending any bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Classifier;
use crate::codec::{ProtocolError, RoiCodec};
use crate::protocol::HeaderError;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Consume the `w*h` pixel payload that may follow the header.
    pub read_payload: bool,
    /// Upper bound on connections handled at once.
    pub max_connections: usize,
    /// Deadline for receiving a complete request.
    pub read_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: crate::DEFAULT_SERVICE_PORT,
            read_payload: false,
            max_connections: 16,
            read_timeout: Duration::from_secs(10),
        }
    }
}

impl ServiceConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_read_payload(mut self, read_payload: bool) -> Self {
        self.read_payload = read_payload;
        self
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Bind the configured address.
pub async fn bind(config: &ServiceConfig) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, "Starting classification service");
    Ok(listener)
}

/// Accept connections until `shutdown` fires.
pub async fn run(
    listener: TcpListener,
    config: ServiceConfig,
    classifier: Arc<dyn Classifier>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let limit = Arc::new(Semaphore::new(config.max_connections.max(1)));
    info!(backend = classifier.name(), "Listening for connections");

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let classifier = Arc::clone(&classifier);
        let read_payload = config.read_payload;
        let read_timeout = config.read_timeout;
        tokio::spawn(async move {
            handle_connection(stream, peer, classifier, read_payload, read_timeout).await;
            drop(permit);
        });
    }

    info!("Classification service stopped");
    Ok(())
}

/// Bind and run until SIGINT/SIGTERM.
pub async fn serve(config: ServiceConfig, classifier: Arc<dyn Classifier>) -> anyhow::Result<()> {
    let listener = bind(&config).await?;
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    run(listener, config, classifier, shutdown).await?;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    classifier: Arc<dyn Classifier>,
    read_payload: bool,
    read_timeout: Duration,
) {
    debug!(%peer, "Connection accepted");
    let codec = if read_payload {
        RoiCodec::with_payload()
    } else {
        RoiCodec::new()
    };
    let mut framed = Framed::new(stream, codec);

    let request = match tokio::time::timeout(read_timeout, framed.next()).await {
        Ok(Some(Ok(request))) => request,
        Ok(Some(Err(ProtocolError::Header(HeaderError::UnknownCommand(cmd))))) => {
            warn!(%peer, command = %cmd, "Unknown command");
            return;
        }
        Ok(Some(Err(e))) => {
            warn!(%peer, error = %e, "Rejected request");
            return;
        }
        Ok(None) => {
            debug!(%peer, "Peer closed before sending a request");
            return;
        }
        Err(_) => {
            warn!(%peer, timeout_ms = read_timeout.as_millis() as u64, "Request read timed out");
            return;
        }
    };

    info!(
        %peer,
        x = request.x,
        y = request.y,
        w = request.w,
        h = request.h,
        payload_bytes = request.payload.as_ref().map_or(0, Vec::len),
        "Processing ROI"
    );

    let response = classifier.predict(&request);
    info!(%peer, response = %response, "Sending result");
    if let Err(e) = framed.send(response).await {
        warn!(%peer, error = %e, "Failed to write response");
    }
    debug!(%peer, "Connection closed");
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
