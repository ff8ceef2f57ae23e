//! Requesting side of the ROI protocol.
//!
//! Sends one header (plus optional payload) and reads the reply one byte at a
//! time until a newline, so partial delivery is tolerated without a length
//! prefix.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{Classification, ClassificationResponse, ResponseError, RoiRequest};

/// Longest response line accepted before giving up.
const MAX_RESPONSE_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server closed the connection without a response")]
    NoResponse,

    #[error("response exceeds {MAX_RESPONSE_LEN} bytes")]
    ResponseTooLong,

    #[error("invalid response: {0}")]
    Response(#[from] ResponseError),
}

#[derive(Debug, Clone)]
pub struct RoiClient {
    addr: String,
    timeout: Duration,
}

impl RoiClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one ROI request and parse the response line.
    pub async fn classify(&self, request: &RoiRequest) -> Result<ClassificationResponse, ClientError> {
        let line = tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        Ok(line.parse::<Classification>()?)
    }

    async fn exchange(&self, request: &RoiRequest) -> Result<String, ClientError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        stream.write_all(request.header_line().as_bytes()).await?;
        if let Some(payload) = &request.payload {
            stream.write_all(payload).await?;
        }
        stream.flush().await?;
        tracing::debug!(addr = %self.addr, header = request.header_line().trim_end(), "Sent ROI");

        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match stream.read(&mut byte).await? {
                0 if line.is_empty() => return Err(ClientError::NoResponse),
                0 => break,
                _ if byte[0] == b'\n' => break,
                _ => {
                    if line.len() >= MAX_RESPONSE_LEN {
                        return Err(ClientError::ResponseTooLong);
                    }
                    line.push(byte[0]);
                }
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EmotionLabel;
    use tokio::net::TcpListener;

    async fn one_shot_server(reply: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 64];
            let _ = stream.read(&mut header).await.unwrap();
            // Dribble the reply to exercise byte-at-a-time reads.
            for chunk in reply.chunks(3) {
                stream.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn parses_dribbled_response() {
        let port = one_shot_server(b"Happy (confidence: 91.23%)\n").await;
        let resp = RoiClient::new("127.0.0.1", port)
            .classify(&RoiRequest::new(10, 10, 48, 48))
            .await
            .unwrap();
        assert_eq!(resp.label, EmotionLabel::Happy);
        assert!((resp.confidence - 91.23).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_reply_is_no_response() {
        let port = one_shot_server(b"").await;
        let err = RoiClient::new("127.0.0.1", port)
            .classify(&RoiRequest::new(0, 0, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoResponse));
    }

    #[tokio::test]
    async fn connection_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = RoiClient::new("127.0.0.1", port)
            .classify(&RoiRequest::new(0, 0, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
