//! Line-delimited TCP socket sessions (FS740 raw socket on port 5025).

use super::{strip_terminator, Connector, TransportSession, LINE_TERMINATOR, MAX_REPLY_BYTES};
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Opens a new socket per session.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: String, port: u16, timeout: Duration) -> Self {
        Self {
            host,
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&self) -> Result<Box<dyn TransportSession>, TransportError> {
        let endpoint = self.endpoint();
        let stream = timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| TransportError::Open {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(|source| TransportError::Io {
            endpoint: endpoint.clone(),
            source,
        })?;

        debug!(endpoint = %endpoint, "TCP session opened");
        Ok(Box::new(TcpSession {
            endpoint,
            stream: Some(BufReader::new(stream)),
            timeout: self.timeout,
        }))
    }
}

/// One open socket.
pub struct TcpSession {
    endpoint: String,
    stream: Option<BufReader<TcpStream>>,
    timeout: Duration,
}

impl TcpSession {
    fn stream(&mut self) -> Result<&mut BufReader<TcpStream>, TransportError> {
        let endpoint = &self.endpoint;
        self.stream.as_mut().ok_or_else(|| TransportError::NotOpen {
            endpoint: endpoint.clone(),
        })
    }

    async fn send(&mut self, request: &str) -> Result<(), TransportError> {
        let endpoint = self.endpoint.clone();
        let line = format!("{}{}", request, LINE_TERMINATOR);
        let stream = self.stream()?.get_mut();
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|source| TransportError::Io {
                endpoint: endpoint.clone(),
                source,
            })?;
        stream
            .flush()
            .await
            .map_err(|source| TransportError::Io { endpoint, source })?;
        debug!(endpoint = %self.endpoint, request, "sent");
        Ok(())
    }
}

#[async_trait]
impl TransportSession for TcpSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&mut self, request: &str) -> Result<String, TransportError> {
        self.send(request).await?;

        let endpoint = self.endpoint.clone();
        let limit = self.timeout;
        let stream = self.stream()?;
        let mut line = String::new();
        // One byte past the cap tells an overlong reply from one that fits.
        let mut bounded = stream.take(MAX_REPLY_BYTES as u64 + 1);
        let read = timeout(limit, bounded.read_line(&mut line))
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.clone(),
                timeout: limit,
            })?
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::InvalidData => TransportError::InvalidText {
                    endpoint: endpoint.clone(),
                },
                _ => TransportError::Io {
                    endpoint: endpoint.clone(),
                    source,
                },
            })?;
        if read == 0 {
            return Err(TransportError::Closed { endpoint });
        }
        if line.len() > MAX_REPLY_BYTES {
            return Err(TransportError::ReplyTooLong {
                endpoint,
                limit: MAX_REPLY_BYTES,
            });
        }

        let reply = strip_terminator(&line).to_string();
        debug!(endpoint = %self.endpoint, reply = %reply, "received");
        Ok(reply)
    }

    async fn write(&mut self, request: &str) -> Result<(), TransportError> {
        self.send(request).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .get_mut()
                .shutdown()
                .await
                .map_err(|source| TransportError::Io {
                    endpoint: self.endpoint.clone(),
                    source,
                })?;
            debug!(endpoint = %self.endpoint, "TCP session closed");
        }
        Ok(())
    }
}
