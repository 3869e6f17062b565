//! RS-232 sessions via `tokio-serial`.
//!
//! The FS740 rear-panel port runs 8 data bits, no parity, one stop bit and no
//! flow control. Replies end in CR-LF; bytes are accumulated until the
//! terminator arrives or the reply deadline passes.

use super::{strip_terminator, Connector, TransportSession, LINE_TERMINATOR, MAX_REPLY_BYTES};
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(path: String, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            path,
            baud_rate,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn endpoint(&self) -> String {
        format!("{}@{}", self.path, self.baud_rate)
    }

    async fn open(&self) -> Result<Box<dyn TransportSession>, TransportError> {
        let endpoint = self.endpoint();
        let port = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Open {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        debug!(endpoint = %endpoint, "serial session opened");
        Ok(Box::new(SerialSession {
            endpoint,
            port: Some(port),
            timeout: self.timeout,
        }))
    }
}

pub struct SerialSession {
    endpoint: String,
    port: Option<SerialStream>,
    timeout: Duration,
}

impl SerialSession {
    fn port(&mut self) -> Result<&mut SerialStream, TransportError> {
        let endpoint = &self.endpoint;
        self.port.as_mut().ok_or_else(|| TransportError::NotOpen {
            endpoint: endpoint.clone(),
        })
    }

    async fn send(&mut self, request: &str) -> Result<(), TransportError> {
        let endpoint = self.endpoint.clone();
        let payload = format!("{}{}", request, LINE_TERMINATOR);
        let port = self.port()?;
        port.write_all(payload.as_bytes())
            .await
            .map_err(|source| TransportError::Io {
                endpoint: endpoint.clone(),
                source,
            })?;
        port.flush()
            .await
            .map_err(|source| TransportError::Io { endpoint, source })?;
        Ok(())
    }

    /// Read until CR-LF or the reply deadline.
    async fn read_line(&mut self) -> Result<String, TransportError> {
        let endpoint = self.endpoint.clone();
        let limit = self.timeout;
        let deadline = Instant::now() + limit;
        let port = self.port()?;

        let mut reply = Vec::with_capacity(64);
        let mut buf = [0u8; 64];
        while !reply.ends_with(LINE_TERMINATOR.as_bytes()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if reply.len() > MAX_REPLY_BYTES {
                return Err(TransportError::ReplyTooLong {
                    endpoint,
                    limit: MAX_REPLY_BYTES,
                });
            }
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    endpoint,
                    timeout: limit,
                });
            }
            match tokio::time::timeout(remaining, port.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(TransportError::Closed { endpoint }),
                Ok(Ok(n)) => reply.extend_from_slice(&buf[..n]),
                Ok(Err(source)) => return Err(TransportError::Io { endpoint, source }),
                Err(_) => {
                    return Err(TransportError::Timeout {
                        endpoint,
                        timeout: limit,
                    })
                }
            }
        }

        let text = String::from_utf8(reply)
            .map_err(|_| TransportError::InvalidText {
                endpoint: endpoint.clone(),
            })?;
        Ok(strip_terminator(&text).to_string())
    }
}

#[async_trait]
impl TransportSession for SerialSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&mut self, request: &str) -> Result<String, TransportError> {
        self.send(request).await?;
        let reply = self.read_line().await?;
        debug!(endpoint = %self.endpoint, request, reply = %reply, "serial query");
        Ok(reply)
    }

    async fn write(&mut self, request: &str) -> Result<(), TransportError> {
        self.send(request).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the stream releases the device file.
        if self.port.take().is_some() {
            debug!(endpoint = %self.endpoint, "serial session closed");
        }
        Ok(())
    }
}
