//! Device sessions over serial lines and TCP sockets.
//!
//! A [`TransportSession`] is a point-to-point channel to one instrument that
//! speaks the line-oriented command/reply protocol: `query` writes a request
//! and reads exactly one framed reply, `write` sends a request without reading.
//! Sessions are opened through a [`Connector`] at the start of a poll cycle and
//! closed at its end. Dropping a session also releases the underlying port or
//! socket.
//!
//! The framing choice (serial line vs. socket) is configuration only; the
//! command codec never sees it.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod tcp;

use crate::command::fs740::{DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT};
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Line termination used by both framings.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Upper bound on a single reply line, terminator included.
pub const MAX_REPLY_BYTES: usize = 4096;

/// Default bound on waiting for a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// An open channel to one instrument.
#[async_trait]
pub trait TransportSession: Send {
    /// Endpoint description for logs and errors.
    fn endpoint(&self) -> &str;

    /// Write `request` and read one framed reply (terminator stripped).
    async fn query(&mut self, request: &str) -> Result<String, TransportError>;

    /// Write `request` without reading a reply.
    async fn write(&mut self, request: &str) -> Result<(), TransportError>;

    /// Close the channel. Further calls fail with `NotOpen`.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens fresh sessions to one configured endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    fn endpoint(&self) -> String;

    async fn open(&self) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// Framing and endpoint of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// RS-232 line, 8 data bits, no parity, CR-LF termination.
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
    /// Line-delimited TCP socket.
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

impl TransportConfig {
    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Serial {
                path, baud_rate, ..
            } => format!("{}@{}", path, baud_rate),
            TransportConfig::Tcp { host, port, .. } => format!("{}:{}", host, port),
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            TransportConfig::Serial { timeout, .. } | TransportConfig::Tcp { timeout, .. } => {
                *timeout
            }
        }
    }
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Build the connector for a transport configuration.
pub fn connector_for(config: &TransportConfig) -> Result<Arc<dyn Connector>, TransportError> {
    match config {
        TransportConfig::Tcp {
            host,
            port,
            timeout,
        } => Ok(Arc::new(tcp::TcpConnector::new(host.clone(), *port, *timeout))),
        #[cfg(feature = "instrument_serial")]
        TransportConfig::Serial {
            path,
            baud_rate,
            timeout,
        } => Ok(Arc::new(serial::SerialConnector::new(
            path.clone(),
            *baud_rate,
            *timeout,
        ))),
        #[cfg(not(feature = "instrument_serial"))]
        TransportConfig::Serial { .. } => Err(TransportError::Open {
            endpoint: config.endpoint(),
            reason: "serial support not enabled; rebuild with --features instrument_serial"
                .to_string(),
        }),
    }
}

/// Strip the line terminator from a raw reply line.
pub(crate) fn strip_terminator(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_defaults() {
        let config: TransportConfig = toml::from_str(
            r#"
            kind = "tcp"
            host = "192.168.1.20"
            "#,
        )
        .unwrap();
        assert_eq!(
            config,
            TransportConfig::Tcp {
                host: "192.168.1.20".into(),
                port: 5025,
                timeout: Duration::from_secs(2),
            }
        );
        assert_eq!(config.endpoint(), "192.168.1.20:5025");
    }

    #[test]
    fn test_serial_defaults() {
        let config: TransportConfig = toml::from_str(
            r#"
            kind = "serial"
            path = "/dev/ttyUSB0"
            timeout = "500ms"
            "#,
        )
        .unwrap();
        assert_eq!(
            config,
            TransportConfig::Serial {
                path: "/dev/ttyUSB0".into(),
                baud_rate: 115_200,
                timeout: Duration::from_millis(500),
            }
        );
    }

    #[test]
    fn test_strip_terminator() {
        assert_eq!(strip_terminator("FS740\r\n"), "FS740");
        assert_eq!(strip_terminator("1.0E+07\n"), "1.0E+07");
        assert_eq!(strip_terminator("plain"), "plain");
    }
}
