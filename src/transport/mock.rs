//! In-process connector for tests and dry runs.
//!
//! Replies come from a responder closure. The connector keeps counters of open
//! sessions so callers can assert that every session was closed and that no
//! two sessions to the same device overlapped.

use super::{Connector, TransportSession};
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Identification string of a stock FS740.
pub const FS740_IDENTITY: &str = "Stanford Research Systems,FS740,s/n001234,ver1.08";

/// Produces the reply to one request.
pub type Responder = Arc<dyn Fn(&str) -> Result<String, TransportError> + Send + Sync>;

#[derive(Default)]
struct MockState {
    open_sessions: AtomicUsize,
    max_open_sessions: AtomicUsize,
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
    requests: Mutex<Vec<String>>,
}

/// Scripted connector. Clones share counters.
#[derive(Clone)]
pub struct MockConnector {
    endpoint: String,
    responder: Responder,
    latency: Duration,
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new<F>(endpoint: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, TransportError> + Send + Sync + 'static,
    {
        Self {
            endpoint: endpoint.into(),
            responder: Arc::new(responder),
            latency: Duration::ZERO,
            state: Arc::new(MockState::default()),
        }
    }

    /// An FS740 that identifies itself and answers every measurement query
    /// with `reading`.
    pub fn fs740(endpoint: impl Into<String>, reading: &str) -> Self {
        let reading = reading.to_string();
        Self::new(endpoint, move |request| {
            if request == "*IDN?" {
                Ok(FS740_IDENTITY.to_string())
            } else {
                Ok(reading.clone())
            }
        })
    }

    /// Delay every reply by `latency` (honours Tokio's paused clock).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.state.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sessions seen.
    pub fn max_open_sessions(&self) -> usize {
        self.state.max_open_sessions.load(Ordering::SeqCst)
    }

    /// Total successful opens.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in order.
    pub async fn requests(&self) -> Vec<String> {
        self.state.requests.lock().await.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn open(&self) -> Result<Box<dyn TransportSession>, TransportError> {
        let failing = self
            .state
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::Open {
                endpoint: self.endpoint.clone(),
                reason: "connection refused (simulated)".to_string(),
            });
        }

        let now_open = self.state.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_open_sessions
            .fetch_max(now_open, Ordering::SeqCst);
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockSession {
            endpoint: self.endpoint.clone(),
            responder: Arc::clone(&self.responder),
            latency: self.latency,
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct MockSession {
    endpoint: String,
    responder: Responder,
    latency: Duration,
    state: Arc<MockState>,
    open: bool,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::NotOpen {
                endpoint: self.endpoint.clone(),
            })
        }
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.state.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TransportSession for MockSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&mut self, request: &str) -> Result<String, TransportError> {
        self.ensure_open()?;
        self.state.requests.lock().await.push(request.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.responder)(request)
    }

    async fn write(&mut self, request: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.requests.lock().await.push(request.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.release();
    }
}
