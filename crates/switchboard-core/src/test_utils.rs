//! Test utilities for switchboard-core
//!
//! Helpers that downstream crates' tests need as well: a connector that
//! fails on demand and handlers that record what they saw.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::{HandlerError, HandlerOutcome, RequestHandler};
use crate::channel::{BrokerConnector, ChannelError, InMemoryBroker, MessageChannel};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::types::RequestId;

/// Refuses the first `failures` connection attempts, then hands out the
/// wrapped broker.
pub struct FlakyConnector {
    failures: u32,
    attempts: AtomicU32,
    broker: InMemoryBroker,
}

impl FlakyConnector {
    pub fn new(failures: u32, broker: InMemoryBroker) -> Self {
        Self {
            failures,
            attempts: AtomicU32::new(0),
            broker,
        }
    }

    pub fn always_down() -> Self {
        Self::new(u32::MAX, InMemoryBroker::new())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for FlakyConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(ChannelError::connection(format!(
                "connection refused (attempt {attempt})"
            )));
        }
        Ok(Arc::new(self.broker.clone()))
    }

    fn describe(&self) -> String {
        "flaky".to_string()
    }
}

/// Answers every request with `success` and remembers the request ids.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<RequestId>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<RequestId> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle(&self, request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.request_id.clone());
        }
        Ok(ResponseEnvelope::success(request.request_id.clone())
            .with("handled_by", "recording")
            .into())
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
