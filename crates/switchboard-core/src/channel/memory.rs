use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    AckHandle, Acker, ChannelError, Consumer, Delivery, MessageChannel, MessageProperties,
    Settlement,
};

/// Per-queue counters, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, StoredMessage>,
    notify: Arc<Notify>,
    stats: QueueStats,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
            stats: QueueStats::default(),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    closed: CancellationToken,
}

impl BrokerInner {
    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, ChannelError> {
        self.state
            .lock()
            .map_err(|_| ChannelError::storage("in-memory broker lock poisoned"))
    }

    fn settle(&self, queue: &str, tag: u64, settlement: Settlement) -> Result<(), ChannelError> {
        let mut state = self.lock()?;
        let queue_state =
            state
                .queues
                .get_mut(queue)
                .ok_or_else(|| ChannelError::QueueNotDeclared {
                    queue: queue.to_string(),
                })?;
        let mut message = queue_state
            .unacked
            .remove(&tag)
            .ok_or(ChannelError::UnknownDelivery { delivery_tag: tag })?;

        match settlement {
            Settlement::Ack => queue_state.stats.acked += 1,
            Settlement::Reject { requeue: true } => {
                message.redelivered = true;
                queue_state.ready.push_front(message);
                queue_state.stats.requeued += 1;
                queue_state.notify.notify_one();
            }
            Settlement::Reject { requeue: false } => queue_state.stats.discarded += 1,
        }
        Ok(())
    }
}

/// Process-local broker.
///
/// Clones share the same queues. [`InMemoryBroker::restart`] simulates a
/// broker restart: transient queues and transient messages are lost,
/// unacknowledged deliveries return to their queue marked redelivered.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn restart(&self) -> Result<(), ChannelError> {
        let mut state = self.inner.lock()?;
        state.queues.retain(|_, queue| queue.durable);
        for queue in state.queues.values_mut() {
            let outstanding = std::mem::take(&mut queue.unacked);
            for (_, mut message) in outstanding.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            queue.ready.retain(|message| message.properties.persistent);
            queue.notify.notify_one();
        }
        debug!(target: "channel::memory", "Broker restarted");
        Ok(())
    }

    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        let state = self.inner.lock().ok()?;
        state.queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            ..q.stats
        })
    }

    /// Bodies and properties of messages waiting on `queue`, oldest first.
    pub fn ready_messages(&self, queue: &str) -> Vec<(Vec<u8>, MessageProperties)> {
        let Ok(state) = self.inner.lock() else {
            return Vec::new();
        };
        state
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| (m.body.clone(), m.properties.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.inner
            .lock()
            .map(|state| state.queues.contains_key(queue))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MessageChannel for InMemoryBroker {
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), ChannelError> {
        if self.inner.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let mut state = self.inner.lock()?;
        match state.queues.get(queue) {
            Some(existing) if existing.durable != durable => Err(ChannelError::DeclareMismatch {
                queue: queue.to_string(),
                durable: existing.durable,
            }),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.to_string(), QueueState::new(durable));
                debug!(target: "channel::memory", queue, durable, "Queue declared");
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), ChannelError> {
        if self.inner.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let mut state = self.inner.lock()?;
        let queue_state =
            state
                .queues
                .get_mut(queue)
                .ok_or_else(|| ChannelError::QueueNotDeclared {
                    queue: queue.to_string(),
                })?;
        queue_state.ready.push_back(StoredMessage {
            body,
            properties,
            redelivered: false,
        });
        queue_state.stats.published += 1;
        queue_state.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, ChannelError> {
        if self.inner.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        if !self.is_declared(queue) {
            return Err(ChannelError::QueueNotDeclared {
                queue: queue.to_string(),
            });
        }
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.inner.closed.cancel();
        Ok(())
    }
}

struct MemoryConsumer {
    inner: Arc<BrokerInner>,
    queue: String,
}

impl MemoryConsumer {
    /// Pops the next ready message, or returns the queue's notifier to wait on.
    fn try_take(&self) -> Result<Result<Delivery, Arc<Notify>>, ChannelError> {
        let mut state = self.inner.lock()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        let queue_state =
            state
                .queues
                .get_mut(&self.queue)
                .ok_or_else(|| ChannelError::QueueNotDeclared {
                    queue: self.queue.clone(),
                })?;

        let Some(message) = queue_state.ready.pop_front() else {
            return Ok(Err(queue_state.notify.clone()));
        };
        queue_state.unacked.insert(tag, message.clone());
        queue_state.stats.delivered += 1;

        Ok(Ok(Delivery {
            delivery_tag: tag,
            queue: self.queue.clone(),
            body: message.body,
            properties: message.properties,
            redelivered: message.redelivered,
            acker: Acker::new(MemoryAck {
                inner: self.inner.clone(),
                queue: self.queue.clone(),
                tag,
                settled: false,
            }),
        }))
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Result<Delivery, ChannelError>> {
        loop {
            if self.inner.closed.is_cancelled() {
                return None;
            }
            let notify = match self.try_take() {
                Ok(Ok(delivery)) => return Some(Ok(delivery)),
                Ok(Err(notify)) => notify,
                Err(err) => return Some(Err(err)),
            };
            tokio::select! {
                () = notify.notified() => {}
                () = self.inner.closed.cancelled() => return None,
            }
        }
    }
}

struct MemoryAck {
    inner: Arc<BrokerInner>,
    queue: String,
    tag: u64,
    settled: bool,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn settle(mut self: Box<Self>, settlement: Settlement) -> Result<(), ChannelError> {
        self.settled = true;
        self.inner.settle(&self.queue, self.tag, settlement)
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        // An abandoned delivery goes back to the queue, as on channel close.
        if !self.settled {
            let _ = self
                .inner
                .settle(&self.queue, self.tag, Settlement::Reject { requeue: true });
        }
    }
}
