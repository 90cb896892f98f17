use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, Consumer, Delivery, MessageChannel};
use crate::envelope::{AgentKind, Envelope, ResponseEnvelope};
use crate::types::{CorrelationId, RequestId};

#[derive(Debug, Error)]
pub enum ResponseStoreError {
    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl ResponseStoreError {
    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResponse {
    pub response: ResponseEnvelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    Completed(StoredResponse),
    Pending,
    NotFound,
}

/// What happened to a response handed to [`ResponseStore::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Stored,
    /// A response was already stored for this request; the first one wins.
    Duplicate,
    /// Stored, but the gateway had no pending entry for it.
    Unsolicited,
    /// Stored, but its correlation id differs from the one minted on submit.
    CorrelationMismatch,
}

/// Request id to response, filled by the [`ResponseCollector`].
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn record_pending(
        &self,
        request_id: &RequestId,
        correlation_id: &CorrelationId,
        agent: AgentKind,
    ) -> Result<(), ResponseStoreError>;

    /// Forgets a pending entry whose request never made it onto the queue.
    async fn discard(&self, request_id: &RequestId) -> Result<(), ResponseStoreError>;

    async fn complete(
        &self,
        response: ResponseEnvelope,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Completion, ResponseStoreError>;

    async fn lookup(&self, request_id: &RequestId) -> Result<LookupResult, ResponseStoreError>;
}

/// Entries are forgotten this long after their last write, answered or not.
pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(3600);

struct Entry {
    agent: Option<AgentKind>,
    correlation_id: Option<CorrelationId>,
    response: Option<StoredResponse>,
    expires_at: Instant,
}

struct Entries {
    map: HashMap<RequestId, Entry>,
    next_sweep: Instant,
}

impl Entries {
    /// Drops every expired entry at most once per TTL, so requests that are
    /// never answered or never looked up still go away.
    fn sweep(&mut self, now: Instant, ttl: Duration) -> usize {
        if now < self.next_sweep {
            return 0;
        }
        self.next_sweep = now + ttl;
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires_at > now);
        before - self.map.len()
    }

    /// The live entry for `request_id`, dropping it first if it expired.
    fn live(&mut self, request_id: &RequestId, now: Instant) -> Option<&mut Entry> {
        if self
            .map
            .get(request_id)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            self.map.remove(request_id);
        }
        self.map.get_mut(request_id)
    }
}

/// Response store held in process memory. Expiry follows the tokio clock.
pub struct InMemoryResponseStore {
    ttl: Duration,
    entries: RwLock<Entries>,
}

impl Default for InMemoryResponseStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_RESPONSE_TTL)
    }
}

impl InMemoryResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                next_sweep: Instant::now() + ttl,
            }),
        }
    }

    /// Drops every expired entry and returns how many went.
    pub fn purge_expired(&self) -> Result<usize, ResponseStoreError> {
        let now = Instant::now();
        let mut entries = self.write()?;
        let before = entries.map.len();
        entries.map.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.map.len())
    }

    pub fn len(&self) -> Result<usize, ResponseStoreError> {
        Ok(self.read()?.map.len())
    }

    pub fn is_empty(&self) -> Result<bool, ResponseStoreError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries>, ResponseStoreError> {
        self.entries
            .read()
            .map_err(|e| ResponseStoreError::lock_poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries>, ResponseStoreError> {
        self.entries
            .write()
            .map_err(|e| ResponseStoreError::lock_poisoned(e.to_string()))
    }

    fn swept(&self, now: Instant) -> Result<RwLockWriteGuard<'_, Entries>, ResponseStoreError> {
        let mut entries = self.write()?;
        let purged = entries.sweep(now, self.ttl);
        if purged > 0 {
            debug!(target: "gateway::responses", purged, "Expired responses dropped");
        }
        Ok(entries)
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn record_pending(
        &self,
        request_id: &RequestId,
        correlation_id: &CorrelationId,
        agent: AgentKind,
    ) -> Result<(), ResponseStoreError> {
        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut entries = self.swept(now)?;
        entries.live(request_id, now);
        let entry = entries.map.entry(request_id.clone()).or_insert(Entry {
            agent: None,
            correlation_id: None,
            response: None,
            expires_at,
        });
        entry.agent = Some(agent);
        entry.correlation_id = Some(correlation_id.clone());
        entry.expires_at = expires_at;
        Ok(())
    }

    async fn discard(&self, request_id: &RequestId) -> Result<(), ResponseStoreError> {
        let mut entries = self.write()?;
        if entries
            .map
            .get(request_id)
            .is_some_and(|entry| entry.response.is_none())
        {
            entries.map.remove(request_id);
        }
        Ok(())
    }

    async fn complete(
        &self,
        response: ResponseEnvelope,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Completion, ResponseStoreError> {
        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut entries = self.swept(now)?;
        let stored = StoredResponse {
            response,
            correlation_id,
            received_at: Utc::now(),
        };

        let Some(entry) = entries.live(&stored.response.request_id, now) else {
            entries.map.insert(
                stored.response.request_id.clone(),
                Entry {
                    agent: None,
                    correlation_id: stored.correlation_id.clone(),
                    response: Some(stored),
                    expires_at,
                },
            );
            return Ok(Completion::Unsolicited);
        };

        if entry.response.is_some() {
            return Ok(Completion::Duplicate);
        }
        let matches = entry.correlation_id.is_none() || entry.correlation_id == stored.correlation_id;
        entry.response = Some(stored);
        entry.expires_at = expires_at;
        Ok(if matches {
            Completion::Stored
        } else {
            Completion::CorrelationMismatch
        })
    }

    async fn lookup(&self, request_id: &RequestId) -> Result<LookupResult, ResponseStoreError> {
        let now = Instant::now();
        {
            let entries = self.read()?;
            match entries.map.get(request_id) {
                Some(entry) if entry.expires_at > now => {
                    return Ok(match &entry.response {
                        Some(stored) => LookupResult::Completed(stored.clone()),
                        None => {
                            debug!(request_id = %request_id, agent = ?entry.agent, "Response still pending");
                            LookupResult::Pending
                        }
                    });
                }
                Some(_) => {}
                None => return Ok(LookupResult::NotFound),
            }
        }

        let mut entries = self.write()?;
        entries.live(request_id, now);
        Ok(LookupResult::NotFound)
    }
}

/// Drains every `<agent>_responses` queue into a [`ResponseStore`].
pub struct ResponseCollector {
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn ResponseStore>,
}

impl ResponseCollector {
    pub fn new(channel: Arc<dyn MessageChannel>, store: Arc<dyn ResponseStore>) -> Self {
        Self { channel, store }
    }

    /// Runs one consumer per agent kind until `shutdown` fires or the channel
    /// closes. Returns the number of responses stored.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<u64, ChannelError> {
        let shutdown = shutdown.child_token();
        let mut consumers = JoinSet::new();
        for kind in AgentKind::all() {
            let queue = kind.responses_queue();
            self.channel.declare(&queue, true).await?;
            let consumer = self.channel.consume(&queue).await?;
            let store = self.store.clone();
            let shutdown = shutdown.clone();
            info!(target: "gateway::responses", %queue, "Collecting responses");
            consumers.spawn(collect_queue(consumer, store, shutdown));
        }

        let mut stored = 0;
        let mut failure = None;
        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok(Ok(count)) => stored += count,
                Ok(Err(err)) => {
                    // One queue failing takes the others down with it.
                    shutdown.cancel();
                    failure.get_or_insert(err);
                }
                Err(join_err) => {
                    shutdown.cancel();
                    failure.get_or_insert(ChannelError::storage(format!(
                        "Response consumer task failed: {join_err}"
                    )));
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(stored),
        }
    }
}

async fn collect_queue(
    mut consumer: Box<dyn Consumer>,
    store: Arc<dyn ResponseStore>,
    shutdown: CancellationToken,
) -> Result<u64, ChannelError> {
    let mut stored = 0;
    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = consumer.next() => next,
        };
        let Some(delivery) = next else {
            break;
        };
        if collect_one(delivery?, store.as_ref()).await? {
            stored += 1;
        }
    }
    Ok(stored)
}

/// Stores one response and acknowledges it. Returns whether it was stored.
pub async fn collect_one(delivery: Delivery, store: &dyn ResponseStore) -> Result<bool, ChannelError> {
    let Delivery {
        queue,
        body,
        properties,
        acker,
        ..
    } = delivery;

    let response = match ResponseEnvelope::decode(&body) {
        Ok(response) => response,
        Err(err) => {
            warn!(target: "gateway::responses", %queue, error = %err, "Dropping undecodable response");
            acker.ack().await?;
            return Ok(false);
        }
    };

    let request_id = response.request_id.clone();
    let completion = match store.complete(response, properties.correlation_id.clone()).await {
        Ok(completion) => completion,
        Err(err) => {
            warn!(target: "gateway::responses", %request_id, error = %err, "Response store failed");
            acker.reject(true).await?;
            return Err(ChannelError::storage(err.to_string()));
        }
    };

    match completion {
        Completion::Stored => {
            debug!(target: "gateway::responses", %request_id, "Response stored");
        }
        Completion::Duplicate => {
            debug!(target: "gateway::responses", %request_id, "Duplicate response ignored");
        }
        Completion::Unsolicited => {
            warn!(target: "gateway::responses", %request_id, "Response for unknown request stored");
        }
        Completion::CorrelationMismatch => {
            warn!(
                target: "gateway::responses",
                %request_id,
                correlation_id = ?properties.correlation_id,
                "Correlation id does not match submitted request"
            );
        }
    }
    acker.ack().await?;
    Ok(completion != Completion::Duplicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResponseStatus;

    #[tokio::test]
    async fn lookup_moves_from_pending_to_completed() {
        let store = InMemoryResponseStore::new();
        let request_id = RequestId::from_string("r-1");
        let correlation = CorrelationId::from_string("c-1");

        assert_eq!(store.lookup(&request_id).await.unwrap(), LookupResult::NotFound);
        store
            .record_pending(&request_id, &correlation, AgentKind::Billing)
            .await
            .unwrap();
        assert_eq!(store.lookup(&request_id).await.unwrap(), LookupResult::Pending);
        assert_eq!(store.lookup(&request_id).await.unwrap(), LookupResult::Pending);

        let completion = store
            .complete(
                ResponseEnvelope::success(request_id.clone()),
                Some(correlation.clone()),
            )
            .await
            .unwrap();
        assert_eq!(completion, Completion::Stored);

        let LookupResult::Completed(stored) = store.lookup(&request_id).await.unwrap() else {
            panic!("expected a completed response");
        };
        assert_eq!(stored.response.status, ResponseStatus::Success);
        assert_eq!(stored.correlation_id, Some(correlation));
    }

    #[tokio::test]
    async fn first_response_wins() {
        let store = InMemoryResponseStore::new();
        let request_id = RequestId::from_string("r-1");
        store
            .complete(ResponseEnvelope::pending(request_id.clone()), None)
            .await
            .unwrap();
        let second = store
            .complete(ResponseEnvelope::success(request_id.clone()), None)
            .await
            .unwrap();

        assert_eq!(second, Completion::Duplicate);
        let LookupResult::Completed(stored) = store.lookup(&request_id).await.unwrap() else {
            panic!("expected a completed response");
        };
        assert_eq!(stored.response.status, ResponseStatus::Pending);
    }

    #[tokio::test]
    async fn mismatched_correlation_is_flagged_but_kept() {
        let store = InMemoryResponseStore::new();
        let request_id = RequestId::from_string("r-1");
        store
            .record_pending(&request_id, &CorrelationId::from_string("a"), AgentKind::International)
            .await
            .unwrap();
        let completion = store
            .complete(
                ResponseEnvelope::success(request_id.clone()),
                Some(CorrelationId::from_string("b")),
            )
            .await
            .unwrap();
        assert_eq!(completion, Completion::CorrelationMismatch);
        assert!(matches!(
            store.lookup(&request_id).await.unwrap(),
            LookupResult::Completed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = InMemoryResponseStore::with_ttl(Duration::from_secs(60));
        let answered = RequestId::from_string("answered");
        let abandoned = RequestId::from_string("abandoned");
        let correlation = CorrelationId::from_string("c");
        store
            .record_pending(&abandoned, &correlation, AgentKind::Billing)
            .await
            .unwrap();
        store
            .complete(ResponseEnvelope::success(answered.clone()), None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.lookup(&abandoned).await.unwrap(), LookupResult::Pending);
        assert!(matches!(
            store.lookup(&answered).await.unwrap(),
            LookupResult::Completed(_)
        ));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.lookup(&answered).await.unwrap(), LookupResult::NotFound);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_entries_nobody_looks_up() {
        let store = InMemoryResponseStore::with_ttl(Duration::from_secs(60));
        for n in 0..10 {
            store
                .complete(ResponseEnvelope::success(RequestId::from_string(format!("u-{n}"))), None)
                .await
                .unwrap();
        }
        assert_eq!(store.len().unwrap(), 10);

        tokio::time::advance(Duration::from_secs(61)).await;
        store
            .complete(ResponseEnvelope::success(RequestId::from_string("fresh")), None)
            .await
            .unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_response_does_not_block_a_new_one() {
        let store = InMemoryResponseStore::with_ttl(Duration::from_secs(60));
        let request_id = RequestId::from_string("r-1");
        store
            .complete(ResponseEnvelope::pending(request_id.clone()), None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let completion = store
            .complete(ResponseEnvelope::success(request_id.clone()), None)
            .await
            .unwrap();
        assert_eq!(completion, Completion::Unsolicited);
    }

    #[tokio::test]
    async fn discard_only_drops_pending_entries() {
        let store = InMemoryResponseStore::new();
        let pending = RequestId::from_string("p");
        let done = RequestId::from_string("d");
        let correlation = CorrelationId::from_string("c");
        store
            .record_pending(&pending, &correlation, AgentKind::Billing)
            .await
            .unwrap();
        store
            .complete(ResponseEnvelope::success(done.clone()), None)
            .await
            .unwrap();

        store.discard(&pending).await.unwrap();
        store.discard(&done).await.unwrap();

        assert_eq!(store.lookup(&pending).await.unwrap(), LookupResult::NotFound);
        assert!(matches!(
            store.lookup(&done).await.unwrap(),
            LookupResult::Completed(_)
        ));
    }
}
