use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use super::{DEFAULT_SESSION_TTL, SessionRecord, SessionStore, SessionStoreError};
use crate::types::SessionId;

struct Entry {
    record: SessionRecord,
    expires_at: Instant,
}

/// Session store held in process memory. Expiry follows the tokio clock.
pub struct InMemorySessionStore {
    ttl: Duration,
    entries: RwLock<HashMap<SessionId, Entry>>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drops every expired record and returns how many went.
    pub fn purge_expired(&self) -> Result<usize, SessionStoreError> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|e| SessionStoreError::lock_poisoned(e.to_string()))?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, SessionStoreError> {
        let now = Instant::now();
        {
            let entries = self
                .entries
                .read()
                .map_err(|e| SessionStoreError::lock_poisoned(e.to_string()))?;
            match entries.get(session_id) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.record.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|e| SessionStoreError::lock_poisoned(e.to_string()))?;
        if entries
            .get(session_id)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            entries.remove(session_id);
        }
        Ok(None)
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| SessionStoreError::lock_poisoned(e.to_string()))?;
        entries.insert(
            record.session_id.clone(),
            Entry {
                record: record.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn update_active(
        &self,
        session_id: &SessionId,
        apply: &(dyn for<'r> Fn(&'r mut SessionRecord) + Send + Sync),
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|e| SessionStoreError::lock_poisoned(e.to_string()))?;
        let Some(entry) = entries
            .get_mut(session_id)
            .filter(|entry| entry.expires_at > now && entry.record.active)
        else {
            return Ok(None);
        };
        apply(&mut entry.record);
        entry.expires_at = now + self.ttl;
        Ok(Some(entry.record.clone()))
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool, SessionStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| SessionStoreError::lock_poisoned(e.to_string()))?;
        Ok(entries
            .remove(session_id)
            .is_some_and(|entry| entry.expires_at > Instant::now()))
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn records_expire_after_ttl() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let record = SessionRecord::new("cust-1", None);
        store.put(&record).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.get(&record.session_id).await.unwrap(), Some(record.clone()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get(&record.session_id).await.unwrap(), None);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn put_refreshes_ttl() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let record = SessionRecord::new("cust-1", None);
        store.put(&record).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        store.put(&record).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;

        assert!(store.get(&record.session_id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn update_active_skips_closed_and_expired_records() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let mut closed = SessionRecord::new("a", None);
        closed.active = false;
        let open = SessionRecord::new("b", None);
        store.put(&closed).await.unwrap();
        store.put(&open).await.unwrap();

        let reopen = |record: &mut SessionRecord| record.active = true;
        assert_eq!(store.update_active(&closed.session_id, &reopen).await.unwrap(), None);
        assert!(!store.get(&closed.session_id).await.unwrap().unwrap().active);

        tokio::time::advance(Duration::from_secs(45)).await;
        let rename = |record: &mut SessionRecord| record.user_id = Some("ops".to_string());
        let updated = store.update_active(&open.session_id, &rename).await.unwrap().unwrap();
        assert_eq!(updated.user_id.as_deref(), Some("ops"));

        // The update refreshed the TTL.
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(store.get(&open.session_id).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.update_active(&open.session_id, &rename).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_and_remove() {
        let store = InMemorySessionStore::new(Duration::from_secs(10));
        let stale = SessionRecord::new("a", None);
        let live = SessionRecord::new("b", None);
        store.put(&stale).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        store.put(&live).await.unwrap();

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(store.remove(&live.session_id).await.unwrap());
        assert!(!store.remove(&live.session_id).await.unwrap());
    }
}
