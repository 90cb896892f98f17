use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    Row,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{SessionRecord, SessionStore, SessionStoreError};

// Compare-and-swap attempts before `update_active` gives up under contention.
const MAX_UPDATE_ATTEMPTS: usize = 8;
use crate::types::SessionId;

/// Session store in a SQLite file, shareable between gateway processes.
pub struct SqliteSessionStore {
    pool: SqlitePool,
    ttl: Duration,
}

impl SqliteSessionStore {
    pub async fn new(path: &Path, ttl: Duration) -> Result<Self, SessionStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SessionStoreError::connection(format!("Failed to create directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| SessionStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                SessionStoreError::connection(format!("Failed to connect to SQLite: {e}"))
            })?;

        let store = Self { pool, ttl };
        store.run_migrations().await?;

        Ok(store)
    }

    pub async fn new_in_memory(ttl: Duration) -> Result<Self, SessionStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SessionStoreError::connection(format!("Invalid SQLite path: {e}")))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                SessionStoreError::connection(format!("Failed to connect to SQLite: {e}"))
            })?;

        let store = Self { pool, ttl };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), SessionStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gateway_sessions (
                session_id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            SessionStoreError::database(format!("Failed to create sessions table: {e}"))
        })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_gateway_sessions_expires
            ON gateway_sessions(expires_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionStoreError::database(format!("Failed to create index: {e}")))?;

        Ok(())
    }

    /// Deletes expired rows and returns how many went.
    pub async fn purge_expired(&self) -> Result<u64, SessionStoreError> {
        let result = sqlx::query("DELETE FROM gateway_sessions WHERE expires_at <= ?1")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| SessionStoreError::database(format!("Failed to purge sessions: {e}")))?;
        if result.rows_affected() > 0 {
            debug!(purged = result.rows_affected(), "Purged expired sessions");
        }
        Ok(result.rows_affected())
    }

    fn expires_at(&self) -> i64 {
        let ttl_millis = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(ttl_millis)
    }

    async fn load_raw(&self, session_id: &SessionId) -> Result<Option<String>, SessionStoreError> {
        let row = sqlx::query(
            "SELECT record FROM gateway_sessions WHERE session_id = ?1 AND expires_at > ?2",
        )
        .bind(session_id.as_str())
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SessionStoreError::database(format!("Failed to load session: {e}")))?;
        Ok(row.map(|row| row.get("record")))
    }
}

fn decode_record(raw: &str) -> Result<SessionRecord, SessionStoreError> {
    serde_json::from_str(raw).map_err(|e| {
        SessionStoreError::serialization(format!("Failed to deserialize session: {e}"))
    })
}

fn encode_record(record: &SessionRecord) -> Result<String, SessionStoreError> {
    serde_json::to_string(record).map_err(|e| {
        SessionStoreError::serialization(format!("Failed to serialize session: {e}"))
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, SessionStoreError> {
        self.load_raw(session_id)
            .await?
            .map(|raw| decode_record(&raw))
            .transpose()
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        let json = encode_record(record)?;
        let expires_at = self.expires_at();

        sqlx::query(
            r#"
            INSERT INTO gateway_sessions (session_id, record, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id) DO UPDATE SET
                record = excluded.record,
                expires_at = excluded.expires_at,
                updated_at = datetime('now')
            "#,
        )
        .bind(record.session_id.as_str())
        .bind(json)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionStoreError::database(format!("Failed to save session: {e}")))?;

        Ok(())
    }

    async fn update_active(
        &self,
        session_id: &SessionId,
        apply: &(dyn for<'r> Fn(&'r mut SessionRecord) + Send + Sync),
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        // Other processes may share the file, so the write only lands if the
        // row still holds exactly what was read.
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(raw) = self.load_raw(session_id).await? else {
                return Ok(None);
            };
            let mut record = decode_record(&raw)?;
            if !record.active {
                return Ok(None);
            }
            apply(&mut record);
            let json = encode_record(&record)?;

            let result = sqlx::query(
                r#"
                UPDATE gateway_sessions
                SET record = ?1, expires_at = ?2, updated_at = datetime('now')
                WHERE session_id = ?3 AND record = ?4 AND expires_at > ?5
                "#,
            )
            .bind(json)
            .bind(self.expires_at())
            .bind(session_id.as_str())
            .bind(raw)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| SessionStoreError::database(format!("Failed to update session: {e}")))?;

            if result.rows_affected() > 0 {
                return Ok(Some(record));
            }
            debug!(%session_id, "Session changed underneath update, retrying");
        }
        Err(SessionStoreError::database(format!(
            "Session {session_id} kept changing during update"
        )))
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool, SessionStoreError> {
        let result =
            sqlx::query("DELETE FROM gateway_sessions WHERE session_id = ?1 AND expires_at > ?2")
                .bind(session_id.as_str())
                .bind(Utc::now().timestamp_millis())
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    SessionStoreError::database(format!("Failed to delete session: {e}"))
                })?;
        Ok(result.rows_affected() > 0)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
