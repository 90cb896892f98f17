use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    Row,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{
    AckHandle, Acker, ChannelError, Consumer, Delivery, MessageChannel, MessageProperties,
    Settlement,
};
use crate::types::CorrelationId;

#[derive(Debug, Clone)]
pub struct SqliteBrokerOptions {
    pub path: PathBuf,
    /// How often an idle consumer checks for work published by other processes.
    pub poll_interval: Duration,
    /// How long a delivery stays leased before it becomes deliverable again.
    pub visibility_timeout: Duration,
}

impl SqliteBrokerOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

struct SqliteInner {
    pool: SqlitePool,
    poll_interval: Duration,
    visibility_timeout: Duration,
    wakers: Mutex<HashMap<String, Arc<Notify>>>,
    closed: CancellationToken,
}

impl SqliteInner {
    fn waker(&self, queue: &str) -> Arc<Notify> {
        match self.wakers.lock() {
            Ok(mut wakers) => wakers.entry(queue.to_string()).or_default().clone(),
            // Polling still finds the work; only the early wake-up is lost.
            Err(_) => Arc::new(Notify::new()),
        }
    }

    async fn queue_durability(&self, queue: &str) -> Result<Option<bool>, ChannelError> {
        let row = sqlx::query("SELECT durable FROM broker_queues WHERE name = ?1")
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ChannelError::storage(format!("Failed to look up queue: {e}")))?;
        Ok(row.map(|row| row.get::<bool, _>("durable")))
    }

    async fn claim(&self, queue: &str) -> Result<Option<ClaimedMessage>, ChannelError> {
        let now = Utc::now().timestamp_millis();
        let lease_millis = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let token = Uuid::new_v4().to_string();

        let row = sqlx::query(
            r#"
            UPDATE broker_messages
            SET leased_until = ?2, lease_token = ?3, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM broker_messages
                WHERE queue = ?1 AND (leased_until IS NULL OR leased_until < ?4)
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, body, persistent, correlation_id, reply_to, delivery_count
            "#,
        )
        .bind(queue)
        .bind(now.saturating_add(lease_millis))
        .bind(&token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ChannelError::storage(format!("Failed to claim message: {e}")))?;

        Ok(row.map(|row| ClaimedMessage {
            id: row.get("id"),
            body: row.get("body"),
            properties: MessageProperties {
                persistent: row.get("persistent"),
                correlation_id: row
                    .get::<Option<String>, _>("correlation_id")
                    .map(CorrelationId::from_string),
                reply_to: row.get("reply_to"),
            },
            delivery_count: row.get("delivery_count"),
            lease_token: token,
        }))
    }
}

struct ClaimedMessage {
    id: i64,
    body: Vec<u8>,
    properties: MessageProperties,
    delivery_count: i64,
    lease_token: String,
}

/// Broker backed by a SQLite file.
///
/// Several processes may open the same file; each claim leases one message
/// atomically, so competing consumers never share a delivery. A lease that
/// is neither acknowledged nor rejected within the visibility timeout
/// expires and the message is delivered again.
///
/// Everything written to the file is durable. A queue's `durable` flag only
/// guards against redeclaring it the other way, and a message's `persistent`
/// flag is carried through to its deliveries. Opening the file cannot tell a
/// broker restart from another process joining, so transient queues and
/// messages survive a reopen here, unlike [`InMemoryBroker::restart`].
///
/// [`InMemoryBroker::restart`]: super::InMemoryBroker::restart
#[derive(Clone)]
pub struct SqliteBroker {
    inner: Arc<SqliteInner>,
}

impl SqliteBroker {
    pub async fn open(options: &SqliteBrokerOptions) -> Result<Self, ChannelError> {
        let path: &Path = &options.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ChannelError::connection(format!("Failed to create directory: {e}"))
            })?;
        }

        let connect = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| ChannelError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect)
            .await
            .map_err(|e| ChannelError::connection(format!("Failed to connect to SQLite: {e}")))?;

        Self::with_pool(pool, options).await
    }

    /// Private broker on an in-memory database. Nothing survives the process.
    pub async fn open_in_memory() -> Result<Self, ChannelError> {
        let connect = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ChannelError::connection(format!("Invalid SQLite path: {e}")))?;

        // A single connection that is never recycled keeps the database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await
            .map_err(|e| ChannelError::connection(format!("Failed to connect to SQLite: {e}")))?;

        Self::with_pool(pool, &SqliteBrokerOptions::new(":memory:")).await
    }

    async fn with_pool(pool: SqlitePool, options: &SqliteBrokerOptions) -> Result<Self, ChannelError> {
        let broker = Self {
            inner: Arc::new(SqliteInner {
                pool,
                poll_interval: options.poll_interval,
                visibility_timeout: options.visibility_timeout,
                wakers: Mutex::new(HashMap::new()),
                closed: CancellationToken::new(),
            }),
        };
        broker.run_migrations().await?;
        Ok(broker)
    }

    async fn run_migrations(&self) -> Result<(), ChannelError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broker_queues (
                name TEXT PRIMARY KEY,
                durable INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.inner.pool)
        .await
        .map_err(|e| ChannelError::storage(format!("Failed to create queues table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broker_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                body BLOB NOT NULL,
                persistent INTEGER NOT NULL,
                correlation_id TEXT,
                reply_to TEXT,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                leased_until INTEGER,
                lease_token TEXT,
                published_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.inner.pool)
        .await
        .map_err(|e| ChannelError::storage(format!("Failed to create messages table: {e}")))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_broker_messages_queue
            ON broker_messages(queue, id)
            "#,
        )
        .execute(&self.inner.pool)
        .await
        .map_err(|e| ChannelError::storage(format!("Failed to create index: {e}")))?;

        Ok(())
    }

    /// Number of messages on `queue`, leased or not.
    pub async fn depth(&self, queue: &str) -> Result<u64, ChannelError> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM broker_messages WHERE queue = ?1")
            .bind(queue)
            .fetch_one(&self.inner.pool)
            .await
            .map_err(|e| ChannelError::storage(format!("Failed to count messages: {e}")))?;
        Ok(u64::try_from(row.get::<i64, _>("depth")).unwrap_or(0))
    }
}

#[async_trait]
impl MessageChannel for SqliteBroker {
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), ChannelError> {
        if self.inner.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        match self.inner.queue_durability(queue).await? {
            Some(existing) if existing != durable => Err(ChannelError::DeclareMismatch {
                queue: queue.to_string(),
                durable: existing,
            }),
            Some(_) => Ok(()),
            None => {
                sqlx::query("INSERT OR IGNORE INTO broker_queues (name, durable) VALUES (?1, ?2)")
                    .bind(queue)
                    .bind(durable)
                    .execute(&self.inner.pool)
                    .await
                    .map_err(|e| ChannelError::storage(format!("Failed to declare queue: {e}")))?;
                debug!(target: "channel::sqlite", queue, durable, "Queue declared");
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
        if self.inner.queue_durability(queue).await?.is_none() {
            return Err(ChannelError::QueueNotDeclared {
                queue: queue.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO broker_messages (queue, body, persistent, correlation_id, reply_to)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(queue)
        .bind(body)
        .bind(properties.persistent)
        .bind(properties.correlation_id.as_ref().map(CorrelationId::as_str))
        .bind(properties.reply_to.as_deref())
        .execute(&self.inner.pool)
        .await
        .map_err(|e| ChannelError::storage(format!("Failed to publish message: {e}")))?;

        self.inner.waker(queue).notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, ChannelError> {
        if self.inner.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        if self.inner.queue_durability(queue).await?.is_none() {
            return Err(ChannelError::QueueNotDeclared {
                queue: queue.to_string(),
            });
        }
        Ok(Box::new(SqliteConsumer {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            waker: self.inner.waker(queue),
        }))
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.inner.closed.cancel();
        self.inner.pool.close().await;
        Ok(())
    }
}

struct SqliteConsumer {
    inner: Arc<SqliteInner>,
    queue: String,
    waker: Arc<Notify>,
}

#[async_trait]
impl Consumer for SqliteConsumer {
    async fn next(&mut self) -> Option<Result<Delivery, ChannelError>> {
        loop {
            if self.inner.closed.is_cancelled() {
                return None;
            }
            match self.inner.claim(&self.queue).await {
                Ok(Some(message)) => {
                    return Some(Ok(Delivery {
                        delivery_tag: u64::try_from(message.id).unwrap_or_default(),
                        queue: self.queue.clone(),
                        body: message.body,
                        properties: message.properties,
                        redelivered: message.delivery_count > 1,
                        acker: Acker::new(SqliteAck {
                            inner: self.inner.clone(),
                            queue: self.queue.clone(),
                            id: message.id,
                            lease_token: message.lease_token,
                        }),
                    }));
                }
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
            tokio::select! {
                () = self.waker.notified() => {}
                () = tokio::time::sleep(self.inner.poll_interval) => {}
                () = self.inner.closed.cancelled() => return None,
            }
        }
    }
}

struct SqliteAck {
    inner: Arc<SqliteInner>,
    queue: String,
    id: i64,
    lease_token: String,
}

#[async_trait]
impl AckHandle for SqliteAck {
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<(), ChannelError> {
        let query = match settlement {
            Settlement::Ack | Settlement::Reject { requeue: false } => {
                "DELETE FROM broker_messages WHERE id = ?1 AND lease_token = ?2"
            }
            Settlement::Reject { requeue: true } => {
                r#"
                UPDATE broker_messages SET leased_until = NULL, lease_token = NULL
                WHERE id = ?1 AND lease_token = ?2
                "#
            }
        };

        let result = sqlx::query(query)
            .bind(self.id)
            .bind(&self.lease_token)
            .execute(&self.inner.pool)
            .await
            .map_err(|e| ChannelError::storage(format!("Failed to settle delivery: {e}")))?;

        if result.rows_affected() == 0 {
            // The lease expired and another consumer may own the message now.
            return Err(ChannelError::UnknownDelivery {
                delivery_tag: u64::try_from(self.id).unwrap_or_default(),
            });
        }
        if settlement == (Settlement::Reject { requeue: true }) {
            self.inner.waker(&self.queue).notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn file_broker(dir: &TempDir, visibility: Duration) -> SqliteBroker {
        let mut options = SqliteBrokerOptions::new(dir.path().join("broker.db"));
        options.poll_interval = Duration::from_millis(10);
        options.visibility_timeout = visibility;
        SqliteBroker::open(&options).await.unwrap()
    }

    #[tokio::test]
    async fn publish_consume_ack() {
        let broker = SqliteBroker::open_in_memory().await.unwrap();
        broker.declare("q", true).await.unwrap();
        broker.declare("q", true).await.unwrap();

        let props = MessageProperties::persistent()
            .with_correlation_id(CorrelationId::from_string("c-9"))
            .with_reply_to("billing_responses");
        broker
            .publish("q", b"payload".to_vec(), props.clone())
            .await
            .unwrap();

        let mut consumer = broker.consume("q").await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"payload");
        assert_eq!(delivery.properties, props);
        assert!(!delivery.redelivered);

        delivery.acker.ack().await.unwrap();
        assert_eq!(broker.depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn declare_mismatch_and_undeclared_publish() {
        let broker = SqliteBroker::open_in_memory().await.unwrap();
        broker.declare("q", true).await.unwrap();
        assert!(matches!(
            broker.declare("q", false).await.unwrap_err(),
            ChannelError::DeclareMismatch { durable: true, .. }
        ));
        assert!(matches!(
            broker
                .publish("nope", vec![], MessageProperties::persistent())
                .await
                .unwrap_err(),
            ChannelError::QueueNotDeclared { .. }
        ));
    }

    #[tokio::test]
    async fn requeue_then_discard() {
        let broker = SqliteBroker::open_in_memory().await.unwrap();
        broker.declare("q", true).await.unwrap();
        broker
            .publish("q", b"m".to_vec(), MessageProperties::persistent())
            .await
            .unwrap();
        let mut consumer = broker.consume("q").await.unwrap();

        consumer
            .next()
            .await
            .unwrap()
            .unwrap()
            .acker
            .reject(true)
            .await
            .unwrap();

        let again = consumer.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        again.acker.reject(false).await.unwrap();
        assert_eq!(broker.depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn messages_survive_reopen_and_expired_leases_redeliver() {
        let dir = TempDir::new().unwrap();
        {
            let broker = file_broker(&dir, Duration::from_millis(50)).await;
            broker.declare("q", true).await.unwrap();
            broker
                .publish("q", b"first".to_vec(), MessageProperties::persistent())
                .await
                .unwrap();
            let mut consumer = broker.consume("q").await.unwrap();
            let delivery = consumer.next().await.unwrap().unwrap();
            assert_eq!(delivery.body, b"first");
            // Leave it unsettled and go away.
            drop(delivery);
            broker.close().await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        let broker = file_broker(&dir, Duration::from_secs(30)).await;
        let mut consumer = broker.consume("q").await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"first");
        assert!(delivery.redelivered);
        delivery.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn transient_queues_and_messages_are_kept_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let broker = file_broker(&dir, Duration::from_secs(30)).await;
            broker.declare("scratch", false).await.unwrap();
            broker
                .publish("scratch", b"transient".to_vec(), MessageProperties::transient())
                .await
                .unwrap();
            broker.close().await.unwrap();
        }

        let broker = file_broker(&dir, Duration::from_secs(30)).await;
        assert!(matches!(
            broker.declare("scratch", true).await,
            Err(ChannelError::DeclareMismatch { durable: false, .. })
        ));
        assert_eq!(broker.depth("scratch").await.unwrap(), 1);
        let mut consumer = broker.consume("scratch").await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"transient");
        assert!(!delivery.properties.persistent);
        delivery.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn stale_lease_cannot_be_acked() {
        let dir = TempDir::new().unwrap();
        let broker = file_broker(&dir, Duration::from_millis(20)).await;
        broker.declare("q", true).await.unwrap();
        broker
            .publish("q", b"m".to_vec(), MessageProperties::persistent())
            .await
            .unwrap();

        let mut first = broker.consume("q").await.unwrap();
        let mut second = broker.consume("q").await.unwrap();
        let stale = first.next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = second.next().await.unwrap().unwrap();

        assert!(matches!(
            stale.acker.ack().await.unwrap_err(),
            ChannelError::UnknownDelivery { .. }
        ));
        fresh.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn consumer_is_woken_by_local_publish() {
        let broker = SqliteBroker::open_in_memory().await.unwrap();
        broker.declare("q", true).await.unwrap();
        let mut consumer = broker.consume("q").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("q", b"x".to_vec(), MessageProperties::persistent())
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"x");
    }
}
