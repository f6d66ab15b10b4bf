//! Durable store shared by the controller and gateway planes.
//!
//! Two tables: `sessions` (session lifecycle rows) and `jti` (single-use
//! token records). The controller owns all inserts; the gateway owns token
//! consumption and session reads. Both tables are pruned by expiry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Runtime};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::StoreError;

/// One admitted job request with its lifecycle record.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub session_id: Uuid,
    pub owner_id: String,
    pub worker_name: String,
    /// Set exactly once when the orchestrator assigns the worker an address.
    pub worker_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRow {
    /// A session is routable iff its endpoint is known and it has not expired.
    pub fn is_routable(&self, now: DateTime<Utc>) -> bool {
        self.worker_endpoint.is_some() && now < self.expires_at
    }

    /// Reported lifecycle status, derived from endpoint presence.
    pub fn status(&self) -> &'static str {
        if self.worker_endpoint.is_some() {
            "ready"
        } else {
            "pending"
        }
    }
}

/// Durable single-use token record.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub session_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Store operations. Each is atomic; ordering guarantees hold per session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a session row. Fails with `Duplicate` on an existing
    /// session id or worker name.
    async fn put_session(&self, row: &SessionRow) -> Result<(), StoreError>;

    /// One-shot endpoint set. Fails with `Conflict` if the endpoint is
    /// already set, `Absent` if the session does not exist.
    async fn update_session_endpoint(
        &self,
        session_id: Uuid,
        endpoint: &str,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: Uuid) -> Result<SessionRow, StoreError>;

    /// Insert a token record. Fails with `Duplicate` on an existing id.
    async fn put_token(&self, row: &TokenRow) -> Result<(), StoreError>;

    /// Atomically delete the token record and return its session id.
    /// At most one caller ever succeeds per token id; later callers get
    /// `Absent`.
    async fn consume_token(&self, token_id: Uuid) -> Result<Uuid, StoreError>;

    /// Delete all rows expiring before `before` from both tables.
    /// Idempotent; returns `(sessions, tokens)` removed.
    async fn prune_expired(&self, before: DateTime<Utc>) -> Result<(u64, u64), StoreError>;

    /// Cheap liveness probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Drain the connection pool. Safe to call more than once; only the
    /// first call does anything.
    async fn close(&self);
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id      UUID PRIMARY KEY,
    owner_id        TEXT NOT NULL,
    worker_name     TEXT NOT NULL UNIQUE,
    worker_endpoint TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    expires_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS sessions_expires_at_idx ON sessions (expires_at);

CREATE TABLE IF NOT EXISTS jti (
    token_id   UUID PRIMARY KEY,
    session_id UUID NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS jti_expires_at_idx ON jti (expires_at);
"#;

/// PostgreSQL store.
pub struct PgStore {
    pool: Pool,
    op_timeout: Duration,
    closed: AtomicBool,
}

impl PgStore {
    /// Create the pool, verify connectivity, and apply the schema.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(config.url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_max,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        let store = Self {
            pool,
            op_timeout: Duration::from_secs(config.op_timeout_secs),
            closed: AtomicBool::new(false),
        };

        let conn = store.conn().await?;
        store
            .bounded(conn.batch_execute(SCHEMA))
            .await
            .map_err(|e| StoreError::Query(format!("schema setup failed: {e}")))?;

        Ok(store)
    }

    /// Get a pooled connection. Transient acquisition failures are retried
    /// at most twice; query failures are never retried (an insert that
    /// half-ran is not safely repeatable).
    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let mut last = StoreError::Timeout;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * attempt)).await;
            }
            match tokio::time::timeout(self.op_timeout, self.pool.get()).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => last = e.into(),
                Err(_) => last = StoreError::Timeout,
            }
            if !last.is_transient() {
                break;
            }
        }
        Err(last)
    }

    /// Run a query future under the per-operation timeout.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, tokio_postgres::Error>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn put_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        self.bounded(conn.execute(
            "INSERT INTO sessions \
             (session_id, owner_id, worker_name, worker_endpoint, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &row.session_id,
                &row.owner_id,
                &row.worker_name,
                &row.worker_endpoint,
                &row.created_at,
                &row.expires_at,
            ],
        ))
        .await?;
        Ok(())
    }

    async fn update_session_endpoint(
        &self,
        session_id: Uuid,
        endpoint: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let updated = self
            .bounded(conn.execute(
                "UPDATE sessions SET worker_endpoint = $2 \
                 WHERE session_id = $1 AND worker_endpoint IS NULL",
                &[&session_id, &endpoint],
            ))
            .await?;
        if updated == 1 {
            return Ok(());
        }
        // Nothing updated: distinguish a missing row from an already-set one.
        let exists = self
            .bounded(conn.query_opt(
                "SELECT 1 FROM sessions WHERE session_id = $1",
                &[&session_id],
            ))
            .await?;
        match exists {
            Some(_) => Err(StoreError::Conflict),
            None => Err(StoreError::Absent),
        }
    }

    async fn get_session(&self, session_id: Uuid) -> Result<SessionRow, StoreError> {
        let conn = self.conn().await?;
        let row = self
            .bounded(conn.query_opt(
                "SELECT session_id, owner_id, worker_name, worker_endpoint, \
                 created_at, expires_at FROM sessions WHERE session_id = $1",
                &[&session_id],
            ))
            .await?
            .ok_or(StoreError::Absent)?;
        Ok(SessionRow {
            session_id: row.get(0),
            owner_id: row.get(1),
            worker_name: row.get(2),
            worker_endpoint: row.get(3),
            created_at: row.get(4),
            expires_at: row.get(5),
        })
    }

    async fn put_token(&self, row: &TokenRow) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        self.bounded(conn.execute(
            "INSERT INTO jti (token_id, session_id, expires_at) VALUES ($1, $2, $3)",
            &[&row.token_id, &row.session_id, &row.expires_at],
        ))
        .await?;
        Ok(())
    }

    async fn consume_token(&self, token_id: Uuid) -> Result<Uuid, StoreError> {
        let conn = self.conn().await?;
        // Single-statement delete-returning: of any number of concurrent
        // consumers, exactly one sees the row.
        let row = self
            .bounded(conn.query_opt(
                "DELETE FROM jti WHERE token_id = $1 RETURNING session_id",
                &[&token_id],
            ))
            .await?
            .ok_or(StoreError::Absent)?;
        Ok(row.get(0))
    }

    async fn prune_expired(&self, before: DateTime<Utc>) -> Result<(u64, u64), StoreError> {
        let conn = self.conn().await?;
        let sessions = self
            .bounded(conn.execute("DELETE FROM sessions WHERE expires_at < $1", &[&before]))
            .await?;
        let tokens = self
            .bounded(conn.execute("DELETE FROM jti WHERE expires_at < $1", &[&before]))
            .await?;
        Ok((sessions, tokens))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        self.bounded(conn.execute("SELECT 1", &[])).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("store close called again, ignoring");
            return;
        }
        self.pool.close();
        tracing::info!("store pool closed");
    }
}

/// In-memory store with the same semantics as [`PgStore`].
///
/// Used by tests and by single-replica development runs (`store.url` empty).
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
    closed: AtomicBool,
}

#[derive(Default)]
struct MemInner {
    sessions: HashMap<Uuid, SessionRow>,
    tokens: HashMap<Uuid, TokenRow>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemStore {
    async fn put_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let mut inner = self.lock();
        if inner.sessions.contains_key(&row.session_id)
            || inner
                .sessions
                .values()
                .any(|s| s.worker_name == row.worker_name)
        {
            return Err(StoreError::Duplicate);
        }
        inner.sessions.insert(row.session_id, row.clone());
        Ok(())
    }

    async fn update_session_endpoint(
        &self,
        session_id: Uuid,
        endpoint: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let row = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(StoreError::Absent)?;
        if row.worker_endpoint.is_some() {
            return Err(StoreError::Conflict);
        }
        row.worker_endpoint = Some(endpoint.to_string());
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<SessionRow, StoreError> {
        self.lock()
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or(StoreError::Absent)
    }

    async fn put_token(&self, row: &TokenRow) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.tokens.contains_key(&row.token_id) {
            return Err(StoreError::Duplicate);
        }
        inner.tokens.insert(row.token_id, row.clone());
        Ok(())
    }

    async fn consume_token(&self, token_id: Uuid) -> Result<Uuid, StoreError> {
        self.lock()
            .tokens
            .remove(&token_id)
            .map(|t| t.session_id)
            .ok_or(StoreError::Absent)
    }

    async fn prune_expired(&self, before: DateTime<Utc>) -> Result<(u64, u64), StoreError> {
        let mut inner = self.lock();
        let sessions_before = inner.sessions.len();
        let tokens_before = inner.tokens.len();
        inner.sessions.retain(|_, s| s.expires_at >= before);
        inner.tokens.retain(|_, t| t.expires_at >= before);
        Ok((
            (sessions_before - inner.sessions.len()) as u64,
            (tokens_before - inner.tokens.len()) as u64,
        ))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.swap(true, Ordering::SeqCst);
    }
}

/// Connect to the configured store, retrying up to the startup budget.
/// An empty URL selects the in-memory store.
pub async fn connect(config: &StoreConfig) -> Result<std::sync::Arc<dyn SessionStore>, StoreError> {
    if config.url.is_empty() {
        tracing::warn!("store.url is empty — using the in-memory store (single replica only)");
        return Ok(std::sync::Arc::new(MemStore::new()));
    }

    let mut last = StoreError::Pool("no connection attempt made".to_string());
    for attempt in 1..=config.connect_retries.max(1) {
        match PgStore::connect(config).await {
            Ok(store) => {
                tracing::info!(attempt, "connected to store");
                return Ok(std::sync::Arc::new(store));
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "store connection failed");
                last = e;
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    Err(last)
}
