//! Session repository.
//!
//! The orchestrator only depends on the [`SessionStore`] trait. Two
//! implementations ship with the crate: an in-memory map for tests and the
//! `run` command, and a SQLite store for the server.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::RwLock;

use super::{Session, normalize_domain};
use crate::errors::StoreError;

/// Durable session state, owned outside the orchestrator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the session for (user, domain), creating it on first request.
    async fn get_or_create_session(&self, user_id: &str, domain: &str)
    -> Result<Session, StoreError>;

    /// Load a session owned by `user_id`. Sessions owned by someone else are
    /// reported as not found.
    async fn get_session(&self, session_id: &str, user_id: &str) -> Result<Session, StoreError>;

    async fn save(&self, session: &Session) -> Result<(), StoreError>;
}

fn owned_by(session: Session, user_id: &str) -> Result<Session, StoreError> {
    if session.user_id == user_id {
        Ok(session)
    } else {
        Err(StoreError::NotFound {
            session_id: session.id,
        })
    }
}

/// In-process session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_or_create_session(
        &self,
        user_id: &str,
        domain: &str,
    ) -> Result<Session, StoreError> {
        let domain = normalize_domain(domain).map_err(|e| StoreError::InvalidInput(e.to_string()))?;
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions
            .values()
            .find(|s| s.user_id == user_id && s.domain == domain)
        {
            return Ok(existing.clone());
        }
        let session = Session::new(user_id, &domain);
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str, user_id: &str) -> Result<Session, StoreError> {
        let session = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                session_id: session_id.to_string(),
            })?;
        owned_by(session, user_id)
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }
}

/// SQLite-backed session store.
///
/// Sessions are stored as JSON documents keyed by id, with a unique
/// (user_id, domain) index. All access runs on tokio's blocking pool so
/// synchronous SQLite I/O never ties up async worker threads.
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// Open (or create) a database at `path` and run migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open session database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                 id TEXT PRIMARY KEY,
                 user_id TEXT NOT NULL,
                 domain TEXT NOT NULL,
                 body TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 UNIQUE(user_id, domain)
             );",
        )
        .context("Failed to run session migrations")?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Persistence(anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Persistence(anyhow!("DB task panicked: {}", e)))?
    }
}

fn decode(body: &str) -> Result<Session, StoreError> {
    serde_json::from_str(body)
        .context("Corrupt session document")
        .map_err(StoreError::Persistence)
}

fn write_session(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let body = serde_json::to_string(session)
        .context("Failed to encode session")
        .map_err(StoreError::Persistence)?;
    conn.execute(
        "INSERT INTO sessions (id, user_id, domain, body, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        params![
            session.id,
            session.user_id,
            session.domain,
            body,
            session.updated_at.to_rfc3339()
        ],
    )
    .context("Failed to write session")
    .map_err(StoreError::Persistence)?;
    Ok(())
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_or_create_session(
        &self,
        user_id: &str,
        domain: &str,
    ) -> Result<Session, StoreError> {
        let domain = normalize_domain(domain).map_err(|e| StoreError::InvalidInput(e.to_string()))?;
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT body FROM sessions WHERE user_id = ?1 AND domain = ?2",
                    params![user_id, domain],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to query sessions")
                .map_err(StoreError::Persistence)?;
            if let Some(body) = existing {
                return decode(&body);
            }
            let session = Session::new(&user_id, &domain);
            write_session(conn, &session)?;
            Ok(session)
        })
        .await
    }

    async fn get_session(&self, session_id: &str, user_id: &str) -> Result<Session, StoreError> {
        let id = session_id.to_string();
        let session = self
            .call(move |conn| {
                let body: Option<String> = conn
                    .query_row(
                        "SELECT body FROM sessions WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("Failed to query sessions")
                    .map_err(StoreError::Persistence)?;
                match body {
                    Some(body) => decode(&body),
                    None => Err(StoreError::NotFound { session_id: id }),
                }
            })
            .await?;
        owned_by(session, user_id)
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let session = session.clone();
        self.call(move |conn| write_session(conn, &session)).await
    }
}
