//! SQLite-backed user store and conversation log.
//!
//! One row per user, with embeddings and conversations in child tables.
//! Every mutation runs inside a `BEGIN IMMEDIATE` transaction, so a failed
//! write leaves no partial record behind.

use crate::codec::{decode_embedding, encode_embedding};
use chrono::{DateTime, SecondsFormat, Utc};
use medibot_core::{Conversation, Embedding, GalleryEntry, Message, UserRecord};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    user_id       TEXT PRIMARY KEY,
    seq           INTEGER NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    profile_image BLOB
);

CREATE TABLE IF NOT EXISTS embeddings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       TEXT NOT NULL REFERENCES users(user_id),
    dim           INTEGER NOT NULL,
    vector        BLOB NOT NULL,
    model_version TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id   TEXT NOT NULL REFERENCES users(user_id),
    timestamp TEXT NOT NULL,
    messages  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_user ON embeddings(user_id);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("user not found: {0}")]
    NotFound(String),
    #[error("user already exists: {0}")]
    AlreadyExists(String),
    #[error("conversation {index} not found for user {user_id} ({count} stored)")]
    IndexOutOfRange {
        user_id: String,
        index: usize,
        count: usize,
    },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the failure came from the storage layer itself (retryable)
    /// rather than from the request.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(_) | StoreError::Io(_) | StoreError::Json(_) | StoreError::Corrupt(_)
        )
    }
}

/// One line of the user listing.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub embeddings: usize,
    pub conversations: usize,
}

/// Persistent user records.
pub struct UserStore {
    conn: Connection,
}

impl UserStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "user store opened");
        Ok(Self { conn })
    }

    /// Fresh in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Create a user with a single enrolled embedding.
    pub fn register(
        &mut self,
        name: &str,
        embedding: &Embedding,
        profile_image: Option<&[u8]>,
    ) -> Result<UserRecord, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("name must not be empty".into()));
        }
        check_values(embedding)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_dimension(&tx, embedding.dim())?;
        let (seq, id) = next_user_id(&tx)?;
        let created_at = Utc::now();

        tx.execute(
            "INSERT INTO users (user_id, seq, name, created_at, profile_image)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, seq, name, format_ts(&created_at), profile_image],
        )?;
        insert_embedding(&tx, &id, embedding)?;
        tx.commit()?;

        tracing::info!(user_id = %id, name, dim = embedding.dim(), "registered user");

        Ok(UserRecord {
            id,
            name: name.to_string(),
            embeddings: vec![embedding.clone()],
            created_at,
            conversations: Vec::new(),
            profile_image: profile_image.map(<[u8]>::to_vec),
        })
    }

    /// Enroll another embedding for an existing user. Returns the new count.
    pub fn add_embedding(&mut self, user_id: &str, embedding: &Embedding) -> Result<usize, StoreError> {
        check_values(embedding)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_user(&tx, user_id)?;
        check_dimension(&tx, embedding.dim())?;
        insert_embedding(&tx, user_id, embedding)?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        tracing::info!(user_id, count, "enrolled additional embedding");
        Ok(count as usize)
    }

    /// Every enrolled embedding, ordered by registration then enrollment.
    pub fn gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT e.user_id, e.vector, e.model_version
             FROM embeddings e JOIN users u ON u.user_id = e.user_id
             ORDER BY u.seq, e.id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(user_id, blob, model_version)| -> Result<GalleryEntry, StoreError> {
                let values = decode_embedding(&blob)
                    .map_err(|e| StoreError::Corrupt(format!("user {user_id}: {e}")))?;
                Ok(GalleryEntry {
                    user_id,
                    embedding: Embedding {
                        values,
                        model_version,
                    },
                })
            })
            .collect()
    }

    pub fn contains(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(user_exists(&self.conn, user_id)?)
    }

    /// Load the full record for `user_id`.
    pub fn load(&self, user_id: &str) -> Result<UserRecord, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT name, created_at, profile_image FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                },
            )
            .optional()?;
        let (name, created_at, profile_image) =
            row.ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;

        Ok(UserRecord {
            id: user_id.to_string(),
            name,
            embeddings: self.embeddings_of(user_id)?,
            created_at: parse_ts(&created_at)?,
            conversations: self.conversations(user_id)?,
            profile_image,
        })
    }

    fn embeddings_of(&self, user_id: &str) -> Result<Vec<Embedding>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT vector, model_version FROM embeddings WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(blob, model_version)| -> Result<Embedding, StoreError> {
                let values = decode_embedding(&blob)
                    .map_err(|e| StoreError::Corrupt(format!("user {user_id}: {e}")))?;
                Ok(Embedding {
                    values,
                    model_version,
                })
            })
            .collect()
    }

    /// Saved conversations for `user_id`, oldest first.
    pub fn conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        ensure_user(&self.conn, user_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, messages FROM conversations WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(timestamp, messages)| -> Result<Conversation, StoreError> {
                Ok(Conversation {
                    timestamp: parse_ts(&timestamp)?,
                    messages: serde_json::from_str(&messages)?,
                })
            })
            .collect()
    }

    /// Append one conversation entry. Each call adds a new entry, even for
    /// identical messages.
    pub fn append_conversation(
        &mut self,
        user_id: &str,
        messages: &[Message],
    ) -> Result<Conversation, StoreError> {
        let encoded = serde_json::to_string(messages)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_user(&tx, user_id)?;
        let timestamp = Utc::now();
        tx.execute(
            "INSERT INTO conversations (user_id, timestamp, messages) VALUES (?1, ?2, ?3)",
            params![user_id, format_ts(&timestamp), encoded],
        )?;
        tx.commit()?;

        tracing::info!(user_id, messages = messages.len(), "conversation saved");
        Ok(Conversation {
            timestamp,
            messages: messages.to_vec(),
        })
    }

    /// Messages of the `index`-th saved conversation (0-based, oldest first).
    pub fn restore_conversation(&self, user_id: &str, index: usize) -> Result<Vec<Message>, StoreError> {
        ensure_user(&self.conn, user_id)?;
        let messages: Option<String> = self
            .conn
            .query_row(
                "SELECT messages FROM conversations WHERE user_id = ?1
                 ORDER BY id LIMIT 1 OFFSET ?2",
                params![user_id, index as i64],
                |row| row.get(0),
            )
            .optional()?;

        match messages {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => {
                let count: i64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM conversations WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )?;
                Err(StoreError::IndexOutOfRange {
                    user_id: user_id.to_string(),
                    index,
                    count: count as usize,
                })
            }
        }
    }

    pub fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT u.user_id, u.name, u.created_at,
                    (SELECT COUNT(*) FROM embeddings e WHERE e.user_id = u.user_id),
                    (SELECT COUNT(*) FROM conversations c WHERE c.user_id = u.user_id)
             FROM users u ORDER BY u.seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, created_at, embeddings, conversations)| -> Result<UserSummary, StoreError> {
                Ok(UserSummary {
                    id,
                    name,
                    created_at: parse_ts(&created_at)?,
                    embeddings: embeddings as usize,
                    conversations: conversations as usize,
                })
            })
            .collect()
    }

    pub fn user_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Insert a complete record under its existing id (used by import).
    pub fn insert_record(&mut self, record: &UserRecord) -> Result<(), StoreError> {
        let name = record.name.trim();
        if record.id.trim().is_empty() {
            return Err(StoreError::Validation("user id must not be empty".into()));
        }
        if name.is_empty() {
            return Err(StoreError::Validation("name must not be empty".into()));
        }
        let Some(first) = record.embeddings.first() else {
            return Err(StoreError::Validation(format!("user {} has no embeddings", record.id)));
        };
        for embedding in &record.embeddings {
            check_values(embedding)?;
        }
        if record.embeddings.iter().any(|e| e.dim() != first.dim()) {
            return Err(StoreError::Validation(format!(
                "user {} has inconsistent embeddings",
                record.id
            )));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if user_exists(&tx, &record.id)? {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        check_dimension(&tx, first.dim())?;

        let seq: i64 = tx.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM users", [], |row| {
            row.get(0)
        })?;
        tx.execute(
            "INSERT INTO users (user_id, seq, name, created_at, profile_image)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                seq,
                name,
                format_ts(&record.created_at),
                record.profile_image.as_deref()
            ],
        )?;
        for embedding in &record.embeddings {
            insert_embedding(&tx, &record.id, embedding)?;
        }
        for conversation in &record.conversations {
            tx.execute(
                "INSERT INTO conversations (user_id, timestamp, messages) VALUES (?1, ?2, ?3)",
                params![
                    record.id,
                    format_ts(&conversation.timestamp),
                    serde_json::to_string(&conversation.messages)?
                ],
            )?;
        }
        tx.commit()?;

        tracing::info!(
            user_id = %record.id,
            embeddings = record.embeddings.len(),
            conversations = record.conversations.len(),
            "inserted user record"
        );
        Ok(())
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn user_exists(conn: &Connection, user_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1)",
        params![user_id],
        |row| row.get(0),
    )
}

fn ensure_user(conn: &Connection, user_id: &str) -> Result<(), StoreError> {
    if user_exists(conn, user_id)? {
        Ok(())
    } else {
        Err(StoreError::NotFound(user_id.to_string()))
    }
}

/// Non-empty and finite, so the gallery stays decodable.
fn check_values(embedding: &Embedding) -> Result<(), StoreError> {
    if embedding.values.is_empty() {
        return Err(StoreError::Validation("embedding is empty".into()));
    }
    if !embedding.values.iter().all(|v| v.is_finite()) {
        return Err(StoreError::Validation(
            "embedding contains non-finite values".into(),
        ));
    }
    Ok(())
}

/// All stored embeddings share one dimensionality.
fn check_dimension(conn: &Connection, dim: usize) -> Result<(), StoreError> {
    let existing: Option<i64> = conn
        .query_row("SELECT dim FROM embeddings LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match existing {
        Some(stored) if stored as usize != dim => Err(StoreError::Validation(format!(
            "embedding has {dim} dimensions, store holds {stored}-dimensional embeddings"
        ))),
        _ => Ok(()),
    }
}

/// Next free `P###` id. Skips ids taken by imported records.
fn next_user_id(conn: &Connection) -> Result<(i64, String), StoreError> {
    let mut seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM users", [], |row| {
        row.get(0)
    })?;
    loop {
        let id = format!("P{seq:03}");
        if !user_exists(conn, &id)? {
            return Ok((seq, id));
        }
        seq += 1;
    }
}

fn insert_embedding(conn: &Connection, user_id: &str, embedding: &Embedding) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO embeddings (user_id, dim, vector, model_version) VALUES (?1, ?2, ?3, ?4)",
        params![
            user_id,
            embedding.dim() as i64,
            encode_embedding(&embedding.values),
            embedding.model_version
        ],
    )?;
    Ok(())
}
