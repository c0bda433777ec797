//! Request history storage
//!
//! Every inbound request gets a row at arrival; the row is mutated in place
//! through completion and never deleted. Writes go through a dedicated
//! writer thread so SQLite work never blocks the async runtime, and a single
//! writer keeps history updates serialized and monotonic.
//!
//! # Architecture
//!
//! ```text
//! Request orchestrator (async)
//!     │
//!     └──→ HistoryStore (tokio::sync::mpsc, bounded)
//!             │
//!             └──→ Dedicated Writer Thread (blocking_recv)
//!                     └──→ SQLite (WAL mode)
//!
//! HTTP API (async)
//!     └──→ HistoryQuery (r2d2 read-only pool)
//! ```
//!
//! The command channel is async-aware: senders await capacity instead of
//! blocking a runtime worker when the writer falls behind.

mod query;

pub use query::{HistoryQuery, HistoryRecord, ModelSummary};

use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, Receiver, Sender};

/// Terminal status of a history row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Rows are born pending via the insert statement; the variant exists
    /// for symmetry in status reporting
    #[allow(dead_code)]
    Pending,
    Completed,
    Partial,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Completed => "completed",
            Status::Partial => "partial",
            Status::Error => "error",
        }
    }
}

/// Terminal update applied to a row exactly once
#[derive(Debug, Clone)]
pub struct Terminal {
    pub status: Status,
    pub response_json: Option<String>,
    pub stop_reason: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Commands sent to the writer thread
enum Command {
    Insert {
        ts: String,
        claimed_model: String,
        request_json: String,
        is_streaming: bool,
        reply: tokio::sync::oneshot::Sender<i64>,
    },
    Translated {
        id: i64,
        provider: String,
        concrete_model: String,
        openai_request_json: Option<String>,
    },
    Complete {
        id: i64,
        terminal: Terminal,
    },
    SetConfig {
        key: String,
        value: String,
    },
    Shutdown,
}

/// Handle to the history writer
///
/// Cheap to clone; all clones feed the same writer thread.
#[derive(Clone)]
pub struct HistoryStore {
    tx: Sender<Command>,
    db_path: PathBuf,
}

/// Join handle for the writer thread, kept by main for shutdown
pub struct HistoryWriter {
    handle: Option<JoinHandle<()>>,
    tx: Sender<Command>,
}

impl HistoryStore {
    /// Open (or create) the database and spawn the writer thread
    pub fn open(db_path: &Path) -> anyhow::Result<(Self, HistoryWriter)> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Initialize schema on a throwaway connection so failures surface
        // at startup rather than inside the writer thread
        let conn = Connection::open(db_path)?;
        init_schema(&conn)?;
        drop(conn);

        let (tx, rx) = mpsc::channel::<Command>(256);
        let writer_path = db_path.to_path_buf();

        let handle = thread::Builder::new()
            .name("history-writer".into())
            .spawn(move || {
                if let Err(e) = writer_thread(rx, &writer_path) {
                    tracing::error!("History writer thread error: {}", e);
                }
            })?;

        let store = Self {
            tx: tx.clone(),
            db_path: db_path.to_path_buf(),
        };
        let writer = HistoryWriter {
            handle: Some(handle),
            tx,
        };
        Ok((store, writer))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert a pending row and return its id
    pub async fn insert(
        &self,
        claimed_model: &str,
        request_json: String,
        is_streaming: bool,
    ) -> anyhow::Result<i64> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(Command::Insert {
                ts: chrono::Utc::now().to_rfc3339(),
                claimed_model: claimed_model.to_string(),
                request_json,
                is_streaming,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("history writer unavailable"))?;
        Ok(rx.await?)
    }

    /// Tag a row with its routing decision and translated request.
    /// Awaited sends keep a request's create → translate → terminal
    /// updates in order on the writer queue.
    pub async fn record_translation(
        &self,
        id: i64,
        provider: &str,
        concrete_model: &str,
        openai_request_json: Option<String>,
    ) {
        let _ = self
            .tx
            .send(Command::Translated {
                id,
                provider: provider.to_string(),
                concrete_model: concrete_model.to_string(),
                openai_request_json,
            })
            .await;
    }

    /// Apply the terminal update to a row
    pub async fn complete(&self, id: i64, terminal: Terminal) {
        let _ = self.tx.send(Command::Complete { id, terminal }).await;
    }

    /// Persist a config key (used for tier selections)
    pub async fn set_config(&self, key: &str, value: &str) {
        let _ = self
            .tx
            .send(Command::SetConfig {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await;
    }
}

impl HistoryWriter {
    /// Flush and stop the writer thread; called once at shutdown.
    /// Commands already queued are processed before the Shutdown marker.
    pub fn shutdown(self) {
        let HistoryWriter { handle, tx } = self;
        // try_send: shutdown must not block. Dropping our sender right
        // after means the writer still exits on channel close if the
        // marker didn't fit.
        let _ = tx.try_send(Command::Shutdown);
        drop(tx);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn writer_thread(mut rx: Receiver<Command>, db_path: &Path) -> anyhow::Result<()> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        "#,
    )?;

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Insert {
                ts,
                claimed_model,
                request_json,
                is_streaming,
                reply,
            } => {
                match conn.execute(
                    "INSERT INTO history (ts, claimed_model, request_json, is_streaming, status)
                     VALUES (?1, ?2, ?3, ?4, 'pending')",
                    params![ts, claimed_model, request_json, is_streaming as i64],
                ) {
                    Ok(_) => {
                        let _ = reply.send(conn.last_insert_rowid());
                    }
                    Err(e) => {
                        tracing::error!("Failed to insert history row: {}", e);
                        // Dropping `reply` signals the error to the caller
                    }
                }
            }
            Command::Translated {
                id,
                provider,
                concrete_model,
                openai_request_json,
            } => {
                if let Err(e) = conn.execute(
                    "UPDATE history SET provider = ?1, concrete_model = ?2,
                     openai_request_json = ?3 WHERE id = ?4",
                    params![provider, concrete_model, openai_request_json, id],
                ) {
                    tracing::error!("Failed to record translation for row {}: {}", id, e);
                }
            }
            Command::Complete { id, terminal } => {
                let total = terminal.input_tokens as i64 + terminal.output_tokens as i64;
                if let Err(e) = conn.execute(
                    "UPDATE history SET status = ?1, response_json = ?2, stop_reason = ?3,
                     input_tokens = ?4, output_tokens = ?5, total_tokens = ?6,
                     error = ?7, duration_ms = ?8 WHERE id = ?9",
                    params![
                        terminal.status.as_str(),
                        terminal.response_json,
                        terminal.stop_reason,
                        terminal.input_tokens as i64,
                        terminal.output_tokens as i64,
                        total,
                        terminal.error,
                        terminal.duration_ms as i64,
                        id
                    ],
                ) {
                    tracing::error!("Failed to complete history row {}: {}", id, e);
                }
            }
            Command::SetConfig { key, value } => {
                if let Err(e) = conn.execute(
                    "INSERT INTO config (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                ) {
                    tracing::error!("Failed to persist config {}: {}", key, e);
                }
            }
            Command::Shutdown => {
                tracing::debug!("History writer thread shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            claimed_model TEXT NOT NULL,
            concrete_model TEXT,
            provider TEXT,
            is_streaming INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            stop_reason TEXT,
            duration_ms INTEGER,
            request_json TEXT NOT NULL,
            openai_request_json TEXT,
            response_json TEXT,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_history_ts ON history(ts);
        CREATE INDEX IF NOT EXISTS idx_history_model ON history(concrete_model);

        CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn temp_db_path(label: &str) -> PathBuf {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let random = RandomState::new().build_hasher().finish();
    std::env::temp_dir().join(format!("ccproxy-test-{label}-{random:016x}.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_row_lifecycle() {
        let path = temp_db_path("lifecycle");
        let (store, writer) = HistoryStore::open(&path).unwrap();

        let id = store
            .insert("claude-3-5-haiku-20241022", "{}".to_string(), false)
            .await
            .unwrap();
        store
            .record_translation(id, "OpenAI", "gpt-4o-mini", Some("{}".to_string()))
            .await;
        store
            .complete(
                id,
                Terminal {
                    status: Status::Completed,
                    response_json: Some(r#"{"id":"msg_1"}"#.to_string()),
                    stop_reason: Some("end_turn".to_string()),
                    input_tokens: 10,
                    output_tokens: 5,
                    error: None,
                    duration_ms: 42,
                },
            )
            .await;
        writer.shutdown();

        let query = HistoryQuery::new(&path).unwrap();
        let rows = query.recent(10, None, None).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.id, id);
        assert_eq!(row.status, "completed");
        assert_eq!(row.provider.as_deref(), Some("OpenAI"));
        assert_eq!(row.concrete_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(row.total_tokens, 15);
        assert_eq!(row.duration_ms, Some(42));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let path = temp_db_path("config");
        let (store, writer) = HistoryStore::open(&path).unwrap();

        store.set_config("BIG_MODEL", "OpenAI:gpt-4o").await;
        store.set_config("BIG_MODEL", "DeepSeek:deepseek-chat").await;
        writer.shutdown();

        let query = HistoryQuery::new(&path).unwrap();
        assert_eq!(
            query.config_get("BIG_MODEL").unwrap().as_deref(),
            Some("DeepSeek:deepseek-chat")
        );
        assert_eq!(query.config_get("SMALL_MODEL").unwrap(), None);

        let _ = std::fs::remove_file(&path);
    }
}
