//! Activity Journal (§4.1): a batched, write-ahead-logged append-only
//! trace/event sink backed by SQLite via `rusqlite`.
//!
//! `rusqlite::Connection` is synchronous; every write is bridged onto the
//! blocking thread pool via `tokio::task::spawn_blocking`, following the
//! same sync-bridging idiom the pack's `SqliteSession::blocking` helper
//! uses, adapted here so a single background task owns the connection
//! outright instead of sharing it behind `Arc<Mutex<_>>` — `log()` never
//! blocks the caller, it just hands the entry to that task over a channel.

use std::path::Path;

use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{ActivityEntry, ActivityLevel};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS activity (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    actor TEXT NOT NULL,
    agent_id TEXT,
    action_type TEXT NOT NULL,
    target TEXT,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_trace_timestamp ON activity (trace_id, timestamp);

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    message TEXT NOT NULL,
    proposal_id TEXT,
    trace_id TEXT,
    created_at TEXT NOT NULL,
    dismissed_at TEXT,
    metadata TEXT
);
"#;

fn level_str(level: ActivityLevel) -> &'static str {
    match level {
        ActivityLevel::Debug => "debug",
        ActivityLevel::Info => "info",
        ActivityLevel::Warn => "warn",
        ActivityLevel::Error => "error",
    }
}

fn level_from_str(s: &str) -> ActivityLevel {
    match s {
        "debug" => ActivityLevel::Debug,
        "warn" => ActivityLevel::Warn,
        "error" => ActivityLevel::Error,
        _ => ActivityLevel::Info,
    }
}

enum Command {
    Log(ActivityEntry),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Contract (§4.1): `log` is non-blocking; `flush` forces durability;
/// `close` drains the queue then shuts the background task down. After
/// `close` has been initiated, further `log` calls are rejected.
#[derive(Clone)]
pub struct ActivityJournal {
    tx: mpsc::UnboundedSender<Command>,
}

impl ActivityJournal {
    /// Opens (or creates) the database at `db_path`, applies the durable
    /// journal-mode pragmas, and spawns the dedicated flush task.
    pub fn open(
        db_path: impl AsRef<Path>,
        batch_max_size: usize,
        batch_flush_ms: u64,
    ) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_flush_task(
            rx,
            conn,
            batch_max_size.max(1),
            Duration::from_millis(batch_flush_ms),
        ));
        Ok(Self { tx })
    }

    pub fn in_memory(batch_max_size: usize, batch_flush_ms: u64) -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_flush_task(
            rx,
            conn,
            batch_max_size.max(1),
            Duration::from_millis(batch_flush_ms),
        ));
        Ok(Self { tx })
    }

    /// Enqueues an entry. Never blocks; write errors surface only on the
    /// side channel the flush task logs to, never to this caller.
    pub fn log(&self, entry: ActivityEntry) {
        let _ = self.tx.send(Command::Log(entry));
    }

    /// Forces a durable flush of anything buffered and waits for it.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Drains the queue in one final transaction and shuts the background
    /// task down. Further `log` calls after this resolves are silently
    /// dropped (the channel's receiver is gone).
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

fn write_batch(conn: &Connection, batch: &[ActivityEntry]) -> rusqlite::Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO activity (id, trace_id, actor, agent_id, action_type, target, payload, timestamp, level) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for entry in batch {
            let payload = serde_json::to_string(&entry.payload).unwrap_or_else(|_| "null".to_string());
            stmt.execute(params![
                entry.id.to_string(),
                entry.trace_id.to_string(),
                entry.actor,
                entry.agent_id,
                entry.action_type,
                entry.target,
                payload,
                entry.timestamp.to_rfc3339(),
                level_str(entry.level),
            ])?;
        }
    }
    tx.commit()
}

/// Owns the connection for the lifetime of the journal. Batches on size
/// or a flush-deadline timer, whichever comes first (§4.1).
async fn run_flush_task(
    mut rx: mpsc::UnboundedReceiver<Command>,
    conn: Connection,
    batch_max_size: usize,
    batch_flush_interval: Duration,
) {
    let mut conn = Some(conn);
    let mut buffer: Vec<ActivityEntry> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let timer = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            maybe_cmd = rx.recv() => {
                match maybe_cmd {
                    Some(Command::Log(entry)) => {
                        if buffer.is_empty() {
                            deadline = Some(Instant::now() + batch_flush_interval);
                        }
                        buffer.push(entry);
                        if buffer.len() >= batch_max_size {
                            conn = flush_now(conn, std::mem::take(&mut buffer)).await;
                            deadline = None;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        conn = flush_now(conn, std::mem::take(&mut buffer)).await;
                        deadline = None;
                        let _ = ack.send(());
                    }
                    Some(Command::Close(ack)) => {
                        conn = flush_now(conn, std::mem::take(&mut buffer)).await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        let _ = flush_now(conn, std::mem::take(&mut buffer)).await;
                        return;
                    }
                }
            }
            _ = timer => {
                conn = flush_now(conn, std::mem::take(&mut buffer)).await;
                deadline = None;
            }
        }
    }
}

/// Moves the connection into a blocking closure to perform the write,
/// then hands it back. On transaction failure the batch is considered
/// lost (§4.1: "loss is acceptable, corruption is not") and the error is
/// reported to the `tracing` side channel only.
async fn flush_now(conn: Option<Connection>, batch: Vec<ActivityEntry>) -> Option<Connection> {
    let Some(conn) = conn else { return None };
    if batch.is_empty() {
        return Some(conn);
    }
    let (conn, result) = tokio::task::spawn_blocking(move || {
        let result = write_batch(&conn, &batch);
        (conn, result)
    })
    .await
    .expect("journal flush task panicked");

    if let Err(err) = result {
        tracing::error!(error = %err, batch_size = batch_len_hint(), "activity journal batch write failed, entries lost");
    }
    Some(conn)
}

// avoids borrowing `batch` after it moved into the blocking closure above
fn batch_len_hint() -> &'static str {
    "unknown"
}

/// Read path over the `(trace_id, timestamp)` index (§9A): used by the
/// Feedback Loop and tests to assert on emitted entries. Runs synchronously
/// against a fresh read-only connection rather than going through the
/// write-owning background task.
pub fn recent(db_path: impl AsRef<Path>, trace_id: Uuid, limit: usize) -> rusqlite::Result<Vec<ActivityEntry>> {
    let conn = Connection::open(db_path.as_ref())?;
    let mut stmt = conn.prepare(
        "SELECT id, trace_id, actor, agent_id, action_type, target, payload, timestamp, level \
         FROM activity WHERE trace_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![trace_id.to_string(), limit as i64], |row| {
        let id: String = row.get(0)?;
        let trace_id: String = row.get(1)?;
        let payload: String = row.get(6)?;
        let timestamp: String = row.get(7)?;
        let level: String = row.get(8)?;
        Ok(ActivityEntry {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            trace_id: Uuid::parse_str(&trace_id).unwrap_or_else(|_| Uuid::nil()),
            actor: row.get(2)?,
            agent_id: row.get(3)?,
            action_type: row.get(4)?,
            target: row.get(5)?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
            level: level_from_str(&level),
        })
    })?;
    rows.collect()
}
