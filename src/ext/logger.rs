//! Message logger extension (spec.md §4.10), grounded on
//! `examples/original_source/lib/components/messageLogger/{logger,filelogger}.go`
//! for the dispatch shape (log every PRIVMSG/NOTICE/JOIN/PART/KICK/QUIT to
//! a per-buffer store) and on the teacher's
//! `examples/sid3xyz-slircd-ng/src/db/history/storage.rs` for the indexed,
//! nanosecond-timestamped retrieval the original never actually
//! implemented (`GetFromTime`/`Search` were stubs there).
//!
//! Two backends implement [`MessageStore`], selected by
//! [`crate::config::LoggingConfig`]: a flat file per (user, network,
//! buffer), and an embedded SQLite table. Both support last-N and
//! timestamp-windowed retrieval, which backs the automatic last-50-lines
//! replay on `state.sent` and the `CHATHISTORY` client command.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bnc_proto::casemap::irc_to_lower;
use bnc_proto::{IrcMessage, Prefix, Tag};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::bus::Bus;
use crate::config::LoggingConfig;
use crate::listener::ListenerContext;

/// Maximum lines replayed per buffer, for both the automatic replay on
/// `state.sent` and one `CHATHISTORY` response.
const MAX_REPLAY: i64 = 50;

/// Errors opening or writing to a message store.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("message log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message log database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// One stored line: enough to reconstruct a tagged replay message.
#[derive(Clone, Debug)]
pub struct LogLine {
    /// Nanoseconds since the Unix epoch.
    pub nanotime: i64,
    /// The full wire-serialized line, tags and all, as originally seen.
    pub raw: String,
}

/// Append-only, queryable per-(user, network, buffer) message history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record one line for `buffer` (already case-folded by the caller).
    async fn append(&self, user: &str, network: &str, buffer: &str, line: &LogLine) -> Result<(), LoggerError>;

    /// The most recent `limit` lines, oldest first.
    async fn last_n(&self, user: &str, network: &str, buffer: &str, limit: i64) -> Result<Vec<LogLine>, LoggerError>;

    /// Up to `limit` lines relative to `anchor_nanos`: strictly after it if
    /// `limit > 0` (ascending), strictly before it if `limit < 0`
    /// (returned oldest-first regardless of direction). `limit` is
    /// expected pre-clamped to `±MAX_REPLAY` by the caller.
    async fn window(
        &self,
        user: &str,
        network: &str,
        buffer: &str,
        anchor_nanos: i64,
        limit: i64,
    ) -> Result<Vec<LogLine>, LoggerError>;
}

/// Open the backend named by `config`.
pub async fn open(config: &LoggingConfig) -> Result<Arc<dyn MessageStore>, LoggerError> {
    match config {
        LoggingConfig::File { path } => Ok(Arc::new(FileStore::new(path))),
        LoggingConfig::Sqlite { database } => Ok(Arc::new(SqliteStore::open(database).await?)),
    }
}

fn now_nanos() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as i64).unwrap_or(0)
}

// ---------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------

/// One append-only file per (user, network, buffer), lines as
/// `<nanotime>\t<raw>`. Grounded on `filelogger.go`'s directory-per-target
/// layout, but with a real timestamp column so retrieval isn't a stub.
struct FileStore {
    root: PathBuf,
}

impl FileStore {
    fn new(root: impl Into<PathBuf>) -> Self {
        FileStore { root: root.into() }
    }

    fn path_for(&self, user: &str, network: &str, buffer: &str) -> PathBuf {
        self.root.join(user).join(network).join(format!("{}.log", irc_to_lower(buffer)))
    }

    async fn read_lines(&self, path: &Path) -> Result<Vec<LogLine>, LoggerError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(contents
            .lines()
            .filter_map(|line| {
                let (ts, raw) = line.split_once('\t')?;
                let nanotime = ts.parse().ok()?;
                Some(LogLine { nanotime, raw: raw.to_string() })
            })
            .collect())
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn append(&self, user: &str, network: &str, buffer: &str, line: &LogLine) -> Result<(), LoggerError> {
        let path = self.path_for(user, network, buffer);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(format!("{}\t{}\n", line.nanotime, line.raw).as_bytes()).await?;
        Ok(())
    }

    async fn last_n(&self, user: &str, network: &str, buffer: &str, limit: i64) -> Result<Vec<LogLine>, LoggerError> {
        let all = self.read_lines(&self.path_for(user, network, buffer)).await?;
        let start = all.len().saturating_sub(limit.max(0) as usize);
        Ok(all[start..].to_vec())
    }

    async fn window(
        &self,
        user: &str,
        network: &str,
        buffer: &str,
        anchor_nanos: i64,
        limit: i64,
    ) -> Result<Vec<LogLine>, LoggerError> {
        let all = self.read_lines(&self.path_for(user, network, buffer)).await?;
        if limit >= 0 {
            Ok(all.into_iter().filter(|l| l.nanotime > anchor_nanos).take(limit as usize).collect())
        } else {
            let mut matched: Vec<LogLine> = all.into_iter().filter(|l| l.nanotime < anchor_nanos).collect();
            let keep = matched.len().saturating_sub((-limit) as usize);
            matched.drain(..keep);
            Ok(matched)
        }
    }
}

// ---------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------

/// Embedded SQL message history, following the teacher's
/// `db/history/storage.rs` query shapes (nanosecond `i64` timestamps,
/// bound `WHERE nanotime < ?` / `> ?` windows).
struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    async fn open(path: &str) -> Result<Self, LoggerError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(sqlx::sqlite::SqliteConnectOptions::new().filename(path).create_if_missing(true))
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_log (
                user TEXT NOT NULL,
                network TEXT NOT NULL,
                buffer TEXT NOT NULL,
                nanotime INTEGER NOT NULL,
                raw TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS message_log_lookup ON message_log (user, network, buffer, nanotime)")
            .execute(&pool)
            .await?;
        Ok(SqliteStore { pool })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, user: &str, network: &str, buffer: &str, line: &LogLine) -> Result<(), LoggerError> {
        sqlx::query("INSERT INTO message_log (user, network, buffer, nanotime, raw) VALUES (?, ?, ?, ?, ?)")
            .bind(user)
            .bind(network)
            .bind(irc_to_lower(buffer))
            .bind(line.nanotime)
            .bind(&line.raw)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_n(&self, user: &str, network: &str, buffer: &str, limit: i64) -> Result<Vec<LogLine>, LoggerError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT nanotime, raw FROM message_log
            WHERE user = ? AND network = ? AND buffer = ?
            ORDER BY nanotime DESC
            LIMIT ?
            "#,
        )
        .bind(user)
        .bind(network)
        .bind(irc_to_lower(buffer))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().rev().map(|(nanotime, raw)| LogLine { nanotime, raw }).collect())
    }

    async fn window(
        &self,
        user: &str,
        network: &str,
        buffer: &str,
        anchor_nanos: i64,
        limit: i64,
    ) -> Result<Vec<LogLine>, LoggerError> {
        let buffer = irc_to_lower(buffer);
        if limit >= 0 {
            let rows: Vec<(i64, String)> = sqlx::query_as(
                r#"
                SELECT nanotime, raw FROM message_log
                WHERE user = ? AND network = ? AND buffer = ? AND nanotime > ?
                ORDER BY nanotime ASC
                LIMIT ?
                "#,
            )
            .bind(user)
            .bind(network)
            .bind(&buffer)
            .bind(anchor_nanos)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(nanotime, raw)| LogLine { nanotime, raw }).collect())
        } else {
            let rows: Vec<(i64, String)> = sqlx::query_as(
                r#"
                SELECT nanotime, raw FROM message_log
                WHERE user = ? AND network = ? AND buffer = ? AND nanotime < ?
                ORDER BY nanotime DESC
                LIMIT ?
                "#,
            )
            .bind(user)
            .bind(network)
            .bind(&buffer)
            .bind(anchor_nanos)
            .bind(-limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().rev().map(|(nanotime, raw)| LogLine { nanotime, raw }).collect())
        }
    }
}

// ---------------------------------------------------------------------
// Bus wiring
// ---------------------------------------------------------------------

/// Attach logging, automatic replay, and `CHATHISTORY` handling to `bus`.
///
/// `ctx` isn't read directly (unlike `ext::control`/`ext::bouncer_protocol`)
/// but is taken for signature symmetry with the other extensions, all
/// wired up the same way in `Manager`.
pub fn register(bus: &mut Bus, _ctx: Arc<ListenerContext>, store: Arc<dyn MessageStore>) {
    let logging_store = store.clone();
    bus.on_irc_raw(move |ev| {
        let Some(user) = ev.user.clone() else { return };
        let Some(server) = ev.server.clone() else { return };
        let Some((buffer, _sender)) = loggable_target(&ev.message) else { return };
        let line = LogLine { nanotime: now_nanos(), raw: ev.message.to_string() };
        let store = logging_store.clone();
        tokio::spawn(async move {
            let network = server.name().to_string();
            if let Err(e) = store.append(&user.0, &network, &buffer, &line).await {
                warn!(error = %e, %network, %buffer, "failed to log message");
            }
        });
    });

    let replay_store = store.clone();
    bus.on_state_sent(move |ev| {
        if ev.listener.cap_enabled("bouncer") {
            return;
        }
        let Some(server) = ev.server.clone() else { return };
        let listener = ev.listener.clone();
        let store = replay_store.clone();
        tokio::spawn(async move {
            let Some(user_id) = server.user_id().await else { return };
            let network = server.name().to_string();
            let nick = listener.current_nick().await;
            for buffer in server.buffers_snapshot().await {
                match store.last_n(&user_id.0, &network, &buffer.name, MAX_REPLAY).await {
                    Ok(lines) => {
                        for line in lines {
                            if let Some(msg) = replay_message(&line, &nick, None) {
                                listener.send(msg).await;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, %network, buffer = %buffer.name, "failed to load replay history"),
                }
            }
        });
    });

    bus.on_irc_raw(move |ev| {
        if !ev.from_client || ev.message.command != "CHATHISTORY" {
            return;
        }
        ev.halt = true;
        let Some(listener) = ev.listener.clone() else { return };
        if !listener.cap_enabled("batch") {
            return;
        }
        let Some(server) = ev.server.clone() else { return };
        let Some(target) = ev.message.params.first().cloned() else { return };
        let Some(timestamp_param) = ev.message.params.get(1).cloned() else { return };
        let Some(count_param) = ev.message.params.get(2).cloned() else { return };
        let store = store.clone();
        tokio::spawn(async move { chathistory(&listener, &server, &target, &timestamp_param, &count_param, &store).await });
    });
}

static BATCH_COUNTER: AtomicU64 = AtomicU64::new(1);

async fn chathistory(
    listener: &Arc<crate::listener::Listener>,
    server: &Arc<crate::server::ServerConnection>,
    target: &str,
    timestamp_param: &str,
    count_param: &str,
    store: &Arc<dyn MessageStore>,
) {
    let Some(user_id) = server.user_id().await else { return };
    let network = server.name().to_string();

    let timestamp = timestamp_param
        .split_once('=')
        .filter(|(key, _)| *key == "timestamp")
        .and_then(|(_, value)| chrono::DateTime::parse_from_rfc3339(value).ok());
    let message_count: i64 = count_param
        .split_once('=')
        .filter(|(key, _)| *key == "message_count")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);
    let Some(timestamp) = timestamp else { return };
    let anchor = timestamp.timestamp_nanos_opt().unwrap_or(0);
    let clamped = message_count.clamp(-MAX_REPLAY, MAX_REPLAY);

    let lines = match store.window(&user_id.0, &network, target, anchor, clamped).await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(error = %e, %network, %target, "CHATHISTORY query failed");
            return;
        }
    };

    let batch_id = format!("chathistory-{}", BATCH_COUNTER.fetch_add(1, Ordering::Relaxed));
    let nick = listener.current_nick().await;
    listener
        .send(IrcMessage::new("BATCH", vec![format!("+{batch_id}"), "chathistory".to_string(), target.to_string()]))
        .await;
    for line in &lines {
        if let Some(msg) = replay_message(line, &nick, Some(&batch_id)) {
            listener.send(msg).await;
        }
    }
    listener.send(IrcMessage::new("BATCH", vec![format!("-{batch_id}")])).await;
}

/// Which buffer (if any) a line belongs to, plus its source nick.
fn loggable_target(msg: &IrcMessage) -> Option<(String, String)> {
    const LOGGED: &[&str] = &["PRIVMSG", "NOTICE", "JOIN", "PART", "KICK"];
    if !LOGGED.contains(&msg.command.as_str()) {
        return None;
    }
    let target = msg.params.first()?;
    let sender = msg.source_nick().unwrap_or_default().to_string();
    Some((irc_to_lower(target), sender))
}

/// Reconstruct a replayable message from a stored line, rewriting its
/// destination to the replaying client's current nick and stamping a
/// `time` tag from the stored timestamp. Drops unparseable lines (the log
/// predates a format change, or was hand-edited).
fn replay_message(line: &LogLine, nick: &str, batch_id: Option<&str>) -> Option<IrcMessage> {
    let mut msg: IrcMessage = line.raw.parse().ok()?;
    if !msg.params.is_empty() && matches!(msg.command.as_str(), "PRIVMSG" | "NOTICE") {
        msg.params[0] = nick.to_string();
    }
    let time = chrono::DateTime::from_timestamp(line.nanotime / 1_000_000_000, (line.nanotime % 1_000_000_000) as u32)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default();
    msg = msg.with_tag(Tag::with_value("time", time));
    if let Some(id) = batch_id {
        msg = msg.with_tag(Tag::with_value("batch", id.to_string()));
    }
    if msg.prefix.is_none() {
        msg.prefix = Some(Prefix::parse("history"));
    }
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loggable_target_ignores_unrelated_commands() {
        let msg = IrcMessage::new("PING", vec!["x".into()]);
        assert!(loggable_target(&msg).is_none());
    }

    #[test]
    fn loggable_target_folds_channel_case() {
        let msg = IrcMessage::new("PRIVMSG", vec!["#Chan".into(), "hi".into()]);
        let (buffer, _) = loggable_target(&msg).unwrap();
        assert_eq!(buffer, "#chan");
    }

    #[tokio::test]
    async fn file_store_round_trips_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        for i in 0..5 {
            store
                .append("alice", "freenode", "#chan", &LogLine { nanotime: i, raw: format!("line {i}") })
                .await
                .unwrap();
        }
        let last = store.last_n("alice", "freenode", "#chan", 3).await.unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].raw, "line 2");
        assert_eq!(last.last().unwrap().raw, "line 4");
    }

    #[tokio::test]
    async fn file_store_window_before_anchor_is_chronological() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        for i in 0..10 {
            store
                .append("alice", "freenode", "#chan", &LogLine { nanotime: i, raw: format!("line {i}") })
                .await
                .unwrap();
        }
        let before = store.window("alice", "freenode", "#chan", 7, -3).await.unwrap();
        assert_eq!(before.iter().map(|l| l.nanotime).collect::<Vec<_>>(), vec![4, 5, 6]);
    }
}
