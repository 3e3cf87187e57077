//! Conversation storage.
//!
//! `ConversationStore` is the capability the orchestration core depends on. `SqliteStore`
//! is the bundled implementation; `RetryingStore` adds bounded retries for transient
//! failures in front of any store.

use crate::conversation::{Conversation, NewConversation, Turn, TurnRole};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_channels::ChannelKind;
use rusqlite::{Connection, OptionalExtension, params};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Transient(e.to_string())
                }
                ErrorCode::ConstraintViolation => StoreError::Conflict(e.to_string()),
                _ => StoreError::Backend(e.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Looks a conversation up by thread handle, soft-deleted ones included.
    async fn find_conversation(&self, thread_handle: &str) -> StoreResult<Option<Conversation>>;

    async fn get_conversation(&self, id: i64) -> StoreResult<Option<Conversation>>;

    /// Most recently active, not deleted conversation of `owner_id` on `channel`.
    async fn latest_conversation(
        &self,
        channel: ChannelKind,
        owner_id: &str,
    ) -> StoreResult<Option<Conversation>>;

    /// Fails with `Conflict` when the thread handle is already taken.
    async fn create_conversation(&self, new: &NewConversation) -> StoreResult<Conversation>;

    /// An assistant turn appended with empty content is pending until patched.
    async fn append_turn(
        &self,
        conversation_id: i64,
        role: TurnRole,
        content: &str,
        image_ref: Option<&str>,
    ) -> StoreResult<Turn>;

    /// Fills a pending turn. A second patch of the same turn fails with `Conflict`.
    async fn patch_turn_content(&self, turn_id: i64, content: &str) -> StoreResult<()>;

    /// Chronological; with a limit, the most recent `limit` turns.
    async fn list_turns(&self, conversation_id: i64, limit: Option<usize>)
    -> StoreResult<Vec<Turn>>;

    async fn get_turn(&self, turn_id: i64) -> StoreResult<Option<Turn>>;

    async fn soft_delete_conversation(&self, id: i64) -> StoreResult<()>;

    /// Removes the conversation and all of its turns.
    async fn delete_conversation(&self, id: i64) -> StoreResult<()>;
}

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_handle TEXT NOT NULL UNIQUE,
    channel TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    last_message_at_ms INTEGER NOT NULL,
    deleted_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS conversations_owner_recent
    ON conversations (channel, owner_id, last_message_at_ms);

CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    image_ref TEXT,
    created_at_ms INTEGER NOT NULL,
    pending INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS turns_by_conversation ON turns (conversation_id, id);
"#;

const CONVERSATION_COLUMNS: &str = "id, thread_handle, channel, owner_id, title, created_at_ms, \
                                    last_message_at_ms, deleted_at_ms";
const TURN_COLUMNS: &str =
    "id, conversation_id, role, content, image_ref, created_at_ms, pending";

/// Single SQLite connection shared behind a mutex; every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("create data dir {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<F, R>(&self, op: &'static str, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Connection) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("{op}: blocking task failed: {e}")))?
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let channel: String = row.get(2)?;
    let channel = channel
        .parse::<ChannelKind>()
        .map_err(|e| conversion_error(2, e))?;
    Ok(Conversation {
        id: row.get(0)?,
        thread_handle: row.get(1)?,
        channel,
        owner_id: row.get(3)?,
        title: row.get(4)?,
        created_at: from_ms(row.get(5)?),
        last_message_at: from_ms(row.get(6)?),
        deleted_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
    })
}

fn turn_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let role: String = row.get(2)?;
    let role = role.parse::<TurnRole>().map_err(|e| conversion_error(2, e))?;
    Ok(Turn {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        content: row.get(3)?,
        image_ref: row.get(4)?,
        created_at: from_ms(row.get(5)?),
        pending: row.get::<_, i64>(6)? != 0,
    })
}

fn select_conversation(
    conn: &Connection,
    filter: &str,
    param: &dyn rusqlite::ToSql,
) -> StoreResult<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE {filter}");
    Ok(conn
        .query_row(&sql, [param], conversation_from_row)
        .optional()?)
}

fn select_turn(conn: &Connection, turn_id: i64) -> StoreResult<Option<Turn>> {
    let sql = format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1");
    Ok(conn.query_row(&sql, [turn_id], turn_from_row).optional()?)
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn find_conversation(&self, thread_handle: &str) -> StoreResult<Option<Conversation>> {
        let handle = thread_handle.to_string();
        self.call("find_conversation", move |conn| {
            select_conversation(conn, "thread_handle = ?1", &handle)
        })
        .await
    }

    async fn get_conversation(&self, id: i64) -> StoreResult<Option<Conversation>> {
        self.call("get_conversation", move |conn| {
            select_conversation(conn, "id = ?1", &id)
        })
        .await
    }

    async fn latest_conversation(
        &self,
        channel: ChannelKind,
        owner_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        let owner_id = owner_id.to_string();
        self.call("latest_conversation", move |conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                 WHERE channel = ?1 AND owner_id = ?2 AND deleted_at_ms IS NULL \
                 ORDER BY last_message_at_ms DESC, id DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![channel.as_str(), owner_id], conversation_from_row)
                .optional()?)
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(channel = %new.channel))]
    async fn create_conversation(&self, new: &NewConversation) -> StoreResult<Conversation> {
        let new = new.clone();
        self.call("create_conversation", move |conn| {
            let now = now_ms();
            conn.execute(
                "INSERT INTO conversations \
                 (thread_handle, channel, owner_id, title, created_at_ms, last_message_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    new.thread_handle,
                    new.channel.as_str(),
                    new.owner_id,
                    new.title,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            select_conversation(conn, "id = ?1", &id)?.ok_or_else(|| {
                StoreError::Backend(format!("conversation {id} vanished after insert"))
            })
        })
        .await
    }

    async fn append_turn(
        &self,
        conversation_id: i64,
        role: TurnRole,
        content: &str,
        image_ref: Option<&str>,
    ) -> StoreResult<Turn> {
        let content = content.to_string();
        let image_ref = image_ref.map(str::to_string);
        self.call("append_turn", move |conn| {
            let tx = conn.transaction()?;
            let live: Option<Option<i64>> = tx
                .query_row(
                    "SELECT deleted_at_ms FROM conversations WHERE id = ?1",
                    [conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            match live {
                None => {
                    return Err(StoreError::NotFound(format!(
                        "conversation {conversation_id}"
                    )));
                }
                Some(Some(_)) => {
                    return Err(StoreError::Conflict(format!(
                        "conversation {conversation_id} is deleted"
                    )));
                }
                Some(None) => {}
            }

            let now = now_ms();
            let pending = role == TurnRole::Assistant && content.is_empty();
            tx.execute(
                "INSERT INTO turns (conversation_id, role, content, image_ref, created_at_ms, pending) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conversation_id,
                    role.as_str(),
                    content,
                    image_ref,
                    now,
                    pending as i64
                ],
            )?;
            let turn_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE conversations SET last_message_at_ms = ?1 WHERE id = ?2",
                params![now, conversation_id],
            )?;
            tx.commit()?;

            Ok(Turn {
                id: turn_id,
                conversation_id,
                role,
                content,
                image_ref,
                created_at: from_ms(now),
                pending,
            })
        })
        .await
    }

    async fn patch_turn_content(&self, turn_id: i64, content: &str) -> StoreResult<()> {
        let content = content.to_string();
        self.call("patch_turn_content", move |conn| {
            let changed = conn.execute(
                "UPDATE turns SET content = ?1, pending = 0 WHERE id = ?2 AND pending = 1",
                params![content, turn_id],
            )?;
            if changed == 1 {
                return Ok(());
            }
            match select_turn(conn, turn_id)? {
                Some(_) => Err(StoreError::Conflict(format!(
                    "turn {turn_id} already has its final content"
                ))),
                None => Err(StoreError::NotFound(format!("turn {turn_id}"))),
            }
        })
        .await
    }

    async fn list_turns(
        &self,
        conversation_id: i64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Turn>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        self.call("list_turns", move |conn| {
            let sql = format!(
                "SELECT {TURN_COLUMNS} FROM (\
                    SELECT {TURN_COLUMNS} FROM turns WHERE conversation_id = ?1 \
                    ORDER BY id DESC LIMIT ?2\
                 ) ORDER BY id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let turns = stmt
                .query_map(params![conversation_id, limit], turn_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(turns)
        })
        .await
    }

    async fn get_turn(&self, turn_id: i64) -> StoreResult<Option<Turn>> {
        self.call("get_turn", move |conn| select_turn(conn, turn_id))
            .await
    }

    async fn soft_delete_conversation(&self, id: i64) -> StoreResult<()> {
        self.call("soft_delete_conversation", move |conn| {
            let changed = conn.execute(
                "UPDATE conversations SET deleted_at_ms = ?1 WHERE id = ?2 AND deleted_at_ms IS NULL",
                params![now_ms(), id],
            )?;
            if changed == 0 && select_conversation(conn, "id = ?1", &id)?.is_none() {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn delete_conversation(&self, id: i64) -> StoreResult<()> {
        self.call("delete_conversation", move |conn| {
            let changed = conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
        .await
    }
}

/// Runs `op` up to `RETRY_ATTEMPTS` times, backing off exponentially while it keeps
/// failing with a transient error.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    ?delay,
                    error = %e,
                    "transient storage error; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Store decorator retrying transient failures of every operation.
pub struct RetryingStore {
    inner: Arc<dyn ConversationStore>,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ConversationStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ConversationStore for RetryingStore {
    async fn find_conversation(&self, thread_handle: &str) -> StoreResult<Option<Conversation>> {
        let inner = &self.inner;
        with_retry("find_conversation", move || {
            inner.find_conversation(thread_handle)
        })
        .await
    }

    async fn get_conversation(&self, id: i64) -> StoreResult<Option<Conversation>> {
        let inner = &self.inner;
        with_retry("get_conversation", move || inner.get_conversation(id)).await
    }

    async fn latest_conversation(
        &self,
        channel: ChannelKind,
        owner_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        let inner = &self.inner;
        with_retry("latest_conversation", move || {
            inner.latest_conversation(channel, owner_id)
        })
        .await
    }

    async fn create_conversation(&self, new: &NewConversation) -> StoreResult<Conversation> {
        let inner = &self.inner;
        with_retry("create_conversation", move || inner.create_conversation(new)).await
    }

    async fn append_turn(
        &self,
        conversation_id: i64,
        role: TurnRole,
        content: &str,
        image_ref: Option<&str>,
    ) -> StoreResult<Turn> {
        let inner = &self.inner;
        with_retry("append_turn", move || {
            inner.append_turn(conversation_id, role, content, image_ref)
        })
        .await
    }

    async fn patch_turn_content(&self, turn_id: i64, content: &str) -> StoreResult<()> {
        let inner = &self.inner;
        with_retry("patch_turn_content", move || {
            inner.patch_turn_content(turn_id, content)
        })
        .await
    }

    async fn list_turns(
        &self,
        conversation_id: i64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Turn>> {
        let inner = &self.inner;
        with_retry("list_turns", move || inner.list_turns(conversation_id, limit)).await
    }

    async fn get_turn(&self, turn_id: i64) -> StoreResult<Option<Turn>> {
        let inner = &self.inner;
        with_retry("get_turn", move || inner.get_turn(turn_id)).await
    }

    async fn soft_delete_conversation(&self, id: i64) -> StoreResult<()> {
        let inner = &self.inner;
        with_retry("soft_delete_conversation", move || {
            inner.soft_delete_conversation(id)
        })
        .await
    }

    async fn delete_conversation(&self, id: i64) -> StoreResult<()> {
        let inner = &self.inner;
        with_retry("delete_conversation", move || inner.delete_conversation(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn new_conversation(handle: &str, owner: &str) -> NewConversation {
        NewConversation {
            thread_handle: handle.to_string(),
            channel: ChannelKind::Web,
            owner_id: owner.to_string(),
            title: "Bonjour".to_string(),
        }
    }

    #[tokio::test]
    async fn create_and_find_by_handle() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let created = store
            .create_conversation(&new_conversation("web-u1-1", "u1"))
            .await
            .expect("create conversation");
        assert_eq!(created.channel, ChannelKind::Web);
        assert!(created.deleted_at.is_none());

        let found = store
            .find_conversation("web-u1-1")
            .await
            .expect("find conversation")
            .expect("conversation exists");
        assert_eq!(found, created);
        assert!(
            store
                .get_conversation(created.id + 100)
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn thread_handles_are_unique() {
        let store = SqliteStore::open_in_memory().expect("open store");
        store
            .create_conversation(&new_conversation("dup", "u1"))
            .await
            .expect("first insert");
        let err = store
            .create_conversation(&new_conversation("dup", "u2"))
            .await
            .expect_err("duplicate handle must fail");
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn assistant_turn_is_patched_exactly_once() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let conversation = store
            .create_conversation(&new_conversation("h", "u1"))
            .await
            .expect("create");
        let user = store
            .append_turn(conversation.id, TurnRole::User, "Bonjour", None)
            .await
            .expect("user turn");
        assert!(!user.pending);
        let reply = store
            .append_turn(conversation.id, TurnRole::Assistant, "", None)
            .await
            .expect("assistant turn");
        assert!(reply.pending);

        store
            .patch_turn_content(reply.id, "Salut !")
            .await
            .expect("first patch");
        let err = store
            .patch_turn_content(reply.id, "again")
            .await
            .expect_err("second patch must fail");
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store
            .patch_turn_content(user.id, "edited")
            .await
            .expect_err("user turns are never patched");
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store
            .patch_turn_content(9999, "x")
            .await
            .expect_err("unknown turn");
        assert!(matches!(err, StoreError::NotFound(_)));

        let stored = store
            .get_turn(reply.id)
            .await
            .expect("get turn")
            .expect("turn exists");
        assert_eq!(stored.content, "Salut !");
        assert!(!stored.pending);
    }

    #[tokio::test]
    async fn list_turns_returns_most_recent_in_order() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let conversation = store
            .create_conversation(&new_conversation("h", "u1"))
            .await
            .expect("create");
        for i in 0..5 {
            store
                .append_turn(conversation.id, TurnRole::User, &format!("m{i}"), None)
                .await
                .expect("append");
        }
        let all = store.list_turns(conversation.id, None).await.expect("list");
        assert_eq!(all.len(), 5);
        let last_two = store
            .list_turns(conversation.id, Some(2))
            .await
            .expect("list limited");
        let contents: Vec<_> = last_two.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn latest_conversation_skips_deleted_and_other_channels() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let older = store
            .create_conversation(&NewConversation {
                channel: ChannelKind::Telegram,
                ..new_conversation("tg-1", "42")
            })
            .await
            .expect("create older");
        let newer = store
            .create_conversation(&NewConversation {
                channel: ChannelKind::Telegram,
                ..new_conversation("tg-2", "42")
            })
            .await
            .expect("create newer");
        store
            .create_conversation(&new_conversation("web-1", "42"))
            .await
            .expect("create web");

        let latest = store
            .latest_conversation(ChannelKind::Telegram, "42")
            .await
            .expect("latest")
            .expect("has one");
        assert_eq!(latest.id, newer.id);

        store
            .soft_delete_conversation(newer.id)
            .await
            .expect("soft delete");
        let latest = store
            .latest_conversation(ChannelKind::Telegram, "42")
            .await
            .expect("latest")
            .expect("has one");
        assert_eq!(latest.id, older.id);

        let deleted = store
            .find_conversation("tg-2")
            .await
            .expect("find")
            .expect("soft-deleted rows stay visible by handle");
        assert!(deleted.is_deleted());
    }

    #[tokio::test]
    async fn appending_to_missing_or_deleted_conversation_fails() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let err = store
            .append_turn(77, TurnRole::User, "x", None)
            .await
            .expect_err("missing conversation");
        assert!(matches!(err, StoreError::NotFound(_)));

        let conversation = store
            .create_conversation(&new_conversation("h", "u1"))
            .await
            .expect("create");
        store
            .soft_delete_conversation(conversation.id)
            .await
            .expect("soft delete");
        assert!(
            store
                .append_turn(conversation.id, TurnRole::User, "x", None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn hard_delete_cascades_to_turns() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let conversation = store
            .create_conversation(&new_conversation("h", "u1"))
            .await
            .expect("create");
        let turn = store
            .append_turn(conversation.id, TurnRole::User, "x", Some("img-1"))
            .await
            .expect("append");
        assert_eq!(turn.image_ref.as_deref(), Some("img-1"));

        store
            .delete_conversation(conversation.id)
            .await
            .expect("delete");
        assert!(store.get_turn(turn.id).await.expect("get turn").is_none());
        assert!(matches!(
            store.delete_conversation(conversation.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_a_bounded_number_of_times() {
        let calls = AtomicU32::new(0);
        let result = with_retry("flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Transient("busy".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .expect("third attempt succeeds");
        assert_eq!(result, 2);

        let calls = AtomicU32::new(0);
        let err = with_retry::<(), _, _>("always-busy", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Transient("busy".to_string())) }
        })
        .await
        .expect_err("gives up");
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retry::<(), _, _>("conflict", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Conflict("taken".to_string())) }
        })
        .await
        .expect_err("conflict surfaces");
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retrying_store_delegates() {
        let store = RetryingStore::new(Arc::new(
            SqliteStore::open_in_memory().expect("open store"),
        ));
        let conversation = store
            .create_conversation(&new_conversation("h", "u1"))
            .await
            .expect("create through decorator");
        let turn = store
            .append_turn(conversation.id, TurnRole::Assistant, "", None)
            .await
            .expect("append through decorator");
        store
            .patch_turn_content(turn.id, "done")
            .await
            .expect("patch through decorator");
        assert_eq!(
            store.list_turns(conversation.id, None).await.expect("list")[0].content,
            "done"
        );
    }
}
