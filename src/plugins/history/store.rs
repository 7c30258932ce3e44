//! Conversation storage backed by libSQL (Turso).
//!
//! Uses the `libsql` async client so the same code serves:
//! - Remote Turso/libSQL databases via `TURSO_DATABASE_URL` / `LIBSQL_DATABASE_URL` (+ token).
//! - A local `history.db` file in the data directory.

use std::future::Future;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libsql::{params, Builder, Database, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::types::{ChatMessage, Conversation, ConversationSummary, MediaAttachments, MessageRole};
use super::HistoryError;

const HISTORY_DB_BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REMOTE_CONNECTIONS: usize = 8;
const MAX_LOCAL_CONNECTIONS: usize = 4;
/// Transcripts serializing above this size lose oversized media before saving.
pub const MAX_SAVE_BYTES: usize = 4_000_000;

/// Persistence contract used by the chat core.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Inserts or replaces the conversation and its messages.
    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), HistoryError>;
    async fn load_conversation(&self, id: &str) -> Result<Conversation, HistoryError>;
    /// Newest first.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, HistoryError>;
    async fn delete_conversation(&self, id: &str) -> Result<(), HistoryError>;
    async fn get_setting(&self, key: &str) -> Result<Option<String>, HistoryError>;
    async fn save_setting(&self, key: &str, value: &str) -> Result<(), HistoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbMode {
    Remote,
    Local,
}

#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<HistoryStoreInner>,
}

struct HistoryStoreInner {
    db: Database,
    db_mode: DbMode,
    /// Serialize *writes* for local file databases to reduce SQLITE_BUSY contention.
    /// Disabled for remote databases to avoid serializing network latency.
    write_gate: Option<Arc<Semaphore>>,
    conn_gate: Arc<Semaphore>,
}

/// A libSQL connection holding one slot of the connection gate.
struct GatedConnection {
    conn: libsql::Connection,
    _permit: OwnedSemaphorePermit,
}

impl Deref for GatedConnection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

async fn retry_db_locked<T, Fut, F>(mut op: F) -> Result<T, HistoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HistoryError>>,
{
    let mut delay = Duration::from_millis(25);
    for attempt in 0..5 {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if attempt >= 4 || !matches!(err, HistoryError::Locked { .. }) {
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(400));
            }
        }
    }
    Err(HistoryError::locked("History DB retry exhausted"))
}

fn env_value(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Drops oversized media when the whole transcript would serialize above [`MAX_SAVE_BYTES`].
pub(crate) fn compact_for_save(messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, HistoryError> {
    let size = serde_json::to_string(messages)?.len();
    if size <= MAX_SAVE_BYTES {
        return Ok(messages.to_vec());
    }
    log::warn!(
        "Conversation payload is {} bytes; dropping oversized media before saving",
        size
    );
    Ok(messages
        .iter()
        .map(|m| {
            let mut m = m.clone();
            m.media = m.media.without_oversized();
            m
        })
        .collect())
}

fn like_pattern(keyword: &str) -> String {
    let escaped = keyword
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn summary_from_row(row: &libsql::Row) -> Result<ConversationSummary, HistoryError> {
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let timestamp_ms: i64 = row.get(2)?;
    let message_count: i64 = row.get(3)?;
    Ok(ConversationSummary {
        id,
        title,
        timestamp: timestamp_ms.max(0) as u64,
        message_count: message_count.max(0) as usize,
    })
}

impl HistoryStore {
    pub async fn open_local(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        log::info!("History DB: using local file {}", path_str);
        let db = Builder::new_local(path_str).build().await?;
        Self::from_database(db, DbMode::Local).await
    }

    pub async fn open_remote(url: String, token: String) -> Result<Self, HistoryError> {
        log::info!("History DB: using remote Turso/libSQL");
        let db = Builder::new_remote(url, token).build().await?;
        Self::from_database(db, DbMode::Remote).await
    }

    /// Remote when Turso credentials are configured, else the local data directory.
    pub async fn open_default() -> Result<Self, HistoryError> {
        let url = env_value(&["TURSO_DATABASE_URL", "LIBSQL_DATABASE_URL"]);
        let token = env_value(&["TURSO_AUTH_TOKEN", "LIBSQL_AUTH_TOKEN"]);
        if let (Some(url), Some(token)) = (url, token) {
            return Self::open_remote(url, token).await;
        }

        let path = crate::services::paths::history_db_path().map_err(HistoryError::internal)?;
        Self::open_local(path).await
    }

    async fn from_database(db: Database, db_mode: DbMode) -> Result<Self, HistoryError> {
        let (conn_limit, write_gate) = match db_mode {
            DbMode::Remote => (MAX_REMOTE_CONNECTIONS, None),
            DbMode::Local => (MAX_LOCAL_CONNECTIONS, Some(Arc::new(Semaphore::new(1)))),
        };
        let store = Self {
            inner: Arc::new(HistoryStoreInner {
                db,
                db_mode,
                write_gate,
                conn_gate: Arc::new(Semaphore::new(conn_limit)),
            }),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn connect(&self) -> Result<GatedConnection, HistoryError> {
        let permit = self
            .inner
            .conn_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HistoryError::internal("History DB connection gate closed"))?;

        let conn = self.inner.db.connect()?;

        // Best-effort per-connection pragmas; remote databases may ignore them.
        if self.inner.db_mode == DbMode::Local {
            let _ = conn.busy_timeout(HISTORY_DB_BUSY_TIMEOUT);
            let _ = conn.query("PRAGMA journal_mode = WAL;", ()).await;
            let _ = conn.query("PRAGMA synchronous = NORMAL;", ()).await;
        }
        let _ = conn.query("PRAGMA foreign_keys = ON;", ()).await;

        Ok(GatedConnection {
            conn,
            _permit: permit,
        })
    }

    async fn write_permit(&self) -> Result<Option<OwnedSemaphorePermit>, HistoryError> {
        let Some(gate) = self.inner.write_gate.as_ref() else {
            return Ok(None);
        };
        gate.clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| HistoryError::internal("History DB write gate closed"))
    }

    async fn migrate(&self) -> Result<(), HistoryError> {
        let conn = self.connect().await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (\n  key TEXT PRIMARY KEY NOT NULL,\n  value TEXT NOT NULL\n);",
            (),
        )
        .await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (\n  id TEXT PRIMARY KEY NOT NULL,\n  title TEXT NOT NULL,\n  timestamp_ms INTEGER NOT NULL,\n  message_count INTEGER NOT NULL DEFAULT 0\n);",
            (),
        )
        .await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (\n  conversation_id TEXT NOT NULL,\n  seq INTEGER NOT NULL,\n  id TEXT NOT NULL,\n  role TEXT NOT NULL,\n  content TEXT NOT NULL,\n  media TEXT NOT NULL DEFAULT '',\n  timestamp_ms INTEGER,\n  PRIMARY KEY (conversation_id, seq),\n  FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE\n);",
            (),
        )
        .await?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversations_timestamp ON conversations(timestamp_ms);",
            (),
        )
        .await?;

        Ok(())
    }

    /// Conversations whose title or any message contains `keyword`, newest first.
    pub async fn search_conversations(
        &self,
        keyword: &str,
    ) -> Result<Vec<ConversationSummary>, HistoryError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return self.list_conversations().await;
        }

        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT c.id, c.title, c.timestamp_ms, c.message_count\n   FROM conversations c\n  WHERE c.title LIKE ?1 ESCAPE '\\'\n     OR EXISTS (\n       SELECT 1 FROM messages m\n        WHERE m.conversation_id = c.id AND m.content LIKE ?1 ESCAPE '\\'\n     )\n  ORDER BY c.timestamp_ms DESC;",
                params![like_pattern(keyword)],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(summary_from_row(&row)?);
        }
        Ok(out)
    }

    /// Keeps the `keep_recent` newest conversations and deletes the rest.
    /// Returns the number of conversations removed.
    pub async fn cleanup(&self, keep_recent: usize) -> Result<usize, HistoryError> {
        let keep = keep_recent as i64;
        let removed = retry_db_locked(|| async {
            let _write = self.write_permit().await?;
            let conn = self.connect().await?;
            let tx = conn.transaction().await?;
            tx.execute(
                "DELETE FROM messages\n WHERE conversation_id NOT IN (\n   SELECT id FROM conversations ORDER BY timestamp_ms DESC LIMIT ?1\n );",
                params![keep],
            )
            .await?;
            let removed = tx
                .execute(
                    "DELETE FROM conversations\n WHERE id NOT IN (\n   SELECT id FROM conversations ORDER BY timestamp_ms DESC LIMIT ?1\n );",
                    params![keep],
                )
                .await?;
            tx.commit().await?;
            Ok(removed as usize)
        })
        .await?;

        if removed > 0 {
            log::info!("History cleanup removed {} conversations", removed);
        }
        Ok(removed)
    }
}

#[async_trait]
impl ConversationStore for HistoryStore {
    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        if conversation.id.trim().is_empty() {
            return Err(HistoryError::invalid_input("Conversation id is empty"));
        }

        let messages = compact_for_save(&conversation.messages)?;
        let mut rows: Vec<Vec<Value>> = Vec::with_capacity(messages.len());
        for (idx, message) in messages.iter().enumerate() {
            let media = if message.media.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&message.media)?
            };
            rows.push(vec![
                Value::from(conversation.id.as_str()),
                Value::from((idx + 1) as i64),
                Value::from(message.id.as_str()),
                Value::from(message.role.as_str()),
                Value::from(message.content.as_str()),
                Value::from(media),
                message
                    .timestamp
                    .map(|t| Value::from(t as i64))
                    .unwrap_or(Value::Null),
            ]);
        }

        let id = conversation.id.as_str();
        let title = conversation.title.as_str();
        let timestamp_ms = conversation.timestamp as i64;
        let message_count = messages.len() as i64;

        retry_db_locked(|| async {
            let _write = self.write_permit().await?;
            let conn = self.connect().await?;
            let tx = conn.transaction().await?;

            tx.execute(
                "INSERT INTO conversations (id, title, timestamp_ms, message_count)\nVALUES (?1, ?2, ?3, ?4)\nON CONFLICT(id) DO UPDATE SET\n  title = excluded.title,\n  timestamp_ms = excluded.timestamp_ms,\n  message_count = excluded.message_count;",
                params![id, title, timestamp_ms, message_count],
            )
            .await?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1;",
                params![id],
            )
            .await?;

            for row in &rows {
                tx.execute(
                    "INSERT INTO messages (conversation_id, seq, id, role, content, media, timestamp_ms)\nVALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
                    row.clone(),
                )
                .await?;
            }

            tx.commit().await?;
            Ok(())
        })
        .await?;

        log::debug!(
            "Saved conversation {} ({} messages)",
            conversation.id,
            message_count
        );
        Ok(())
    }

    async fn load_conversation(&self, id: &str) -> Result<Conversation, HistoryError> {
        let conn = self.connect().await?;

        let mut conv_rows = conn
            .query(
                "SELECT id, title, timestamp_ms, message_count\n   FROM conversations\n  WHERE id = ?1\n  LIMIT 1;",
                params![id],
            )
            .await?;
        let conv_row = conv_rows
            .next()
            .await?
            .ok_or_else(|| HistoryError::not_found("Conversation not found"))?;
        let summary = summary_from_row(&conv_row)?;

        let mut msg_rows = conn
            .query(
                "SELECT id, role, content, media, timestamp_ms\n   FROM messages\n  WHERE conversation_id = ?1\n  ORDER BY seq ASC;",
                params![id],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = msg_rows.next().await? {
            let message_id: String = row.get(0)?;
            let role_str: String = row.get(1)?;
            let Some(role) = MessageRole::parse(&role_str) else {
                log::warn!("Skipping message {} with unknown role {:?}", message_id, role_str);
                continue;
            };
            let content: String = row.get(2)?;
            let media_json: String = row.get(3)?;
            let media = if media_json.is_empty() {
                MediaAttachments::default()
            } else {
                serde_json::from_str(&media_json)?
            };
            let timestamp = row.get::<i64>(4).ok().map(|t| t.max(0) as u64);

            messages.push(ChatMessage {
                id: message_id,
                role,
                content,
                media,
                timestamp,
                has_media: false,
            });
        }

        Ok(Conversation {
            id: summary.id,
            title: summary.title,
            message_count: summary.message_count.max(messages.len()),
            messages,
            timestamp: summary.timestamp,
        })
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, HistoryError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, title, timestamp_ms, message_count\n   FROM conversations\n  ORDER BY timestamp_ms DESC;",
                (),
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(summary_from_row(&row)?);
        }
        Ok(out)
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), HistoryError> {
        retry_db_locked(|| async {
            let _write = self.write_permit().await?;
            let conn = self.connect().await?;
            let tx = conn.transaction().await?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1;",
                params![id],
            )
            .await?;
            let deleted = tx
                .execute("DELETE FROM conversations WHERE id = ?1;", params![id])
                .await?;
            if deleted == 0 {
                return Err(HistoryError::not_found("Conversation not found"));
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, HistoryError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT value FROM settings WHERE key = ?1 LIMIT 1;",
                params![key],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?)),
            None => Ok(None),
        }
    }

    async fn save_setting(&self, key: &str, value: &str) -> Result<(), HistoryError> {
        if key.trim().is_empty() {
            return Err(HistoryError::invalid_input("Setting key is empty"));
        }
        retry_db_locked(|| async {
            let _write = self.write_permit().await?;
            let conn = self.connect().await?;
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)\nON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                params![key, value],
            )
            .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn open_temp() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open_local(dir.path().join("history.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn conversation(id: &str, timestamp: u64, user_text: &str, answer: &str) -> Conversation {
        let messages = vec![
            ChatMessage::new(MessageRole::User, user_text, timestamp),
            ChatMessage::new(MessageRole::Assistant, answer, timestamp + 1),
        ];
        Conversation::from_messages(id, &messages, timestamp)
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let (_dir, store) = open_temp().await;
        let mut conv = conversation("c1", 100, "describe this", "a cat");
        conv.messages[0].media.image = Some("data:image/png;base64,QUJD".to_string());

        store.save_conversation(&conv).await.unwrap();
        let loaded = store.load_conversation("c1").await.unwrap();
        assert_eq!(loaded, conv);
        assert_eq!(loaded.title, "describe this");
    }

    #[tokio::test]
    async fn save_replaces_existing_messages() {
        let (_dir, store) = open_temp().await;
        let mut conv = conversation("c1", 100, "q", "a");
        store.save_conversation(&conv).await.unwrap();

        conv.messages.push(ChatMessage::new(MessageRole::User, "follow-up", 103));
        conv.messages.push(ChatMessage::new(MessageRole::Assistant, "more", 104));
        conv.message_count = conv.messages.len();
        conv.timestamp = 104;
        store.save_conversation(&conv).await.unwrap();

        let loaded = store.load_conversation("c1").await.unwrap();
        assert_eq!(loaded.messages.len(), 4);
        assert_eq!(loaded.message_count, 4);
        assert_eq!(store.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_delete_removes() {
        let (_dir, store) = open_temp().await;
        store
            .save_conversation(&conversation("old", 100, "first", "a"))
            .await
            .unwrap();
        store
            .save_conversation(&conversation("new", 200, "second", "b"))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_conversations()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);

        store.delete_conversation("old").await.unwrap();
        assert!(matches!(
            store.load_conversation("old").await,
            Err(HistoryError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_conversation("old").await,
            Err(HistoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn settings_upsert() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.get_setting("language").await.unwrap(), None);
        store.save_setting("language", "zh").await.unwrap();
        store.save_setting("language", "en").await.unwrap();
        assert_eq!(
            store.get_setting("language").await.unwrap(),
            Some("en".to_string())
        );
    }

    #[tokio::test]
    async fn unreadable_setting_is_an_error() {
        let (_dir, store) = open_temp().await;
        {
            let conn = store.connect().await.unwrap();
            conn.execute(
                "INSERT INTO settings (key, value) VALUES ('theme', x'00ff');",
                (),
            )
            .await
            .unwrap();
        }
        assert!(matches!(
            store.get_setting("theme").await,
            Err(HistoryError::Database { .. })
        ));
    }

    #[tokio::test]
    async fn search_matches_titles_and_content() {
        let (_dir, store) = open_temp().await;
        store
            .save_conversation(&conversation("c1", 100, "rust lifetimes", "borrowing"))
            .await
            .unwrap();
        store
            .save_conversation(&conversation("c2", 200, "cooking", "100% pasta"))
            .await
            .unwrap();

        let hits = store.search_conversations("borrow").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c1");

        let percent = store.search_conversations("100%").await.unwrap();
        assert_eq!(percent.len(), 1);
        assert_eq!(percent[0].id, "c2");

        assert_eq!(store.search_conversations("  ").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cleanup_keeps_most_recent() {
        let (_dir, store) = open_temp().await;
        for i in 0..5u64 {
            store
                .save_conversation(&conversation(&format!("c{i}"), 100 + i * 10, "q", "a"))
                .await
                .unwrap();
        }
        assert_eq!(store.cleanup(2).await.unwrap(), 3);
        let ids: Vec<String> = store
            .list_conversations()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["c4".to_string(), "c3".to_string()]);
    }

    #[test]
    fn compact_for_save_drops_oversized_media_only_when_needed() {
        let small = ChatMessage::new(MessageRole::User, "hi", 1).with_media(MediaAttachments {
            video_base64: Some("AAAA".to_string()),
            ..Default::default()
        });
        assert_eq!(compact_for_save(&[small.clone()]).unwrap(), vec![small]);

        let big = ChatMessage::new(MessageRole::User, "hi", 1).with_media(MediaAttachments {
            image: Some("x".repeat(MAX_SAVE_BYTES)),
            pdf_images: Some(vec!["p".to_string()]),
            ..Default::default()
        });
        let compacted = compact_for_save(&[big]).unwrap();
        assert_eq!(compacted[0].media.image, None);
        assert_eq!(compacted[0].media.pdf_images, Some(vec!["p".to_string()]));
    }
}
