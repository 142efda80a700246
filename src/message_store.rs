//! Message/Session persistence (spec §3, §6.3).
//!
//! SQLite-backed via `sqlx`, mirroring the store-with-`init_schema`-on-`new`
//! pattern the teacher uses throughout its own session stores. This is the
//! "message record" side of §6.3: the `extra_data` block carries the
//! thoughts/actions/observations/documents side channels as JSON.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    Assistant,
    SystemSummary,
}

impl SenderKind {
    fn as_str(&self) -> &'static str {
        match self {
            SenderKind::User => "user",
            SenderKind::Assistant => "assistant",
            SenderKind::SystemSummary => "system_summary",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "assistant" => SenderKind::Assistant,
            "system_summary" => SenderKind::SystemSummary,
            _ => SenderKind::User,
        }
    }
}

/// Side-channel data recorded alongside an assistant message (spec §6.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraData {
    #[serde(default)]
    pub thoughts: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default)]
    pub documents: Vec<DocumentCitation>,
    #[serde(default)]
    pub file_info: Option<FileInfo>,
    #[serde(default)]
    pub location: Option<serde_json::Value>,
    #[serde(default)]
    pub cache_sourced: bool,
    /// Set whenever this message's answer was written to (or served from)
    /// the QA cache, so a later regenerate can invalidate the right entry.
    #[serde(default)]
    pub thought_chain_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCitation {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub url: String,
    pub mime: String,
    pub size: u64,
    pub extracted_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub sender_kind: SenderKind,
    pub content: String,
    pub extra_data: ExtraData,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub last_message_excerpt: String,
    pub created_at: i64,
    pub updated_at: i64,
}

pub const PLACEHOLDER_SESSION_NAME: &str = "New conversation";

pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                last_message_excerpt TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                sender_kind TEXT NOT NULL,
                content TEXT NOT NULL,
                extra_data TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to initialise message store schema")?;
        Ok(())
    }

    pub async fn create_session(&self, user_id: &str) -> Result<Session> {
        let now = Utc::now().timestamp();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: PLACEHOLDER_SESSION_NAME.to_string(),
            last_message_excerpt: String::new(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO sessions (id, user_id, name, last_message_excerpt, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.name)
        .bind(&session.last_message_excerpt)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to persist new session")?;
        Ok(session)
    }

    pub async fn insert_message(
        &self,
        session_id: &str,
        sender_kind: SenderKind,
        content: &str,
        extra_data: &ExtraData,
    ) -> Result<Message> {
        let now = Utc::now().timestamp();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sender_kind,
            content: content.to_string(),
            extra_data: extra_data.clone(),
            created_at: now,
        };
        let extra_json = serde_json::to_string(extra_data).context("failed to serialise extra_data")?;

        sqlx::query(
            "INSERT INTO messages (id, session_id, sender_kind, content, extra_data, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(sender_kind.as_str())
        .bind(content)
        .bind(&extra_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to persist message")?;

        let excerpt: String = content.chars().take(120).collect();
        sqlx::query("UPDATE sessions SET last_message_excerpt = ?, updated_at = ? WHERE id = ?")
            .bind(&excerpt)
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("failed to update session excerpt")?;

        Ok(message)
    }

    pub async fn messages_for_session(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows: Vec<(String, String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, session_id, sender_kind, content, extra_data, created_at FROM messages WHERE session_id = ? ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load session messages")?;

        rows.into_iter()
            .map(|(id, session_id, sender_kind, content, extra_json, created_at)| {
                let extra_data = serde_json::from_str(&extra_json).unwrap_or_default();
                Ok(Message {
                    id,
                    session_id,
                    sender_kind: SenderKind::parse(&sender_kind),
                    content,
                    extra_data,
                    created_at,
                })
            })
            .collect()
    }

    /// Rename the session only if its name is still the placeholder (spec §4.8 auto-name policy).
    pub async fn rename_if_placeholder(&self, session_id: &str, new_name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE sessions SET name = ? WHERE id = ? AND name = ?")
            .bind(new_name)
            .bind(session_id)
            .bind(PLACEHOLDER_SESSION_NAME)
            .execute(&self.pool)
            .await
            .context("failed to rename session")?;
        Ok(result.rows_affected() > 0)
    }

    /// Look up a single message by id; used to inspect the message being
    /// replaced by a regenerate-in-place request (spec §6.1).
    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let row: Option<(String, String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, session_id, sender_kind, content, extra_data, created_at FROM messages WHERE id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load message")?;

        Ok(row.map(|(id, session_id, sender_kind, content, extra_json, created_at)| Message {
            id,
            session_id,
            sender_kind: SenderKind::parse(&sender_kind),
            content,
            extra_data: serde_json::from_str(&extra_json).unwrap_or_default(),
            created_at,
        }))
    }

    /// Delete a message by id; used for regenerate-in-place (spec §6.1 `regenerate_message_id`).
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("failed to delete message")?;
        Ok(())
    }

    /// Delete a session and cascade-delete its messages (spec §3 invariant).
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("failed to cascade-delete session messages")?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("failed to delete session")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> MessageStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        MessageStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn create_session_has_placeholder_name() {
        let store = test_store().await;
        let session = store.create_session("user-1").await.unwrap();
        assert_eq!(session.name, PLACEHOLDER_SESSION_NAME);
    }

    #[tokio::test]
    async fn insert_and_load_messages_round_trips() {
        let store = test_store().await;
        let session = store.create_session("user-1").await.unwrap();
        store
            .insert_message(&session.id, SenderKind::User, "hello", &ExtraData::default())
            .await
            .unwrap();
        store
            .insert_message(&session.id, SenderKind::Assistant, "hi there", &ExtraData::default())
            .await
            .unwrap();

        let messages = store.messages_for_session(&session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].sender_kind, SenderKind::Assistant);
    }

    #[tokio::test]
    async fn rename_if_placeholder_only_overwrites_placeholder() {
        let store = test_store().await;
        let session = store.create_session("user-1").await.unwrap();
        assert!(store.rename_if_placeholder(&session.id, "Trip to Tokyo").await.unwrap());
        assert!(!store.rename_if_placeholder(&session.id, "Something else").await.unwrap());
    }

    #[tokio::test]
    async fn get_message_round_trips_thought_chain_id() {
        let store = test_store().await;
        let session = store.create_session("user-1").await.unwrap();
        let extra = ExtraData { cache_sourced: true, thought_chain_id: Some("tcid-1".to_string()), ..Default::default() };
        let inserted = store.insert_message(&session.id, SenderKind::Assistant, "cached answer", &extra).await.unwrap();

        let fetched = store.get_message(&inserted.id).await.unwrap().unwrap();
        assert!(fetched.extra_data.cache_sourced);
        assert_eq!(fetched.extra_data.thought_chain_id.as_deref(), Some("tcid-1"));
        assert!(store.get_message("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_session_cascades_to_messages() {
        let store = test_store().await;
        let session = store.create_session("user-1").await.unwrap();
        store
            .insert_message(&session.id, SenderKind::User, "hello", &ExtraData::default())
            .await
            .unwrap();
        store.delete_session(&session.id).await.unwrap();
        let messages = store.messages_for_session(&session.id).await.unwrap();
        assert!(messages.is_empty());
    }
}
