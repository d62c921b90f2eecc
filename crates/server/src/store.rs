//! Durable message storage.
//!
//! Messages live in the same SQLite database as users and sessions.
//! This is the single source of truth the in-memory projections are
//! rebuilt from; live fan-out happens only after a write succeeds here.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::models::{ConversationSummary, Message, MessageKind};

/// Storage failures the callers can tell apart.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message not found")]
    NotFound,
    #[error("acting identity is not the sender")]
    Forbidden,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Input for a new message row.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub text: Option<String>,
    pub attachment: Option<String>,
    pub kind: MessageKind,
    pub duration_secs: Option<i64>,
}

type MessageRow = (
    String,         // id
    String,         // sender_id
    String,         // receiver_id
    Option<String>, // text
    Option<String>, // attachment
    String,         // kind
    Option<i64>,    // duration_secs
    String,         // created_at
    Option<String>, // edited_at
    bool,           // deleted
    Option<String>, // read_at
);

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, text, attachment, kind, \
                               duration_secs, created_at, edited_at, deleted, read_at";

fn row_to_message(row: MessageRow) -> Message {
    let (id, sender_id, receiver_id, text, attachment, kind, duration_secs, created_at, edited_at, deleted, read_at) =
        row;
    Message {
        id,
        sender_id,
        receiver_id,
        text,
        attachment,
        kind: MessageKind::from_db(&kind),
        duration_secs,
        created_at: parse_ts(&created_at),
        edited_at: edited_at.as_deref().map(parse_ts),
        deleted,
        read_at: read_at.as_deref().map(parse_ts),
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

/// Message store backed by SQLite.
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Open (or create) the database and ensure the messages table exists.
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                text TEXT,
                attachment TEXT,
                kind TEXT NOT NULL DEFAULT 'text',
                duration_secs INTEGER,
                created_at TEXT NOT NULL,
                edited_at TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                read_at TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair \
             ON messages (sender_id, receiver_id, created_at)",
        )
        .execute(&pool)
        .await?;

        info!("[Store] Message store initialized at {:?}", db_path);

        Ok(Self { pool })
    }

    /// Persist a new message and return the stored row.
    pub async fn create_message(&self, input: NewMessage) -> Result<Message, StoreError> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender_id: input.sender_id,
            receiver_id: input.receiver_id,
            text: input.text,
            attachment: input.attachment,
            kind: input.kind,
            duration_secs: input.duration_secs,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
            read_at: None,
        };

        sqlx::query(
            "INSERT INTO messages \
             (id, sender_id, receiver_id, text, attachment, kind, duration_secs, created_at, deleted) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&message.id)
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.text)
        .bind(&message.attachment)
        .bind(message.kind.as_str())
        .bind(message.duration_secs)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// Fetch one message by id, tombstones included.
    pub async fn get_message(&self, id: &str) -> Result<Message, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_message).ok_or(StoreError::NotFound)
    }

    /// History between two identities, oldest first. Soft-deleted rows are
    /// returned as tombstones so clients can render them in place.
    pub async fn fetch_conversation(
        &self,
        owner_id: &str,
        other_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE (sender_id = ?1 AND receiver_id = ?2) \
                OR (sender_id = ?2 AND receiver_id = ?1) \
             ORDER BY created_at DESC LIMIT ?3"
        ))
        .bind(owner_id)
        .bind(other_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(row_to_message).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Replace a message's text. Only the original sender may edit, and
    /// deleted messages cannot be edited.
    pub async fn edit_message(
        &self,
        id: &str,
        new_text: &str,
        acting_id: &str,
    ) -> Result<Message, StoreError> {
        let mut message = self.get_message(id).await?;
        if message.deleted {
            return Err(StoreError::NotFound);
        }
        if message.sender_id != acting_id {
            return Err(StoreError::Forbidden);
        }

        let edited_at = Utc::now();
        sqlx::query("UPDATE messages SET text = ?, edited_at = ? WHERE id = ?")
            .bind(new_text)
            .bind(edited_at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        message.text = Some(new_text.to_string());
        message.edited_at = Some(edited_at);
        Ok(message)
    }

    /// Soft-delete a message: payload cleared, tombstone flag set. Only the
    /// original sender may delete.
    pub async fn soft_delete_message(
        &self,
        id: &str,
        acting_id: &str,
    ) -> Result<Message, StoreError> {
        let mut message = self.get_message(id).await?;
        if message.deleted {
            return Err(StoreError::NotFound);
        }
        if message.sender_id != acting_id {
            return Err(StoreError::Forbidden);
        }

        sqlx::query("UPDATE messages SET text = NULL, attachment = NULL, deleted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        message.text = None;
        message.attachment = None;
        message.deleted = true;
        Ok(message)
    }

    /// Mark every unread message from `other` to `owner` as read.
    pub async fn mark_read(&self, owner_id: &str, other_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages SET read_at = ? \
             WHERE sender_id = ? AND receiver_id = ? AND read_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(other_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Aggregate conversation summaries for one owner: the latest message
    /// per counterpart plus the unread count. Used to rebuild the
    /// projection cache on a cold start or cache miss.
    pub async fn fetch_conversation_summaries(
        &self,
        owner_id: &str,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        // RFC 3339 UTC strings compare lexicographically in time order, so
        // MAX(created_at) picks the newest row per counterpart.
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS}, MAX(created_at) FROM messages \
             WHERE sender_id = ?1 OR receiver_id = ?1 \
             GROUP BY CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END \
             ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let message = row_to_message(row);
            let other_id = if message.sender_id == owner_id {
                message.receiver_id.clone()
            } else {
                message.sender_id.clone()
            };

            let (unread,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM messages \
                 WHERE sender_id = ? AND receiver_id = ? AND read_at IS NULL AND deleted = 0",
            )
            .bind(&other_id)
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

            summaries.push(ConversationSummary {
                other_user_id: other_id,
                last_message: message.preview(),
                last_message_kind: message.kind,
                last_message_time: message.created_at,
                unread_count: unread,
            });
        }

        Ok(summaries)
    }

    /// Remove both sides of an identity's message history (account deletion).
    pub async fn delete_user_history(&self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE sender_id = ? OR receiver_id = ?")
            .bind(user_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, MessageStore) {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(&dir.path().join("test.sqlite"))
            .await
            .unwrap();
        (dir, store)
    }

    fn text_message(sender: &str, receiver: &str, text: &str) -> NewMessage {
        NewMessage {
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            text: Some(text.to_string()),
            attachment: None,
            kind: MessageKind::Text,
            duration_secs: None,
        }
    }

    #[tokio::test]
    async fn creates_and_fetches_conversation_in_order() {
        let (_dir, store) = open_store().await;

        store.create_message(text_message("a", "b", "first")).await.unwrap();
        store.create_message(text_message("b", "a", "second")).await.unwrap();
        store.create_message(text_message("a", "c", "unrelated")).await.unwrap();

        let history = store.fetch_conversation("a", "b", 100).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text.as_deref(), Some("first"));
        assert_eq!(history[1].text.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn edit_requires_original_sender() {
        let (_dir, store) = open_store().await;
        let msg = store.create_message(text_message("a", "b", "hi")).await.unwrap();

        let err = store.edit_message(&msg.id, "hacked", "b").await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden));

        let edited = store.edit_message(&msg.id, "hi there", "a").await.unwrap();
        assert_eq!(edited.text.as_deref(), Some("hi there"));
        assert!(edited.edited_at.is_some());
    }

    #[tokio::test]
    async fn delete_is_soft_and_clears_payload() {
        let (_dir, store) = open_store().await;
        let msg = store.create_message(text_message("a", "b", "secret")).await.unwrap();

        let err = store.soft_delete_message(&msg.id, "b").await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden));

        let deleted = store.soft_delete_message(&msg.id, "a").await.unwrap();
        assert!(deleted.deleted);
        assert!(deleted.text.is_none());

        // The tombstone still appears in history.
        let history = store.fetch_conversation("b", "a", 100).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].deleted);

        // A second delete reports not-found.
        let err = store.soft_delete_message(&msg.id, "a").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn missing_message_is_not_found() {
        let (_dir, store) = open_store().await;
        let err = store.edit_message("nope", "text", "a").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn summaries_aggregate_last_message_and_unread() {
        let (_dir, store) = open_store().await;

        store.create_message(text_message("b", "a", "one")).await.unwrap();
        store.create_message(text_message("b", "a", "two")).await.unwrap();
        store
            .create_message(NewMessage {
                attachment: Some("cat.jpg".into()),
                kind: MessageKind::Image,
                ..text_message("c", "a", "")
            })
            .await
            .unwrap();

        let summaries = store.fetch_conversation_summaries("a").await.unwrap();
        assert_eq!(summaries.len(), 2);

        // Most recent conversation first.
        assert_eq!(summaries[0].other_user_id, "c");
        assert_eq!(summaries[0].last_message, "\u{1F4F7} Photo");
        assert_eq!(summaries[0].unread_count, 1);

        assert_eq!(summaries[1].other_user_id, "b");
        assert_eq!(summaries[1].last_message, "two");
        assert_eq!(summaries[1].unread_count, 2);

        store.mark_read("a", "b").await.unwrap();
        let summaries = store.fetch_conversation_summaries("a").await.unwrap();
        assert_eq!(summaries[1].unread_count, 0);
    }
}
