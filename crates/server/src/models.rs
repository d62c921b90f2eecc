//! Shared data types: messages, conversation summaries, and the closed
//! event enums exchanged over the live connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a direct message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Voice,
    File,
    VideoNote,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Voice => "voice",
            MessageKind::File => "file",
            MessageKind::VideoNote => "video_note",
        }
    }

    /// Parse the database representation. Unknown values fall back to text.
    pub fn from_db(s: &str) -> Self {
        match s {
            "image" => MessageKind::Image,
            "video" => MessageKind::Video,
            "voice" => MessageKind::Voice,
            "file" => MessageKind::File,
            "video_note" => MessageKind::VideoNote,
            _ => MessageKind::Text,
        }
    }

    /// Infer a kind from a MIME type, as uploads without an explicit kind do.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image") {
            MessageKind::Image
        } else if mime.starts_with("video") {
            MessageKind::Video
        } else if mime.starts_with("audio") {
            MessageKind::Voice
        } else {
            MessageKind::File
        }
    }

    /// Fixed human-readable preview label for non-text kinds.
    pub fn preview_label(&self) -> Option<&'static str> {
        match self {
            MessageKind::Text => None,
            MessageKind::Image => Some("\u{1F4F7} Photo"),
            MessageKind::Video => Some("\u{1F3A5} Video"),
            MessageKind::Voice => Some("\u{1F3A4} Voice message"),
            MessageKind::File => Some("\u{1F4CE} File"),
            MessageKind::VideoNote => Some("\u{1F4F9} Video message"),
        }
    }
}

/// A durable direct message between two identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: Option<String>,
    /// Stored attachment file name, if any.
    pub attachment: Option<String>,
    pub kind: MessageKind,
    /// Clip length for voice and video-note messages.
    pub duration_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Preview text shown in conversation lists. Media kinds map to a
    /// fixed label regardless of any caption.
    pub fn preview(&self) -> String {
        if self.deleted {
            return "Message deleted".to_string();
        }
        match self.kind.preview_label() {
            Some(label) => label.to_string(),
            None => self.text.clone().unwrap_or_default(),
        }
    }
}

/// Cached per-owner view of one conversation: last message and unread count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub other_user_id: String,
    pub last_message: String,
    #[serde(rename = "last_message_type")]
    pub last_message_kind: MessageKind,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: i64,
}

/// Events pushed to a live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    PeerOnline { user_id: String },
    PeerOffline { user_id: String },
    MessageDelivered { message: Message },
    MessageEdited { message: Message },
    MessageDeleted { message: Message },
    TypingStart { user_id: String },
    TypingStop { user_id: String },
    SelfAck { message: Message },
}

/// Events a connected client sends over the live connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Send {
        receiver_id: String,
        text: String,
    },
    Edit {
        message_id: String,
        text: String,
    },
    Delete {
        message_id: String,
    },
    TypingStart {
        receiver_id: String,
    },
    TypingStop {
        receiver_id: String,
    },
    /// The client opened a conversation: marks it read and suppresses
    /// unread increments while it stays open.
    OpenConversation {
        user_id: String,
    },
    CloseConversation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_db_representation() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::Video,
            MessageKind::Voice,
            MessageKind::File,
            MessageKind::VideoNote,
        ] {
            assert_eq!(MessageKind::from_db(kind.as_str()), kind);
        }
        assert_eq!(MessageKind::from_db("bogus"), MessageKind::Text);
    }

    #[test]
    fn media_kinds_use_fixed_preview_labels() {
        let msg = Message {
            id: "m1".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
            text: Some("caption".into()),
            attachment: Some("pic.jpg".into()),
            kind: MessageKind::Image,
            duration_secs: None,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
            read_at: None,
        };
        assert_eq!(msg.preview(), "\u{1F4F7} Photo");
    }

    #[test]
    fn deleted_messages_preview_as_tombstone() {
        let msg = Message {
            id: "m1".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
            text: None,
            attachment: None,
            kind: MessageKind::Text,
            duration_secs: None,
            created_at: Utc::now(),
            edited_at: None,
            deleted: true,
            read_at: None,
        };
        assert_eq!(msg.preview(), "Message deleted");
    }

    #[test]
    fn client_events_parse_from_tagged_json() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"send","receiver_id":"u2","text":"hi"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::Send { .. }));

        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"typing_start","receiver_id":"u2"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::TypingStart { .. }));
    }
}
