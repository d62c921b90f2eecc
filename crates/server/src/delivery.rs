//! Message delivery coordination.
//!
//! Fans persisted create/edit/delete events out to the counterpart's live
//! connection, echoes an acknowledgment to the originator, and keeps both
//! participants' conversation summaries in step with the stream. The
//! write-path service functions persist first and deliver second, so the
//! REST and live paths never diverge on what counts as "sent".

use std::sync::Arc;
use tracing::debug;

use crate::config::AppState;
use crate::conversations::ConversationCache;
use crate::error::Result;
use crate::models::{Message, MessageKind, ServerEvent};
use crate::registry::SessionRegistry;
use crate::store::NewMessage;

pub struct DeliveryCoordinator {
    registry: Arc<SessionRegistry>,
    conversations: Arc<ConversationCache>,
}

impl DeliveryCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, conversations: Arc<ConversationCache>) -> Self {
        Self {
            registry,
            conversations,
        }
    }

    /// Fan out a freshly persisted message: push to the receiver if live,
    /// echo an ack to the sender, and update both summaries. The receiver's
    /// unread count is incremented only when they are not currently viewing
    /// this conversation. An offline receiver is not an error; they catch
    /// up from history on reconnect.
    pub fn deliver_created(&self, message: &Message) {
        let receiver_viewing = self
            .registry
            .is_viewing(&message.receiver_id, &message.sender_id);

        match self.registry.lookup(&message.receiver_id) {
            Some(conn) => conn.send(ServerEvent::MessageDelivered {
                message: message.clone(),
            }),
            None => debug!(
                "[Delivery] Peer {} offline, dropping live event for {}",
                message.receiver_id, message.id
            ),
        }

        if let Some(conn) = self.registry.lookup(&message.sender_id) {
            conn.send(ServerEvent::SelfAck {
                message: message.clone(),
            });
        }

        let preview = message.preview();
        self.conversations.touch(
            &message.sender_id,
            &message.receiver_id,
            preview.clone(),
            message.kind,
            message.created_at,
            false,
        );
        self.conversations.touch(
            &message.receiver_id,
            &message.sender_id,
            preview,
            message.kind,
            message.created_at,
            !receiver_viewing,
        );
    }

    /// Fan out an edit. The event reaches the counterpart if live and is
    /// echoed back to the editor; the conversation keeps its position.
    pub fn deliver_edited(&self, message: &Message) {
        self.fan_out_update(
            message,
            ServerEvent::MessageEdited {
                message: message.clone(),
            },
        );
    }

    /// Fan out a soft delete. The tombstone still reaches the peer so its
    /// view updates in place rather than through removal.
    pub fn deliver_deleted(&self, message: &Message) {
        self.fan_out_update(
            message,
            ServerEvent::MessageDeleted {
                message: message.clone(),
            },
        );
    }

    fn fan_out_update(&self, message: &Message, event: ServerEvent) {
        match self.registry.lookup(&message.receiver_id) {
            Some(conn) => conn.send(event.clone()),
            None => debug!(
                "[Delivery] Peer {} offline, dropping live event for {}",
                message.receiver_id, message.id
            ),
        }
        if let Some(conn) = self.registry.lookup(&message.sender_id) {
            conn.send(event);
        }

        let preview = message.preview();
        let kind = if message.deleted {
            MessageKind::Text
        } else {
            message.kind
        };
        self.conversations.refresh_preview(
            &message.sender_id,
            &message.receiver_id,
            preview.clone(),
            kind,
            message.created_at,
        );
        self.conversations.refresh_preview(
            &message.receiver_id,
            &message.sender_id,
            preview,
            kind,
            message.created_at,
        );
    }
}

/// Persist a new message and fan it out. Shared by the REST send/upload
/// handlers and the live-connection `send` event.
pub async fn send_message(state: &AppState, sender_id: &str, input: NewMessage) -> Result<Message> {
    debug_assert_eq!(input.sender_id, sender_id);
    let message = state.store.create_message(input).await?;
    state.delivery.deliver_created(&message);
    Ok(message)
}

/// Edit a message (sender-only) and fan out the new content. Fails before
/// any fan-out when the message is missing or the acting identity is not
/// the original sender.
pub async fn edit_message(
    state: &AppState,
    acting_id: &str,
    message_id: &str,
    new_text: &str,
) -> Result<Message> {
    let message = state.store.edit_message(message_id, new_text, acting_id).await?;
    state.delivery.deliver_edited(&message);
    Ok(message)
}

/// Soft-delete a message (sender-only) and fan out the tombstone.
pub async fn delete_message(
    state: &AppState,
    acting_id: &str,
    message_id: &str,
) -> Result<Message> {
    let message = state.store.soft_delete_message(message_id, acting_id).await?;
    state.delivery.deliver_deleted(&message);
    Ok(message)
}

/// Mark a conversation read in the store and zero the cached unread count.
pub async fn mark_conversation_read(state: &AppState, owner_id: &str, other_id: &str) -> Result<()> {
    state.store.mark_read(owner_id, other_id).await?;
    state.conversations.mark_read(owner_id, other_id);
    Ok(())
}
