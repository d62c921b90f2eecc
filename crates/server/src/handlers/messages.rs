//! Message and conversation handlers.
//!
//! Every write goes through the delivery service functions, so a REST
//! write triggers the same live fan-out as one arriving over the
//! WebSocket.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::AppState;
use crate::delivery;
use crate::error::{Error, Result};
use crate::middleware::Ctx;
use crate::models::{ConversationSummary, Message, MessageKind};
use crate::store::NewMessage;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: String,
    pub text: String,
    #[serde(default)]
    pub kind: MessageKind,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// POST /api/messages/send
pub async fn send_message(
    State(state): State<AppState>,
    ctx: Ctx,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Message>> {
    info!("POST /api/messages/send -> {}", req.receiver_id);

    if req.text.is_empty() {
        return Err(Error::BadRequest("Message text required".into()));
    }

    let message = delivery::send_message(
        &state,
        ctx.user_id(),
        NewMessage {
            sender_id: ctx.user_id().to_string(),
            receiver_id: req.receiver_id,
            text: Some(req.text),
            attachment: None,
            kind: req.kind,
            duration_secs: None,
        },
    )
    .await?;

    Ok(Json(message))
}

/// POST /api/messages/upload
///
/// Multipart form: `file` plus `receiver_id`, optional `kind` and
/// `duration`. The attachment is stored on disk keyed by content hash;
/// the kind falls back to the MIME prefix when not given explicitly.
pub async fn upload_message(
    State(state): State<AppState>,
    ctx: Ctx,
    mut multipart: Multipart,
) -> Result<Json<Message>> {
    info!("POST /api/messages/upload");

    let mut receiver_id = None;
    let mut explicit_kind = None;
    let mut duration_secs = None;
    let mut file_name = None;
    let mut content_type = None;
    let mut data = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!("Failed to read multipart field: {}", e);
        Error::BadRequest("Malformed multipart body".into())
    })? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                content_type = field.content_type().map(|s| s.to_string());
                data = Some(field.bytes().await.map_err(|e| {
                    warn!("Failed to read file data: {}", e);
                    Error::BadRequest("Failed to read file".into())
                })?);
            }
            "receiver_id" => receiver_id = field.text().await.ok(),
            "kind" => {
                explicit_kind = field.text().await.ok().map(|k| MessageKind::from_db(&k));
            }
            "duration" => {
                duration_secs = field.text().await.ok().and_then(|d| d.parse().ok());
            }
            _ => {}
        }
    }

    let receiver_id = receiver_id.ok_or_else(|| Error::BadRequest("receiver_id required".into()))?;
    let data = data.ok_or_else(|| Error::BadRequest("No file".into()))?;
    if data.len() > state.config.max_upload_bytes {
        return Err(Error::BadRequest("File too large".into()));
    }

    let content_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());
    let kind = explicit_kind.unwrap_or_else(|| MessageKind::from_mime(&content_type));

    // Content-addressed file name, original name kept for the extension.
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let hash = format!("{:x}", hasher.finalize());
    let original = file_name.unwrap_or_else(|| "file".to_string());
    let stored_name = format!("{}_{}", &hash[..16], sanitize_file_name(&original));

    let path = state.config.upload_dir.join(&stored_name);
    tokio::fs::write(&path, &data)
        .await
        .map_err(|e| Error::Internal(format!("Failed to store attachment: {}", e)))?;

    info!("Stored attachment {} ({} bytes)", stored_name, data.len());

    let message = delivery::send_message(
        &state,
        ctx.user_id(),
        NewMessage {
            sender_id: ctx.user_id().to_string(),
            receiver_id,
            text: None,
            attachment: Some(stored_name),
            kind,
            duration_secs,
        },
    )
    .await?;

    Ok(Json(message))
}

/// GET /api/messages/history/{user_id}
pub async fn history(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>> {
    let limit = query
        .limit
        .unwrap_or(state.config.history_limit)
        .clamp(1, 1000);
    let messages = state
        .store
        .fetch_conversation(ctx.user_id(), &user_id, limit)
        .await?;
    Ok(Json(messages))
}

/// PUT /api/messages/{id}
pub async fn edit_message(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<Message>> {
    info!("PUT /api/messages/{}", id);
    let message = delivery::edit_message(&state, ctx.user_id(), &id, &req.text).await?;
    Ok(Json(message))
}

/// DELETE /api/messages/{id}
pub async fn delete_message(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> Result<Json<Message>> {
    info!("DELETE /api/messages/{}", id);
    let message = delivery::delete_message(&state, ctx.user_id(), &id).await?;
    Ok(Json(message))
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    ctx: Ctx,
) -> Result<Json<Vec<ConversationSummary>>> {
    let summaries = state.conversations.list(&state.store, ctx.user_id()).await?;
    Ok(Json(summaries))
}

/// POST /api/conversations/{user_id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(user_id): Path<String>,
) -> Result<StatusCode> {
    delivery::mark_conversation_read(&state, ctx.user_id(), &user_id).await?;
    Ok(StatusCode::OK)
}

/// GET /api/attachments/{name}
pub async fn get_attachment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(HeaderMap, bytes::Bytes)> {
    // Stored names never contain path separators; reject anything odd.
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(Error::BadRequest("Invalid attachment name".into()));
    }

    let path = state.config.upload_dir.join(&name);
    let data = tokio::fs::read(&path).await.map_err(|_| Error::NotFound)?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = content_type_for(&name).parse() {
        headers.insert(http::header::CONTENT_TYPE, value);
    }
    Ok((headers, bytes::Bytes::from(data)))
}

/// GET /api/presence
pub async fn get_presence(State(state): State<AppState>, _ctx: Ctx) -> Json<Vec<String>> {
    Json(state.registry.online_ids())
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit('.').next().unwrap_or("") {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "ogg" | "oga" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_characters() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name("photo 1.jpg"), "photo_1.jpg");
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for("abc_cat.png"), "image/png");
        assert_eq!(content_type_for("voice.ogg"), "audio/ogg");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }
}
