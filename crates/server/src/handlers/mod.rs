//! HTTP and WebSocket handlers.

pub mod auth;
pub mod messages;
pub mod ws;

// Auth handlers
pub use auth::{delete_account, login, logout, me, register, search_user};

// Message and conversation handlers
pub use messages::{
    delete_message, edit_message, get_attachment, get_presence, history, list_conversations,
    mark_read, send_message, upload_message,
};

// Live connection
pub use ws::{close_session, open_session, ws_connect};
