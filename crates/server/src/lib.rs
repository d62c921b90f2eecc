//! Strela direct-messaging server.
//!
//! Pairs of registered identities exchange text and media messages with
//! live delivery over WebSocket, presence, typing indicators, and
//! in-place edit/delete propagation. History is durable in SQLite and
//! retrievable after reconnect; live delivery to an offline peer is
//! deliberately best-effort.

pub mod auth;
pub mod config;
pub mod conversations;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod presence;
pub mod registry;
pub mod store;
pub mod typing;

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::{AppState, ServerConfig};
use handlers::{
    delete_account, delete_message, edit_message, get_attachment, get_presence, history,
    list_conversations, login, logout, mark_read, me, register, search_user, send_message,
    upload_message, ws_connect,
};

pub async fn run() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ServerConfig::default();
    info!("=== Strela Server ===");
    info!("Data directory: {:?}", config.data_dir);

    let addr = config.listen_addr;
    let state = AppState::new(config).await?;
    let app = router(state);

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the full route tree over an existing state. Split out of `run`
/// so tests can drive the router directly.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/delete-account", delete(delete_account))
        .route("/api/users/me", get(me))
        .route("/api/users/search/{username}", get(search_user))
        .route("/api/messages/send", post(send_message))
        .route(
            "/api/messages/upload",
            // The default axum body limit (2 MB) would reject uploads
            // before the handler's own size check runs.
            post(upload_message).layer(DefaultBodyLimit::max(state.config.max_upload_bytes)),
        )
        .route("/api/messages/history/{user_id}", get(history))
        .route(
            "/api/messages/{id}",
            put(edit_message).delete(delete_message),
        )
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{user_id}/read", post(mark_read))
        .route("/api/presence", get(get_presence))
        .route_layer(from_fn_with_state(state.clone(), middleware::mw_require_auth));

    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/attachments/{name}", get(get_attachment))
        .route("/ws", get(ws_connect))
        .route("/api/health", get(health_check))
        .merge(protected)
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK - Strela Server"
}
