//! Auth handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::UserInfo;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::middleware::Ctx;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub display_name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserInfo,
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>> {
    info!("POST /api/auth/register - {}", req.username);

    if req.username.is_empty() || req.password.is_empty() {
        return Err(Error::BadRequest("Username and password required".into()));
    }

    let user = state
        .auth
        .register(req.username.clone(), req.display_name, req.password.clone())
        .await
        .map_err(|e| {
            warn!("Registration failed for {}: {}", req.username, e);
            Error::BadRequest(e.to_string())
        })?;

    let (user, session) = state
        .auth
        .login(user.username, req.password)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    Ok(Json(AuthResponse {
        token: session.token,
        user: user.into(),
    }))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    info!("POST /api/auth/login - {}", req.username);

    let (user, session) = state
        .auth
        .login(req.username.clone(), req.password)
        .await
        .map_err(|e| {
            warn!("Login failed for {}: {}", req.username, e);
            Error::LoginFail
        })?;

    Ok(Json(AuthResponse {
        token: session.token,
        user: user.into(),
    }))
}

/// POST /api/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> StatusCode {
    if let Some(token) = bearer_token(&headers) {
        let _ = state.auth.logout(token).await;
    }
    StatusCode::OK
}

/// DELETE /api/auth/delete-account
///
/// Removes the account, its sessions, and both sides of its message
/// history.
pub async fn delete_account(State(state): State<AppState>, ctx: Ctx) -> Result<StatusCode> {
    info!("DELETE /api/auth/delete-account - {}", ctx.user_id());

    state.store.delete_user_history(ctx.user_id()).await?;
    state.auth.delete_account(ctx.user_id()).await?;
    state.conversations.evict_owner(ctx.user_id());

    if let Some(conn) = state.registry.lookup(ctx.user_id()) {
        conn.close();
    }

    Ok(StatusCode::OK)
}

/// GET /api/users/me
pub async fn me(State(state): State<AppState>, ctx: Ctx) -> Result<Json<UserInfo>> {
    let user = state
        .auth
        .get_user(ctx.user_id())
        .await
        .map_err(|_| Error::NotFound)?;
    Ok(Json(user))
}

/// GET /api/users/search/{username}
pub async fn search_user(
    State(state): State<AppState>,
    _ctx: Ctx,
    Path(username): Path<String>,
) -> Result<Json<UserInfo>> {
    info!("GET /api/users/search/{}", username);

    state
        .auth
        .find_by_username(&username)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
        .map(Json)
        .ok_or(Error::NotFound)
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
