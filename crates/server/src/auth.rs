//! Authentication and account management.
//!
//! Users and bearer sessions live in SQLite; passwords are bcrypt-hashed.
//! A small in-memory cache avoids a database round trip for hot tokens.

use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// User record stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Public user info (no sensitive data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            created_at: user.created_at,
        }
    }
}

/// Bearer session for authenticated requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Auth manager handles registration, login and session validation.
pub struct AuthManager {
    pool: SqlitePool,
    /// In-memory session cache.
    sessions: RwLock<HashMap<String, Session>>,
}

impl AuthManager {
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                display_name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("[Auth] Initialized at {:?}", db_path);

        Ok(Self {
            pool,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new user.
    pub async fn register(
        &self,
        username: String,
        display_name: String,
        password: String,
    ) -> Result<User> {
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE username = ?")
            .bind(&username)
            .fetch_optional(&self.pool)
            .await?;

        if existing.is_some() {
            return Err(anyhow::anyhow!("Username already taken"));
        }

        let password_hash = hash(&password, DEFAULT_COST).context("Failed to hash password")?;

        let user = User {
            id: Uuid::new_v4().to_string(),
            username,
            display_name,
            password_hash,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO users (id, username, display_name, password_hash, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(&user.password_hash)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!("[Auth] User registered: {}", user.username);

        Ok(user)
    }

    /// Login a user and create a session.
    pub async fn login(&self, username: String, password: String) -> Result<(User, Session)> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, username, display_name, password_hash, created_at \
             FROM users WHERE username = ?",
        )
        .bind(&username)
        .fetch_optional(&self.pool)
        .await?;

        let (id, username, display_name, password_hash, created_at) =
            row.ok_or_else(|| anyhow::anyhow!("Invalid username or password"))?;

        let valid = verify(&password, &password_hash).context("Failed to verify password")?;
        if !valid {
            warn!("[Auth] Failed login attempt for {}", username);
            return Err(anyhow::anyhow!("Invalid username or password"));
        }

        let session = self.create_session(&id).await?;

        let user = User {
            id,
            username,
            display_name,
            password_hash: String::new(), // Don't return hash
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        };

        info!("[Auth] User logged in: {}", user.username);

        Ok((user, session))
    }

    async fn create_session(&self, user_id: &str) -> Result<Session> {
        let session = Session {
            token: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
        };

        sqlx::query(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.token)
        .bind(&session.user_id)
        .bind(session.created_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());

        Ok(session)
    }

    /// Validate a bearer token and return the user it belongs to.
    pub async fn validate_session(&self, token: &str) -> Result<UserInfo> {
        // Check cache first
        let cached = {
            let sessions = self.sessions.read().await;
            sessions
                .get(token)
                .map(|s| (s.user_id.clone(), s.expires_at))
        };

        match cached {
            Some((user_id, expires_at)) if expires_at > Utc::now() => {
                return self.get_user(&user_id).await;
            }
            Some(_) => {
                // Expired entry; sweep it and anything else past its window
                // so the cache does not grow until logout.
                let now = Utc::now();
                self.sessions.write().await.retain(|_, s| s.expires_at > now);
            }
            None => {}
        }

        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT u.id, u.username, u.display_name, u.created_at, s.expires_at
            FROM users u
            JOIN sessions s ON u.id = s.user_id
            WHERE s.token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id, username, display_name, created_at, expires_at)) = row {
            let expires: DateTime<Utc> = expires_at
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid date"))?;
            if expires > Utc::now() {
                return Ok(UserInfo {
                    id,
                    username,
                    display_name,
                    created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                });
            }
        }

        Err(anyhow::anyhow!("Invalid or expired session"))
    }

    /// Invalidate a session token.
    pub async fn logout(&self, token: &str) -> Result<()> {
        self.sessions.write().await.remove(token);

        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        info!("[Auth] Session invalidated");

        Ok(())
    }

    /// Get public info for a user by id.
    pub async fn get_user(&self, user_id: &str) -> Result<UserInfo> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, username, display_name, created_at FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, username, display_name, created_at)| UserInfo {
            id,
            username,
            display_name,
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        })
        .ok_or_else(|| anyhow::anyhow!("User not found"))
    }

    /// Exact-username lookup for contact discovery.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<UserInfo>> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, username, display_name, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, username, display_name, created_at)| UserInfo {
            id,
            username,
            display_name,
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        }))
    }

    /// Remove an account and all of its sessions.
    pub async fn delete_account(&self, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        self.sessions
            .write()
            .await
            .retain(|_, s| s.user_id != user_id);

        info!("[Auth] Account deleted: {}", user_id);

        Ok(())
    }

    #[cfg(test)]
    async fn cache_session(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session);
    }

    #[cfg(test)]
    async fn cached_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }
}
