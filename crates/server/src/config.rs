//! Server configuration and shared application state.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthManager;
use crate::conversations::ConversationCache;
use crate::delivery::DeliveryCoordinator;
use crate::registry::SessionRegistry;
use crate::store::MessageStore;
use crate::typing::TypingManager;
use crate::presence::PresenceBroadcaster;

/// Configuration for the Strela server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Base data directory (database and uploads).
    pub data_dir: PathBuf,
    /// SQLite database path (users, sessions, messages).
    pub db_path: PathBuf,
    /// Directory for uploaded attachments.
    pub upload_dir: PathBuf,
    /// Listen address.
    pub listen_addr: SocketAddr,
    /// Typing indicator expiry window.
    pub typing_ttl: Duration,
    /// Default history fetch limit.
    pub history_limit: i64,
    /// Max accepted upload size in bytes.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = std::env::var("STRELA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("strela_data"));
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        Self {
            db_path: data_dir.join("strela.sqlite"),
            upload_dir: data_dir.join("uploads"),
            data_dir,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            typing_ttl: Duration::from_secs(3),
            history_limit: 200,
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Create a config rooted at a custom base directory.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let data_dir = base_dir.into();
        Self {
            db_path: data_dir.join("strela.sqlite"),
            upload_dir: data_dir.join("uploads"),
            data_dir,
            ..Self::default()
        }
    }

    /// Ensure all directories exist.
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        Ok(())
    }
}

/// App state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub auth: Arc<AuthManager>,
    pub store: Arc<MessageStore>,
    pub registry: Arc<SessionRegistry>,
    pub presence: Arc<PresenceBroadcaster>,
    pub typing: Arc<TypingManager>,
    pub conversations: Arc<ConversationCache>,
    pub delivery: Arc<DeliveryCoordinator>,
}

impl AppState {
    /// Build the full coordination stack over one configuration.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.ensure_dirs().await?;

        let auth = Arc::new(AuthManager::new(&config.db_path).await?);
        let store = Arc::new(MessageStore::new(&config.db_path).await?);

        let registry = Arc::new(SessionRegistry::new());
        let presence = Arc::new(PresenceBroadcaster::new(registry.clone()));
        let typing = TypingManager::new(registry.clone(), config.typing_ttl);
        let conversations = Arc::new(ConversationCache::new());
        let delivery = Arc::new(DeliveryCoordinator::new(
            registry.clone(),
            conversations.clone(),
        ));

        Ok(Self {
            config,
            auth,
            store,
            registry,
            presence,
            typing,
            conversations,
            delivery,
        })
    }
}
