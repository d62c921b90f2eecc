//! Presence broadcasting: online/offline transitions fanned out to every
//! other live session.

use std::sync::Arc;
use tracing::debug;

use crate::models::ServerEvent;
use crate::registry::SessionRegistry;

pub struct PresenceBroadcaster {
    registry: Arc<SessionRegistry>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Announce an identity's transition to every other live session.
    /// Duplicate consecutive "online" announcements during session
    /// replacement are accepted and not deduplicated here.
    pub fn announce(&self, identity: &str, online: bool) {
        let event = if online {
            ServerEvent::PeerOnline {
                user_id: identity.to_string(),
            }
        } else {
            ServerEvent::PeerOffline {
                user_id: identity.to_string(),
            }
        };

        let peers = self.registry.connections_except(identity);
        debug!(
            "[Presence] {} is {} ({} peers notified)",
            identity,
            if online { "online" } else { "offline" },
            peers.len()
        );
        for conn in peers {
            conn.send(event.clone());
        }
    }
}
