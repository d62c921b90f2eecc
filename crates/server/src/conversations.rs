//! Conversation projection cache.
//!
//! In-memory, per-owner summaries of each conversation (last message,
//! unread count), kept consistent with the live delivery stream. The
//! durable store remains the authority: an owner's summaries are lazily
//! rebuilt from a store aggregation on first access.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::models::{ConversationSummary, MessageKind};
use crate::store::{MessageStore, StoreError};

#[derive(Default)]
struct CacheInner {
    /// Per-owner summaries in insertion order; `list` sorts a snapshot.
    summaries: HashMap<String, Vec<ConversationSummary>>,
    /// Owners whose summaries were rebuilt from the store.
    primed: HashSet<String>,
}

pub struct ConversationCache {
    inner: Mutex<CacheInner>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Apply a new last message to the (owner, other) summary, creating it
    /// if needed. `increment_unread` is set for the receiving side when
    /// that participant is not currently viewing the conversation.
    pub fn touch(
        &self,
        owner: &str,
        other: &str,
        preview: String,
        kind: MessageKind,
        timestamp: DateTime<Utc>,
        increment_unread: bool,
    ) {
        let mut inner = self.inner.lock();
        let entries = inner.summaries.entry(owner.to_string()).or_default();
        match entries.iter_mut().find(|s| s.other_user_id == other) {
            Some(summary) => {
                summary.last_message = preview;
                summary.last_message_kind = kind;
                summary.last_message_time = timestamp;
                if increment_unread {
                    summary.unread_count += 1;
                }
            }
            None => entries.push(ConversationSummary {
                other_user_id: other.to_string(),
                last_message: preview,
                last_message_kind: kind,
                last_message_time: timestamp,
                unread_count: if increment_unread { 1 } else { 0 },
            }),
        }
    }

    /// Refresh the preview of an existing summary without reordering the
    /// conversation or touching unread counts. Applied on edits and
    /// deletes, and only when the changed message is still the latest one.
    pub fn refresh_preview(
        &self,
        owner: &str,
        other: &str,
        preview: String,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock();
        if let Some(entries) = inner.summaries.get_mut(owner) {
            if let Some(summary) = entries
                .iter_mut()
                .find(|s| s.other_user_id == other && s.last_message_time <= created_at)
            {
                summary.last_message = preview;
                summary.last_message_kind = kind;
            }
        }
    }

    /// Zero the unread count for one conversation. Preview and timestamp
    /// are left untouched.
    pub fn mark_read(&self, owner: &str, other: &str) {
        let mut inner = self.inner.lock();
        if let Some(entries) = inner.summaries.get_mut(owner) {
            if let Some(summary) = entries.iter_mut().find(|s| s.other_user_id == other) {
                summary.unread_count = 0;
            }
        }
    }

    /// Drop an owner's cached projection entirely (account deletion).
    pub fn evict_owner(&self, owner: &str) {
        let mut inner = self.inner.lock();
        inner.summaries.remove(owner);
        inner.primed.remove(owner);
    }

    /// Ordered summaries for one owner: most recent last message first,
    /// ties stable in insertion order. Rebuilds from the store on the
    /// first access per owner.
    pub async fn list(
        &self,
        store: &MessageStore,
        owner: &str,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let needs_rebuild = {
            let inner = self.inner.lock();
            !inner.primed.contains(owner)
        };

        if needs_rebuild {
            // No lock held across the store call.
            let rebuilt = store.fetch_conversation_summaries(owner).await?;
            let mut inner = self.inner.lock();
            if inner.primed.insert(owner.to_string()) {
                debug!(
                    "[Conversations] Rebuilt {} summaries for {}",
                    rebuilt.len(),
                    owner
                );
                let entries = inner.summaries.entry(owner.to_string()).or_default();
                // The store aggregation is the recovered authority. A live
                // touch that raced the rebuild only overrides it where its
                // last message is strictly newer; the durable unread count
                // already includes any message that was touched live, so
                // the larger of the two is the complete one.
                for summary in rebuilt {
                    match entries
                        .iter_mut()
                        .find(|s| s.other_user_id == summary.other_user_id)
                    {
                        Some(live) => {
                            if live.last_message_time < summary.last_message_time {
                                live.last_message = summary.last_message;
                                live.last_message_kind = summary.last_message_kind;
                                live.last_message_time = summary.last_message_time;
                            }
                            live.unread_count = live.unread_count.max(summary.unread_count);
                        }
                        None => entries.push(summary),
                    }
                }
            }
        }

        let mut snapshot = {
            let inner = self.inner.lock();
            inner.summaries.get(owner).cloned().unwrap_or_default()
        };
        // Stable sort keeps insertion order for equal timestamps.
        snapshot.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        Ok(snapshot)
    }
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::new()
    }
}
