//! Typing indicators with automatic expiry.
//!
//! Each ordered (from, to) pair owns at most one timer. The first
//! keystroke emits a typing-start notice and arms the timer; further
//! keystrokes reset the timer without re-emitting. Explicit stop, expiry,
//! or either party's disconnect emits a typing-stop notice and discards
//! the timer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::ServerEvent;
use crate::registry::SessionRegistry;

struct TimerSlot {
    /// Generation guard: an expiry only fires if its sequence still
    /// matches, so a timer racing its own replacement cannot cancel the
    /// newer one.
    seq: u64,
    handle: JoinHandle<()>,
}

pub struct TypingManager {
    registry: Arc<SessionRegistry>,
    timers: Mutex<HashMap<(String, String), TimerSlot>>,
    next_seq: Mutex<u64>,
    ttl: Duration,
}

impl TypingManager {
    pub fn new(registry: Arc<SessionRegistry>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            timers: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(0),
            ttl,
        })
    }

    /// A keystroke from `from` composing to `to`. Emits typing-start only
    /// on the Idle -> Typing transition; otherwise just resets the timer.
    pub fn keystroke(self: &Arc<Self>, from: &str, to: &str) {
        let key = (from.to_string(), to.to_string());
        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };

        let manager = Arc::clone(self);
        let (task_from, task_to) = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(manager.ttl).await;
            manager.expire(&task_from, &task_to, seq);
        });

        let was_typing = {
            let mut timers = self.timers.lock();
            let prior = timers.insert(key, TimerSlot { seq, handle });
            if let Some(slot) = prior {
                slot.handle.abort();
                true
            } else {
                false
            }
        };

        if !was_typing {
            if let Some(conn) = self.registry.lookup(to) {
                conn.send(ServerEvent::TypingStart {
                    user_id: from.to_string(),
                });
            }
        }
    }

    /// Explicit stop notification. A stop for a pair with no live timer is
    /// a no-op.
    pub fn stop(&self, from: &str, to: &str) {
        let key = (from.to_string(), to.to_string());
        let removed = {
            let mut timers = self.timers.lock();
            timers.remove(&key).map(|slot| slot.handle.abort())
        };
        if removed.is_some() {
            self.emit_stop(from, to);
        }
    }

    /// Timer expiry. Ignored when a newer keystroke already replaced this
    /// timer's slot.
    fn expire(&self, from: &str, to: &str, seq: u64) {
        let key = (from.to_string(), to.to_string());
        let fired = {
            let mut timers = self.timers.lock();
            match timers.get(&key) {
                Some(slot) if slot.seq == seq => {
                    timers.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if fired {
            debug!("[Typing] Expired {} -> {}", from, to);
            self.emit_stop(from, to);
        }
    }

    /// Cancel every typing state where the identity appears on either side
    /// of the pair. Stop notices go out only for pairs where the identity
    /// was the one composing.
    pub fn disconnect(&self, identity: &str) {
        let stopped: Vec<(String, String)> = {
            let mut timers = self.timers.lock();
            let keys: Vec<(String, String)> = timers
                .keys()
                .filter(|(from, to)| from == identity || to == identity)
                .cloned()
                .collect();
            for key in &keys {
                if let Some(slot) = timers.remove(key) {
                    slot.handle.abort();
                }
            }
            keys
        };

        for (from, to) in stopped {
            if from == identity {
                self.emit_stop(&from, &to);
            }
        }
    }

    fn emit_stop(&self, from: &str, to: &str) {
        if let Some(conn) = self.registry.lookup(to) {
            conn.send(ServerEvent::TypingStop {
                user_id: from.to_string(),
            });
        }
    }

    #[cfg(test)]
    fn active_pairs(&self) -> usize {
        self.timers.lock().len()
    }
}
