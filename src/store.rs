//! Conversation message store: per-conversation ordered logs.
//!
//! The single source of truth the UI renders from. Reads are synchronous
//! and always see the latest applied mutation. Entries are only ever
//! appended or mutated in place; retention is somebody else's concern.
//!
//! Ordering rules:
//!
//! - `append` always inserts at the tail (arrival order for server
//!   messages, send order for optimistic ones)
//! - `reconcile` and `mark_failed` mutate in place and never reorder
//! - no two entries in one log share an `id`
//!
//! Every applied mutation is announced on a broadcast change feed.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::constants::STORE_CHANGE_CAPACITY;

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Sent optimistically, no server confirmation yet.
    Pending,
    /// Confirmed by the server, or received from it.
    Sent,
    /// Not delivered (not connected or no ack in time).
    Failed,
}

/// One entry in a conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server id once known, otherwise the client correlation token.
    pub id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Message text.
    pub content: String,
    /// Author.
    pub sender_id: String,
    /// Whether the author is an agent.
    pub is_agent: bool,
    /// Client time for unconfirmed entries, server time once reconciled.
    pub timestamp: DateTime<Utc>,
    /// Where the message is in the Pending/Sent/Failed machine.
    pub delivery_state: DeliveryState,
    /// Correlation token for locally originated messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// Server-assigned identity adopted by a reconciled entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Server message id.
    pub id: String,
    /// Server timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Notification of an applied mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// An entry was added at the tail.
    Appended {
        /// Conversation that changed.
        conversation_id: String,
        /// Id of the new entry.
        id: String,
    },
    /// A local entry was confirmed in place.
    Reconciled {
        /// Conversation that changed.
        conversation_id: String,
        /// Correlation token of the entry.
        client_message_id: String,
        /// Id the entry now has.
        id: String,
    },
    /// A duplicate entry was dropped while reconciling, because the
    /// confirmed entry adopted its server id. Sent before the matching
    /// `Reconciled`.
    Removed {
        /// Conversation that changed.
        conversation_id: String,
        /// Id of the dropped entry.
        id: String,
    },
    /// A local entry was marked `Failed`.
    Failed {
        /// Conversation that changed.
        conversation_id: String,
        /// Correlation token of the entry.
        client_message_id: String,
    },
}

/// Cloneable handle to the shared logs.
#[derive(Clone)]
pub struct ConversationStore {
    logs: Arc<RwLock<HashMap<String, Vec<Message>>>>,
    changes: broadcast::Sender<StoreChange>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ConversationStore")
            .field("conversations", &logs.len())
            .finish_non_exhaustive()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(STORE_CHANGE_CAPACITY);
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Subscribe to the change feed.
    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StoreChange) {
        // No listeners is fine.
        let _ = self.changes.send(change);
    }

    /// Append `message` at the tail of its conversation log.
    ///
    /// Returns `false` (and changes nothing) if an entry with the same `id`
    /// is already in the log, which is how duplicate deliveries are dropped.
    pub fn append(&self, conversation_id: &str, message: Message) -> bool {
        let id = message.id.clone();
        {
            let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
            let log = logs.entry(conversation_id.to_string()).or_default();
            if log.iter().any(|m| m.id == id) {
                log::debug!("[Store] Duplicate {} in {} dropped", id, conversation_id);
                return false;
            }
            log.push(message);
        }
        self.notify(StoreChange::Appended {
            conversation_id: conversation_id.to_string(),
            id,
        });
        true
    }

    /// Confirm the entry sent with `client_message_id`: state becomes `Sent`
    /// and it adopts the server `id`/`timestamp`, keeping its position.
    ///
    /// A `Failed` entry is upgraded too, since a late confirmation proves
    /// delivery. Unknown tokens are a no-op and return `false`. If another
    /// entry already carries the server id (the echo was appended first),
    /// that duplicate is removed so the id stays unique.
    pub fn reconcile(&self, conversation_id: &str, client_message_id: &str, resolved: Resolved) -> bool {
        let id = resolved.id.clone();
        let collapsed;
        {
            let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
            let Some(log) = logs.get_mut(conversation_id) else {
                return false;
            };
            let Some(pos) = position_of(log, client_message_id) else {
                return false;
            };
            let entry = &mut log[pos];
            if entry.delivery_state == DeliveryState::Sent
                && entry.id == resolved.id
                && entry.timestamp == resolved.timestamp
            {
                return false;
            }
            entry.id = resolved.id;
            entry.timestamp = resolved.timestamp;
            entry.delivery_state = DeliveryState::Sent;

            let before = log.len();
            let mut index = 0;
            log.retain(|m| {
                let keep = index == pos || m.id != id;
                index += 1;
                keep
            });
            collapsed = log.len() < before;
        }
        if collapsed {
            log::debug!("[Store] Collapsed duplicate {} in {}", id, conversation_id);
            self.notify(StoreChange::Removed {
                conversation_id: conversation_id.to_string(),
                id: id.clone(),
            });
        }
        self.notify(StoreChange::Reconciled {
            conversation_id: conversation_id.to_string(),
            client_message_id: client_message_id.to_string(),
            id,
        });
        true
    }

    /// Mark the `Pending` entry sent with `client_message_id` as `Failed`.
    ///
    /// Unknown tokens and entries that are no longer `Pending` are left
    /// alone and return `false`.
    pub fn mark_failed(&self, conversation_id: &str, client_message_id: &str) -> bool {
        {
            let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = logs.get_mut(conversation_id).and_then(|log| {
                position_of(log, client_message_id).map(move |pos| &mut log[pos])
            }) else {
                return false;
            };
            if entry.delivery_state != DeliveryState::Pending {
                return false;
            }
            entry.delivery_state = DeliveryState::Failed;
        }
        self.notify(StoreChange::Failed {
            conversation_id: conversation_id.to_string(),
            client_message_id: client_message_id.to_string(),
        });
        true
    }

    /// Snapshot of one conversation log, in log order.
    #[must_use]
    pub fn get(&self, conversation_id: &str) -> Vec<Message> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Delivery state of the entry sent with `client_message_id`, if present.
    #[must_use]
    pub fn delivery_state(&self, conversation_id: &str, client_message_id: &str) -> Option<DeliveryState> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        let log = logs.get(conversation_id)?;
        position_of(log, client_message_id).map(|pos| log[pos].delivery_state)
    }

    /// Oldest `Pending` entry from `sender_id` with exactly `content`,
    /// created within `window` of `at`. Used for best-effort echo matching
    /// when the server does not return the correlation token.
    #[must_use]
    pub fn find_pending_echo(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Option<String> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        logs.get(conversation_id)?
            .iter()
            .find(|m| {
                m.delivery_state == DeliveryState::Pending
                    && m.sender_id == sender_id
                    && m.content == content
                    && (at - m.timestamp).abs() <= window
            })
            .and_then(|m| m.client_message_id.clone())
    }

    /// Conversation holding the entry sent with `client_message_id`.
    #[must_use]
    pub fn conversation_of(&self, client_message_id: &str) -> Option<String> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, log)| position_of(log, client_message_id).is_some())
            .map(|(conversation_id, _)| conversation_id.clone())
    }

    /// Ids of all conversations with at least one entry.
    #[must_use]
    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

fn position_of(log: &[Message], client_message_id: &str) -> Option<usize> {
    log.iter()
        .position(|m| m.client_message_id.as_deref() == Some(client_message_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + secs, 0).unwrap()
    }

    fn pending(client_message_id: &str, content: &str, at: i64) -> Message {
        Message {
            id: client_message_id.into(),
            conversation_id: "c1".into(),
            content: content.into(),
            sender_id: "me".into(),
            is_agent: false,
            timestamp: ts(at),
            delivery_state: DeliveryState::Pending,
            client_message_id: Some(client_message_id.into()),
        }
    }

    fn inbound(id: &str, content: &str, at: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            content: content.into(),
            sender_id: "agent".into(),
            is_agent: true,
            timestamp: ts(at),
            delivery_state: DeliveryState::Sent,
            client_message_id: None,
        }
    }

    fn contents(store: &ConversationStore, conversation_id: &str) -> Vec<String> {
        store
            .get(conversation_id)
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    #[test]
    fn test_append_keeps_arrival_order_regardless_of_timestamps() {
        let store = ConversationStore::new();
        store.append("c1", inbound("s3", "third-ts", 30));
        store.append("c1", inbound("s1", "first-ts", 10));
        store.append("c1", inbound("s2", "second-ts", 20));
        assert_eq!(contents(&store, "c1"), vec!["third-ts", "first-ts", "second-ts"]);
    }

    #[test]
    fn test_append_drops_duplicate_ids() {
        let store = ConversationStore::new();
        assert!(store.append("c1", inbound("s1", "a", 1)));
        assert!(!store.append("c1", inbound("s1", "a", 1)));
        assert_eq!(store.get("c1").len(), 1);
    }

    #[test]
    fn test_reconcile_in_place_without_reordering() {
        let store = ConversationStore::new();
        store.append("c1", inbound("s1", "before", 1));
        store.append("c1", pending("m1", "mine", 5));
        store.append("c1", inbound("s2", "after", 6));

        // Server timestamp would sort first; position must not change.
        assert!(store.reconcile(
            "c1",
            "m1",
            Resolved {
                id: "srv-9".into(),
                timestamp: ts(0),
            }
        ));

        let log = store.get("c1");
        assert_eq!(contents(&store, "c1"), vec!["before", "mine", "after"]);
        assert_eq!(log[1].id, "srv-9");
        assert_eq!(log[1].timestamp, ts(0));
        assert_eq!(log[1].delivery_state, DeliveryState::Sent);
        assert_eq!(log[1].client_message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_reconcile_and_mark_failed_unknown_are_noops() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "mine", 1));
        let before = store.get("c1");

        let resolved = Resolved {
            id: "x".into(),
            timestamp: ts(2),
        };
        assert!(!store.reconcile("c1", "nope", resolved.clone()));
        assert!(!store.reconcile("c9", "m1", resolved));
        assert!(!store.mark_failed("c1", "nope"));
        assert!(!store.mark_failed("c9", "m1"));
        assert_eq!(store.get("c1"), before);
    }

    #[test]
    fn test_mark_failed_touches_only_target() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "one", 1));
        store.append("c1", pending("m2", "two", 2));

        assert!(store.mark_failed("c1", "m2"));
        assert_eq!(store.delivery_state("c1", "m1"), Some(DeliveryState::Pending));
        assert_eq!(store.delivery_state("c1", "m2"), Some(DeliveryState::Failed));
        assert!(!store.mark_failed("c1", "m2"));
    }

    #[test]
    fn test_mark_failed_does_not_downgrade_sent() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "one", 1));
        store.reconcile(
            "c1",
            "m1",
            Resolved {
                id: "s1".into(),
                timestamp: ts(1),
            },
        );
        assert!(!store.mark_failed("c1", "m1"));
        assert_eq!(store.delivery_state("c1", "m1"), Some(DeliveryState::Sent));
    }

    #[test]
    fn test_late_reconcile_upgrades_failed() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "one", 1));
        store.mark_failed("c1", "m1");
        assert!(store.reconcile(
            "c1",
            "m1",
            Resolved {
                id: "s1".into(),
                timestamp: ts(3),
            }
        ));
        assert_eq!(store.delivery_state("c1", "m1"), Some(DeliveryState::Sent));
    }

    #[test]
    fn test_reconcile_collapses_already_appended_echo() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "mine", 1));
        store.append("c1", inbound("s1", "mine", 2));

        store.reconcile(
            "c1",
            "m1",
            Resolved {
                id: "s1".into(),
                timestamp: ts(2),
            },
        );
        let log = store.get("c1");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].client_message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_collapse_announces_removed_entry() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "mine", 1));
        store.append("c1", inbound("srv-1", "mine", 2));
        let mut changes = store.changes();

        assert!(store.reconcile(
            "c1",
            "m1",
            Resolved {
                id: "srv-1".into(),
                timestamp: ts(2),
            }
        ));

        assert_eq!(
            changes.try_recv().unwrap(),
            StoreChange::Removed {
                conversation_id: "c1".into(),
                id: "srv-1".into()
            }
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            StoreChange::Reconciled {
                conversation_id: "c1".into(),
                client_message_id: "m1".into(),
                id: "srv-1".into()
            }
        );
        assert!(changes.try_recv().is_err());
        assert_eq!(store.get("c1").len(), 1);
    }

    #[test]
    fn test_plain_reconcile_announces_no_removal() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "mine", 1));
        let mut changes = store.changes();
        store.reconcile(
            "c1",
            "m1",
            Resolved {
                id: "srv-1".into(),
                timestamp: ts(2),
            },
        );
        assert!(matches!(
            changes.try_recv().unwrap(),
            StoreChange::Reconciled { .. }
        ));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_repeated_reconcile_is_idempotent() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "mine", 1));
        let resolved = Resolved {
            id: "s1".into(),
            timestamp: ts(2),
        };
        assert!(store.reconcile("c1", "m1", resolved.clone()));
        assert!(!store.reconcile("c1", "m1", resolved));
        assert_eq!(store.get("c1").len(), 1);
    }

    #[test]
    fn test_find_pending_echo_respects_window_and_state() {
        let store = ConversationStore::new();
        store.append("c1", pending("m1", "oi", 0));
        store.append("c1", pending("m2", "oi", 1));

        let window = Duration::from_secs(5);
        assert_eq!(
            store.find_pending_echo("c1", "me", "oi", ts(2), window).as_deref(),
            Some("m1")
        );
        assert_eq!(store.find_pending_echo("c1", "me", "oi", ts(60), window), None);
        assert_eq!(store.find_pending_echo("c1", "other", "oi", ts(2), window), None);

        store.mark_failed("c1", "m1");
        assert_eq!(
            store.find_pending_echo("c1", "me", "oi", ts(2), window).as_deref(),
            Some("m2")
        );
    }

    #[test]
    fn test_change_feed_reports_mutations() {
        let store = ConversationStore::new();
        let mut changes = store.changes();
        store.append("c1", pending("m1", "x", 0));
        store.mark_failed("c1", "m1");

        assert_eq!(
            changes.try_recv().unwrap(),
            StoreChange::Appended {
                conversation_id: "c1".into(),
                id: "m1".into()
            }
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            StoreChange::Failed {
                conversation_id: "c1".into(),
                client_message_id: "m1".into()
            }
        );
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_conversation_of_finds_local_entries_only() {
        let store = ConversationStore::new();
        store.append("c1", inbound("s1", "a", 0));
        store.append("c2", pending("m1", "b", 1));
        assert_eq!(store.conversation_of("m1").as_deref(), Some("c2"));
        assert_eq!(store.conversation_of("s1"), None);
    }

    #[test]
    fn test_conversations_are_independent() {
        let store = ConversationStore::new();
        store.append("c1", inbound("s1", "a", 0));
        store.append("c2", inbound("s1", "b", 0));
        assert_eq!(contents(&store, "c1"), vec!["a"]);
        assert_eq!(contents(&store, "c2"), vec!["b"]);
        assert_eq!(store.conversation_ids(), vec!["c1", "c2"]);
        assert!(store.get("c3").is_empty());
    }
}
