//! Chat session controller.
//!
//! Binds the active conversation to the router, applies the dedup policy
//! for inbound messages, and runs the optimistic send state machine:
//!
//! ```text
//!   send_chat_message ──► append Pending ──► router.send
//!                                              │
//!                        ack / echo ◄──────────┼──────────► timeout / NotConnected
//!                            │                                     │
//!                       reconcile → Sent                     mark_failed → Failed
//! ```
//!
//! Dependencies are passed in, never reached through globals, so several
//! isolated sessions can coexist (one per test, for instance).

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::{InboundEvent, InboundMessage, OutboundIntent};
use crate::error::{ChatError, SendError};
use crate::router::{EventHandler, Router, Subscription};
use crate::store::{ConversationStore, DeliveryState, Message, Resolved};
use crate::transport::ConnectionState;

/// Per-session policy.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Identity of the local user, stamped on optimistic entries.
    pub sender_id: String,
    /// When set, echoes lacking `clientMessageId` are matched to the oldest
    /// Pending entry with the same sender and content within this window.
    ///
    /// Ambiguous by nature (two identical messages sent close together can
    /// be matched out of order), so it is off unless configured.
    pub echo_match_window: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sender_id: "me".to_string(),
            echo_match_window: None,
        }
    }
}

/// Currently selected conversation and its live subscription.
struct ActiveConversation {
    id: String,
    _subscription: Subscription,
}

/// Controller binding one active conversation to the router and store.
pub struct ChatSession {
    router: Router,
    store: ConversationStore,
    connection: watch::Receiver<ConnectionState>,
    settings: Arc<SessionSettings>,
    active: Mutex<Option<ActiveConversation>>,
    _late_acks: Subscription,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("active", &self.active_conversation_id())
            .field("connected", &self.is_connected())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// An optimistic send whose ack is being awaited in the background.
///
/// Dropping it does not cancel the send; the store entry still resolves.
#[derive(Debug)]
pub struct PendingSend {
    conversation_id: String,
    client_message_id: String,
    task: JoinHandle<Result<Resolved, SendError>>,
}

impl PendingSend {
    /// Conversation the message was sent to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Correlation token of the optimistic entry.
    #[must_use]
    pub fn client_message_id(&self) -> &str {
        &self.client_message_id
    }

    /// Wait for the send to settle. The store has been updated by the time
    /// this returns.
    pub async fn outcome(self) -> Result<Resolved, SendError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("[Chat] Send task for {} failed: {}", self.client_message_id, e);
                Err(SendError::Timeout)
            }
        }
    }
}

impl ChatSession {
    /// Create a session with no active conversation.
    ///
    /// Confirmations that arrive after their send gave up are applied for
    /// the lifetime of the session, whichever conversation is active.
    #[must_use]
    pub fn new(
        router: Router,
        store: ConversationStore,
        connection: watch::Receiver<ConnectionState>,
        settings: SessionSettings,
    ) -> Self {
        let late_acks = router.subscribe_late_acks(late_ack_handler(store.clone()));
        Self {
            router,
            store,
            connection,
            settings: Arc::new(settings),
            active: Mutex::new(None),
            _late_acks: late_acks,
        }
    }

    /// The store this session writes to.
    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Whether the transport is `Open`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.borrow().is_open()
    }

    /// Current transport state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    /// Wait until the transport is `Open`. Returns `false` if it closed for good.
    pub async fn wait_until_connected(&self) -> bool {
        let mut rx = self.connection.clone();
        let result = rx
            .wait_for(|state| state.is_open() || *state == ConnectionState::Closed)
            .await
            .map(|state| state.is_open());
        result.unwrap_or(false)
    }

    /// Id of the active conversation, if any.
    #[must_use]
    pub fn active_conversation_id(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.id.clone())
    }

    /// Switch the active conversation.
    ///
    /// The previous conversation's handler is unsubscribed before the new
    /// one is subscribed. Its stored messages and in-flight sends are
    /// untouched.
    pub fn set_active_conversation(&self, conversation_id: Option<String>) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().map(|a| a.id.as_str()) == conversation_id.as_deref() {
            return;
        }

        if let Some(previous) = active.take() {
            log::info!("[Chat] Leaving conversation {}", previous.id);
            drop(previous);
        }

        *active = conversation_id.map(|id| {
            log::info!("[Chat] Entering conversation {}", id);
            let handler = inbound_handler(self.store.clone(), Arc::clone(&self.settings));
            ActiveConversation {
                _subscription: self.router.subscribe(id.clone(), handler),
                id,
            }
        });
    }

    /// Send `content` to the active conversation.
    ///
    /// On success a `Pending` entry is already in the store and the returned
    /// [`PendingSend`] settles it to `Sent` or `Failed`. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `ChatError::NoActiveConversation` if no conversation is selected
    /// - `ChatError::NotConnected` if the transport is not open; the store is
    ///   left unchanged
    pub fn send_chat_message(&self, content: impl Into<String>) -> Result<PendingSend, ChatError> {
        let conversation_id = self
            .active_conversation_id()
            .ok_or(ChatError::NoActiveConversation)?;
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }

        let content = content.into();
        let client_message_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        self.store.append(
            &conversation_id,
            Message {
                id: client_message_id.clone(),
                conversation_id: conversation_id.clone(),
                content: content.clone(),
                sender_id: self.settings.sender_id.clone(),
                is_agent: false,
                timestamp: now,
                delivery_state: DeliveryState::Pending,
                client_message_id: Some(client_message_id.clone()),
            },
        );

        let intent = OutboundIntent::SendMessage {
            conversation_id: conversation_id.clone(),
            content,
            client_timestamp: now,
            client_message_id: client_message_id.clone(),
        };

        let router = self.router.clone();
        let store = self.store.clone();
        let task = {
            let conversation_id = conversation_id.clone();
            let client_message_id = client_message_id.clone();
            tokio::spawn(async move {
                match router.send(&intent).await {
                    Ok(ack) => {
                        let resolved = Resolved {
                            id: ack.message_id.unwrap_or_else(|| client_message_id.clone()),
                            timestamp: ack.timestamp,
                        };
                        store.reconcile(&conversation_id, &client_message_id, resolved.clone());
                        Ok(resolved)
                    }
                    Err(e) => {
                        log::warn!("[Chat] Send {} failed: {}", client_message_id, e);
                        store.mark_failed(&conversation_id, &client_message_id);
                        Err(e)
                    }
                }
            })
        };

        Ok(PendingSend {
            conversation_id,
            client_message_id,
            task,
        })
    }
}

fn inbound_handler(store: ConversationStore, settings: Arc<SessionSettings>) -> EventHandler {
    Arc::new(move |event: &InboundEvent| {
        if let InboundEvent::Message(msg) = event {
            apply_inbound(&store, &settings, msg);
        }
    })
}

/// Upgrade the local entry named by a late ack or correlated echo.
fn late_ack_handler(store: ConversationStore) -> EventHandler {
    Arc::new(move |event: &InboundEvent| {
        let (client_message_id, resolved) = match event {
            InboundEvent::Ack(ack) => (
                &ack.client_message_id,
                Resolved {
                    id: ack
                        .message_id
                        .clone()
                        .unwrap_or_else(|| ack.client_message_id.clone()),
                    timestamp: ack.timestamp,
                },
            ),
            InboundEvent::Message(msg) => {
                let Some(token) = &msg.client_message_id else {
                    return;
                };
                (
                    token,
                    Resolved {
                        id: msg.message_id.clone().unwrap_or_else(|| token.clone()),
                        timestamp: msg.server_timestamp,
                    },
                )
            }
            InboundEvent::Error { .. } | InboundEvent::Heartbeat => return,
        };

        let Some(conversation_id) = store.conversation_of(client_message_id) else {
            return;
        };
        if store.reconcile(&conversation_id, client_message_id, resolved) {
            log::info!("[Chat] Late confirmation for {} in {}", client_message_id, conversation_id);
        }
    })
}

/// Apply one inbound message: reconcile our own echo, otherwise append.
fn apply_inbound(store: &ConversationStore, settings: &SessionSettings, msg: &InboundMessage) {
    let conversation_id = msg.conversation_id.as_str();

    let echo_of = match &msg.client_message_id {
        Some(token) => store
            .delivery_state(conversation_id, token)
            .map(|_| token.clone()),
        None => settings.echo_match_window.and_then(|window| {
            if msg.sender_id != settings.sender_id {
                return None;
            }
            let matched = store.find_pending_echo(
                conversation_id,
                &msg.sender_id,
                &msg.content,
                msg.server_timestamp,
                window,
            );
            if let Some(token) = &matched {
                log::debug!("[Chat] Best-effort echo match for {}", token);
            }
            matched
        }),
    };

    if let Some(client_message_id) = echo_of {
        let resolved = Resolved {
            id: msg
                .message_id
                .clone()
                .unwrap_or_else(|| client_message_id.clone()),
            timestamp: msg.server_timestamp,
        };
        store.reconcile(conversation_id, &client_message_id, resolved);
        return;
    }

    let appended = store.append(
        conversation_id,
        Message {
            id: msg
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: conversation_id.to_string(),
            content: msg.content.clone(),
            sender_id: msg.sender_id.clone(),
            is_agent: msg.is_agent,
            timestamp: msg.server_timestamp,
            delivery_state: DeliveryState::Sent,
            client_message_id: msg.client_message_id.clone(),
        },
    );
    if appended {
        log::trace!("[Chat] Message from {} in {}", msg.sender_id, conversation_id);
    }
}
