//! Dispatch router: pub/sub fabric between the transport and features.
//!
//! Routes decoded inbound events to subscribers by conversation id and gives
//! every caller one `send` API regardless of connection state. Holds no
//! message history and applies no ordering policy; the only state beyond
//! subscriptions is the table of sends still waiting for their ack.
//!
//! # Architecture
//!
//! ```text
//!   TransportEvent stream ──► Router::run ──decode──► publish(event)
//!                                                        │
//!                           ┌────────────────────────────┼──────────────┐
//!                           ▼                            ▼              ▼
//!                  pending ack table          conversation handlers  global handlers
//!                  (resolves send futures)    (by conversation id)   (error/heartbeat)
//! ```
//!
//! Handlers run synchronously inside `publish`, one event at a time, in
//! arrival order. That is the ordering guarantee the chat session relies on.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::codec::{self, Ack, InboundEvent, OutboundIntent};
use crate::error::SendError;
use crate::transport::{FrameSink, TransportEvent};

/// Callback invoked for each routed event.
pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Cloneable pub/sub router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    outbound: Arc<dyn FrameSink>,
    ack_timeout: Duration,
    conversations: Mutex<HashMap<String, Vec<(u64, EventHandler)>>>,
    global: Mutex<Vec<(u64, EventHandler)>>,
    late_acks: Mutex<Vec<(u64, EventHandler)>>,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<Ack>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("ack_timeout", &self.inner.ack_timeout)
            .field("pending_acks", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Which subscriber list a [`Subscription`] lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Topic {
    Conversation(String),
    Global,
    LateAck,
}

/// Live registration of a handler.
///
/// Unsubscribes on [`Subscription::unsubscribe`] or drop; after either
/// returns, the handler is never called again.
#[derive(Debug)]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    router: Weak<RouterInner>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Conversation this subscription listens to, `None` for global ones.
    pub fn conversation_id(&self) -> Option<&str> {
        match &self.topic {
            Topic::Conversation(id) => Some(id),
            Topic::Global | Topic::LateAck => None,
        }
    }

    /// Remove the handler now.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    fn remove(&self) {
        let Some(inner) = self.router.upgrade() else {
            return;
        };
        match &self.topic {
            Topic::Conversation(conversation_id) => {
                let mut conversations = lock(&inner.conversations);
                if let Some(handlers) = conversations.get_mut(conversation_id) {
                    handlers.retain(|(id, _)| *id != self.id);
                    if handlers.is_empty() {
                        conversations.remove(conversation_id);
                    }
                }
            }
            Topic::Global => lock(&inner.global).retain(|(id, _)| *id != self.id),
            Topic::LateAck => lock(&inner.late_acks).retain(|(id, _)| *id != self.id),
        }
        log::debug!("[Router] Unsubscribed {:?}", self.topic);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Router {
    /// Create a router writing through `outbound`.
    ///
    /// `ack_timeout` bounds how long [`Self::send`] waits for the server ack.
    #[must_use]
    pub fn new(outbound: Arc<dyn FrameSink>, ack_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                outbound,
                ack_timeout,
                conversations: Mutex::new(HashMap::new()),
                global: Mutex::new(Vec::new()),
                late_acks: Mutex::new(Vec::new()),
                pending_acks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for events of one conversation.
    pub fn subscribe(
        &self,
        conversation_id: impl Into<String>,
        handler: EventHandler,
    ) -> Subscription {
        let conversation_id = conversation_id.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.conversations)
            .entry(conversation_id.clone())
            .or_default()
            .push((id, handler));
        log::debug!("[Router] Subscribed to conversation {}", conversation_id);
        Subscription {
            router: Arc::downgrade(&self.inner),
            topic: Topic::Conversation(conversation_id),
            id,
        }
    }

    /// Register `handler` for events that carry no conversation id
    /// (`Error`, `Heartbeat`).
    pub fn subscribe_global(&self, handler: EventHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.global).push((id, handler));
        Subscription {
            router: Arc::downgrade(&self.inner),
            topic: Topic::Global,
            id,
        }
    }

    /// Register `handler` for acks and correlated echoes whose send is no
    /// longer waiting (it timed out, or was never sent from here).
    ///
    /// Receives `Ack` events and `Message` events carrying a
    /// `clientMessageId`, regardless of conversation subscriptions.
    pub fn subscribe_late_acks(&self, handler: EventHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.late_acks).push((id, handler));
        Subscription {
            router: Arc::downgrade(&self.inner),
            topic: Topic::LateAck,
            id,
        }
    }

    /// Number of handlers registered for `conversation_id`.
    #[must_use]
    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        lock(&self.inner.conversations)
            .get(conversation_id)
            .map_or(0, Vec::len)
    }

    /// Number of sends still waiting for an ack.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending_acks).len()
    }

    /// Fan `event` out to its subscribers.
    ///
    /// Acks, and message echoes carrying a `clientMessageId`, also resolve
    /// the matching pending send. When no send is waiting any more they go
    /// to the late-ack handlers instead.
    pub fn publish(&self, event: &InboundEvent) {
        match event {
            InboundEvent::Ack(ack) => {
                if !self.resolve_ack(ack.clone()) {
                    self.dispatch_late(event);
                }
                return;
            }
            InboundEvent::Message(msg) => {
                if let Some(client_message_id) = &msg.client_message_id {
                    let resolved = self.resolve_ack(Ack {
                        client_message_id: client_message_id.clone(),
                        message_id: msg.message_id.clone(),
                        timestamp: msg.server_timestamp,
                    });
                    if !resolved {
                        self.dispatch_late(event);
                    }
                }
            }
            InboundEvent::Error { detail } => {
                log::warn!("[Router] Server error: {}", detail);
            }
            InboundEvent::Heartbeat => log::trace!("[Router] Heartbeat"),
        }

        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<EventHandler> = match event.conversation_id() {
            Some(conversation_id) => lock(&self.inner.conversations)
                .get(conversation_id)
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default(),
            None => lock(&self.inner.global)
                .iter()
                .map(|(_, h)| Arc::clone(h))
                .collect(),
        };

        if handlers.is_empty() {
            log::trace!("[Router] No subscribers for {} event", event.kind());
        }
        for handler in handlers {
            handler(event);
        }
    }

    /// Hand `ack` to its waiting send. Returns `false` if nobody was waiting.
    fn resolve_ack(&self, ack: Ack) -> bool {
        let waiter = lock(&self.inner.pending_acks).remove(&ack.client_message_id);
        let Some(tx) = waiter else {
            log::debug!("[Router] Late ack for {}", ack.client_message_id);
            return false;
        };
        log::debug!("[Router] Ack for {}", ack.client_message_id);
        tx.send(ack).is_ok()
    }

    fn dispatch_late(&self, event: &InboundEvent) {
        let handlers: Vec<EventHandler> = lock(&self.inner.late_acks)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Encode and send `intent`, then wait for its ack.
    ///
    /// # Errors
    ///
    /// - `SendError::NotConnected` immediately if the transport is not open
    /// - `SendError::Timeout` if no ack arrives within the ack timeout
    pub async fn send(&self, intent: &OutboundIntent) -> Result<Ack, SendError> {
        let client_message_id = intent.client_message_id().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending_acks).insert(client_message_id.clone(), tx);

        if let Err(e) = self.inner.outbound.send_frame(codec::encode(intent)) {
            lock(&self.inner.pending_acks).remove(&client_message_id);
            return Err(e);
        }
        log::debug!("[Router] Sent {}", client_message_id);

        match tokio::time::timeout(self.inner.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) | Err(_) => {
                lock(&self.inner.pending_acks).remove(&client_message_id);
                log::warn!("[Router] No ack for {} within {:?}", client_message_id, self.inner.ack_timeout);
                Err(SendError::Timeout)
            }
        }
    }

    /// Drain the transport event stream, decoding and publishing frames one
    /// at a time in arrival order. Returns when the stream ends.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(frame) => match codec::decode(&frame) {
                    Ok(inbound) => self.publish(&inbound),
                    Err(e) => log::warn!(
                        "[Router] Dropping frame: {} ({})",
                        e,
                        String::from_utf8_lossy(&frame[..frame.len().min(120)])
                    ),
                },
                TransportEvent::StateChanged(state) => {
                    log::debug!("[Router] Connection state {:?}", state);
                }
                TransportEvent::Opened => log::info!("[Router] Connection open"),
                TransportEvent::Closed { reason } => {
                    log::info!("[Router] Connection closed: {}", reason);
                }
                TransportEvent::Error { detail } => {
                    log::debug!("[Router] Transport error: {}", detail);
                }
            }
        }
        log::debug!("[Router] Transport event stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InboundMessage;
    use chrono::Utc;

    /// Records frames, or refuses them when `open` is false.
    #[derive(Default)]
    struct RecordingSink {
        open: std::sync::atomic::AtomicBool,
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        fn open() -> Arc<Self> {
            let sink = Self::default();
            sink.open.store(true, Ordering::SeqCst);
            Arc::new(sink)
        }
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: Vec<u8>) -> Result<(), SendError> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(SendError::NotConnected);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn message(conversation_id: &str, content: &str) -> InboundEvent {
        InboundEvent::Message(InboundMessage {
            conversation_id: conversation_id.into(),
            sender_id: "u".into(),
            content: content.into(),
            is_agent: false,
            server_timestamp: Utc::now(),
            message_id: None,
            client_message_id: None,
        })
    }

    fn intent(client_message_id: &str) -> OutboundIntent {
        OutboundIntent::SendMessage {
            conversation_id: "c1".into(),
            content: "oi".into(),
            client_timestamp: Utc::now(),
            client_message_id: client_message_id.into(),
        }
    }

    fn collector() -> (EventHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |event: &InboundEvent| {
            if let InboundEvent::Message(m) = event {
                sink.lock().unwrap().push(m.content.clone());
            }
        });
        (handler, seen)
    }

    #[test]
    fn test_publish_routes_by_conversation_in_order() {
        let router = Router::new(RecordingSink::open(), Duration::from_secs(1));
        let (h1, seen1) = collector();
        let (h2, seen2) = collector();
        let _s1 = router.subscribe("c1", h1);
        let _s2 = router.subscribe("c2", h2);

        router.publish(&message("c1", "a"));
        router.publish(&message("c2", "x"));
        router.publish(&message("c1", "b"));

        assert_eq!(*seen1.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(*seen2.lock().unwrap(), vec!["x"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let router = Router::new(RecordingSink::open(), Duration::from_secs(1));
        let (handler, seen) = collector();
        let sub = router.subscribe("c1", handler);
        router.publish(&message("c1", "a"));
        sub.unsubscribe();
        router.publish(&message("c1", "b"));

        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
        assert_eq!(router.subscriber_count("c1"), 0);
    }

    #[test]
    fn test_drop_unsubscribes_only_that_handler() {
        let router = Router::new(RecordingSink::open(), Duration::from_secs(1));
        let (h1, seen1) = collector();
        let (h2, seen2) = collector();
        let s1 = router.subscribe("c1", h1);
        let _s2 = router.subscribe("c1", h2);
        drop(s1);
        router.publish(&message("c1", "a"));

        assert!(seen1.lock().unwrap().is_empty());
        assert_eq!(*seen2.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_global_handlers_get_connection_level_events() {
        let router = Router::new(RecordingSink::open(), Duration::from_secs(1));
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let _sub = router.subscribe_global(Arc::new(move |_: &InboundEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        router.publish(&InboundEvent::Heartbeat);
        router.publish(&InboundEvent::Error {
            detail: "oops".into(),
        });
        router.publish(&message("c1", "not global"));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_send_not_connected_fails_immediately() {
        let router = Router::new(Arc::new(RecordingSink::default()), Duration::from_secs(5));
        let result = router.send(&intent("m1")).await;
        assert_eq!(result, Err(SendError::NotConnected));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_times_out_without_ack() {
        let router = Router::new(RecordingSink::open(), Duration::from_millis(20));
        let result = router.send(&intent("m1")).await;
        assert_eq!(result, Err(SendError::Timeout));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_resolves_on_ack_frame() {
        let sink = RecordingSink::open();
        let router = Router::new(Arc::clone(&sink) as Arc<dyn FrameSink>, Duration::from_secs(2));

        let sender = router.clone();
        let pending = tokio::spawn(async move { sender.send(&intent("m1")).await });

        while router.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let frame: serde_json::Value =
            serde_json::from_slice(&sink.frames.lock().unwrap()[0]).unwrap();
        assert_eq!(frame["clientMessageId"], "m1");

        let ack = Ack {
            client_message_id: "m1".into(),
            message_id: Some("srv-1".into()),
            timestamp: Utc::now(),
        };
        router.publish(&InboundEvent::Ack(ack.clone()));
        assert_eq!(pending.await.unwrap(), Ok(ack));
    }

    #[tokio::test]
    async fn test_send_resolves_on_message_echo() {
        let router = Router::new(RecordingSink::open(), Duration::from_secs(2));
        let sender = router.clone();
        let pending = tokio::spawn(async move { sender.send(&intent("m1")).await });
        while router.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let InboundEvent::Message(mut echo) = message("c1", "oi") else {
            unreachable!()
        };
        echo.client_message_id = Some("m1".into());
        echo.message_id = Some("srv-7".into());
        router.publish(&InboundEvent::Message(echo));

        let ack = pending.await.unwrap().unwrap();
        assert_eq!(ack.message_id.as_deref(), Some("srv-7"));
    }

    #[tokio::test]
    async fn test_acks_after_timeout_reach_late_ack_handlers() {
        let router = Router::new(RecordingSink::open(), Duration::from_millis(20));
        let late = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&late);
        let _late_sub = router.subscribe_late_acks(Arc::new(move |event: &InboundEvent| {
            record.lock().unwrap().push(event.kind());
        }));

        assert_eq!(router.send(&intent("m1")).await, Err(SendError::Timeout));

        router.publish(&InboundEvent::Ack(Ack {
            client_message_id: "m1".into(),
            message_id: Some("srv-1".into()),
            timestamp: Utc::now(),
        }));
        let InboundEvent::Message(mut echo) = message("c1", "oi") else {
            unreachable!()
        };
        echo.client_message_id = Some("m1".into());
        router.publish(&InboundEvent::Message(echo));
        // Uncorrelated messages never count as late acks.
        router.publish(&message("c1", "plain"));

        assert_eq!(*late.lock().unwrap(), vec!["ack", "message"]);
    }

    #[tokio::test]
    async fn test_matched_ack_skips_late_ack_handlers() {
        let router = Router::new(RecordingSink::open(), Duration::from_secs(2));
        let late = Arc::new(Mutex::new(0usize));
        let record = Arc::clone(&late);
        let _late_sub = router.subscribe_late_acks(Arc::new(move |_: &InboundEvent| {
            *record.lock().unwrap() += 1;
        }));

        let sender = router.clone();
        let pending = tokio::spawn(async move { sender.send(&intent("m1")).await });
        while router.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        router.publish(&InboundEvent::Ack(Ack {
            client_message_id: "m1".into(),
            message_id: None,
            timestamp: Utc::now(),
        }));
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(*late.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_decodes_and_drops_bad_frames() {
        let router = Router::new(RecordingSink::open(), Duration::from_secs(1));
        let (handler, seen) = collector();
        let _sub = router.subscribe("c1", handler);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TransportEvent::Message(b"not json".to_vec())).unwrap();
        tx.send(TransportEvent::Message(br#"{"type":"typing"}"#.to_vec())).unwrap();
        tx.send(TransportEvent::Message(
            br#"{"type":"message","conversationId":"c1","senderId":"u","content":"ok","isAgent":false}"#
                .to_vec(),
        ))
        .unwrap();
        drop(tx);

        router.clone().run(rx).await;
        assert_eq!(*seen.lock().unwrap(), vec!["ok"]);
    }
}
