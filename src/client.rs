//! Composition root.
//!
//! [`ChatClient`] owns one [`Connection`], a [`Router`] draining its event
//! stream, a [`ConversationStore`] and a [`ChatSession`], all built from a
//! [`Config`]. Everything is constructed here and passed down explicitly;
//! there is no process-wide instance.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ConnectionError;
use crate::router::Router;
use crate::session::ChatSession;
use crate::store::ConversationStore;
use crate::transport::{Connection, ConnectionState, Credentials, Dialer, FrameSink};
use crate::ws::WsDialer;

/// A fully wired chat client.
pub struct ChatClient {
    connection: Connection,
    router: Router,
    session: ChatSession,
    router_task: Option<JoinHandle<()>>,
    url: String,
    credentials: Credentials,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("url", &self.url)
            .field("state", &self.connection.state())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Wire a client that dials through `dialer`. Must be called from within
    /// a Tokio runtime; the router task is spawned immediately.
    pub fn new(config: &Config, dialer: Arc<dyn Dialer>) -> Self {
        let mut connection = Connection::new(dialer, config.connection_settings());
        let sink: Arc<dyn FrameSink> = Arc::new(connection.sender());
        let router = Router::new(sink, config.send_timeout());
        let store = ConversationStore::new();
        let session = ChatSession::new(
            router.clone(),
            store,
            connection.shared_state().subscribe(),
            config.session_settings(),
        );

        let router_task = connection
            .take_events()
            .map(|events| tokio::spawn(router.clone().run(events)));

        Self {
            connection,
            router,
            session,
            router_task,
            url: config.server_url.clone(),
            credentials: config.credentials(),
        }
    }

    /// Wire a client over real WebSockets.
    pub fn with_websocket(config: &Config) -> Self {
        Self::new(config, Arc::new(WsDialer))
    }

    /// Open the connection. Dialing and retries continue in the background.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::AlreadyOpen` if already connecting or open.
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        log::info!("[Chat] Connecting to {}", self.url);
        self.connection.open(&self.url, self.credentials.clone())
    }

    /// Close the connection and stop retrying. The client can `connect` again.
    pub async fn disconnect(&mut self) {
        self.connection.close().await;
    }

    /// The chat session controller.
    #[must_use]
    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// The message store behind the session.
    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        self.session.store()
    }

    /// The dispatch router, for extra subscriptions.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Current transport state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch transport state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.shared_state().subscribe()
    }

    /// Close the connection and stop the router task.
    pub async fn shutdown(mut self) {
        self.session.set_active_conversation(None);
        self.connection.close().await;
        if let Some(task) = self.router_task.take() {
            task.abort();
            let _ = task.await;
        }
        log::info!("[Chat] Client shut down");
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(task) = self.router_task.take() {
            task.abort();
        }
    }
}
