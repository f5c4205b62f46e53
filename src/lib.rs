//! Convo Sync - live conversation synchronization core.
//!
//! Keeps a client's view of chat conversations consistent with a backend
//! over one persistent bidirectional channel.
//!
//! # Architecture
//!
//! - **Transport** - the single WebSocket channel, with reconnect/backoff
//! - **Codec** - JSON frames to typed events and back
//! - **Router** - fans inbound events out by conversation, correlates acks
//! - **Store** - per-conversation ordered message log with delivery states
//! - **Session** - active conversation, optimistic send and echo dedup
//!
//! # Modules
//!
//! - [`transport`] - Connection state machine and dialer seams
//! - [`ws`] - WebSocket dialer over `tokio-tungstenite`
//! - [`codec`] - Frame encoding/decoding
//! - [`router`] - Dispatch router
//! - [`store`] - Conversation message store
//! - [`session`] - Chat session controller
//! - [`client`] - Wires everything together
//! - [`config`] - Configuration loading/saving

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use client::ChatClient;
pub use codec::{Ack, InboundEvent, InboundMessage, OutboundIntent};
pub use config::Config;
pub use error::{ChatError, ConnectionError, DecodeError, SendError};
pub use router::{Router, Subscription};
pub use session::{ChatSession, PendingSend, SessionSettings};
pub use store::{ConversationStore, DeliveryState, Message, StoreChange};
pub use transport::{Connection, ConnectionState, TransportEvent};
