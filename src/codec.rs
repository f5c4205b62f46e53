//! Frame codec: outbound intents to JSON frames, inbound frames to events.
//!
//! Pure and stateless. Wire format (JSON text frames, camelCase keys):
//!
//! ```text
//! inbound   {"type":"message","conversationId":"c1","senderId":"u2",
//!            "content":"hi","isAgent":false,
//!            "timestamp":"2026-01-01T00:00:00Z",   (optional, RFC 3339 or epoch ms)
//!            "id":"srv-9",                          (optional, server message id)
//!            "clientMessageId":"m1"}                (optional, echo correlation)
//!           {"type":"ack","clientMessageId":"m1","id":"srv-9","timestamp":...}
//!           {"type":"error","detail":"..."}
//!           {"type":"heartbeat"}                    (alias "ping")
//!
//! outbound  {"type":"send_message","conversationId":"c1","content":"hi",
//!            "timestamp":"2026-01-01T00:00:00Z","clientMessageId":"m1"}
//! ```
//!
//! Unknown keys are ignored so newer servers can add fields.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::DecodeError;

/// Chat message pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Author of the message.
    pub sender_id: String,
    /// Message text.
    pub content: String,
    /// Whether the author is an agent rather than a customer.
    pub is_agent: bool,
    /// Server timestamp, or receipt time when the frame carried none.
    pub server_timestamp: DateTime<Utc>,
    /// Server-assigned message id, when provided.
    pub message_id: Option<String>,
    /// Correlation token echoed back for a message this client sent.
    pub client_message_id: Option<String>,
}

/// Server acknowledgement of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Token the client attached to the send.
    pub client_message_id: String,
    /// Server-assigned message id, when provided.
    pub message_id: Option<String>,
    /// Server timestamp, or receipt time when the frame carried none.
    pub timestamp: DateTime<Utc>,
}

/// Decoded inbound frame. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A chat message for one conversation.
    Message(InboundMessage),
    /// Explicit acknowledgement of a send.
    Ack(Ack),
    /// Server-reported error.
    Error {
        /// Human-readable detail from the server.
        detail: String,
    },
    /// Keep-alive with no payload.
    Heartbeat,
}

impl InboundEvent {
    /// Conversation this event is scoped to, if any.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Message(msg) => Some(&msg.conversation_id),
            Self::Ack(_) | Self::Error { .. } | Self::Heartbeat => None,
        }
    }

    /// Short name used in log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Ack(_) => "ack",
            Self::Error { .. } => "error",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Something this client wants the server to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundIntent {
    /// Post a chat message to a conversation.
    SendMessage {
        /// Target conversation.
        conversation_id: String,
        /// Message text.
        content: String,
        /// Local time the user hit send.
        client_timestamp: DateTime<Utc>,
        /// Fresh correlation token, never reused.
        client_message_id: String,
    },
}

impl OutboundIntent {
    /// Correlation token the server is expected to echo back.
    #[must_use]
    pub fn client_message_id(&self) -> &str {
        match self {
            Self::SendMessage {
                client_message_id, ..
            } => client_message_id,
        }
    }
}

/// Serialize an outbound intent to a JSON text frame.
#[must_use]
pub fn encode(intent: &OutboundIntent) -> Vec<u8> {
    let value = match intent {
        OutboundIntent::SendMessage {
            conversation_id,
            content,
            client_timestamp,
            client_message_id,
        } => serde_json::json!({
            "type": "send_message",
            "conversationId": conversation_id,
            "content": content,
            "timestamp": client_timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "clientMessageId": client_message_id,
        }),
    };
    value.to_string().into_bytes()
}

/// Decode an inbound frame, stamping missing timestamps with the current time.
pub fn decode(frame: &[u8]) -> Result<InboundEvent, DecodeError> {
    decode_at(frame, Utc::now())
}

/// Decode an inbound frame received at `received_at`.
pub fn decode_at(frame: &[u8], received_at: DateTime<Utc>) -> Result<InboundEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(frame)
        .map_err(|e| DecodeError::Malformed(format!("invalid JSON: {e}")))?;

    let kind = value
        .get("type")
        .ok_or_else(|| DecodeError::Malformed("missing field `type`".into()))?
        .as_str()
        .ok_or_else(|| DecodeError::Malformed("field `type` is not a string".into()))?;

    match kind {
        "message" => {
            let wire: WireMessage = from_value(value)?;
            Ok(InboundEvent::Message(InboundMessage {
                conversation_id: wire.conversation_id,
                sender_id: wire.sender_id,
                content: wire.content,
                is_agent: wire.is_agent,
                server_timestamp: resolve_timestamp(wire.timestamp, received_at)?,
                message_id: wire.id,
                client_message_id: wire.client_message_id,
            }))
        }
        "ack" => {
            let wire: WireAck = from_value(value)?;
            Ok(InboundEvent::Ack(Ack {
                client_message_id: wire.client_message_id,
                message_id: wire.id,
                timestamp: resolve_timestamp(wire.timestamp, received_at)?,
            }))
        }
        "error" => {
            let wire: WireError = from_value(value)?;
            Ok(InboundEvent::Error {
                detail: wire.detail,
            })
        }
        "heartbeat" | "ping" => Ok(InboundEvent::Heartbeat),
        other => Err(DecodeError::UnknownKind(other.to_string())),
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn resolve_timestamp(
    wire: Option<WireTimestamp>,
    received_at: DateTime<Utc>,
) -> Result<DateTime<Utc>, DecodeError> {
    match wire {
        None => Ok(received_at),
        Some(WireTimestamp::Rfc3339(ts)) => Ok(ts),
        Some(WireTimestamp::EpochMillis(ms)) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| DecodeError::Malformed(format!("timestamp out of range: {ms}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    conversation_id: String,
    sender_id: String,
    content: String,
    is_agent: bool,
    #[serde(default)]
    timestamp: Option<WireTimestamp>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    client_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAck {
    client_message_id: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<WireTimestamp>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default, alias = "message")]
    detail: String,
}

/// Servers send either RFC 3339 strings or epoch milliseconds.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
}
