//! Error taxonomy for the synchronization core.
//!
//! Each layer owns its error type and recovers from it inside its own
//! boundary:
//!
//! - [`ConnectionError`] - transport failures, absorbed by the reconnect loop
//! - [`DecodeError`] - bad inbound frames, logged and dropped by the router
//! - [`SendError`] - per-message failures, surfaced to the caller
//! - [`ChatError`] - session-level rejections of `send_chat_message`

/// Transport-level failure.
///
/// Always transient: the connection loop retries after backoff and reports
/// the detail through `TransportEvent::Error`. Never surfaced to the UI as
/// a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Dialing or the WebSocket handshake failed.
    DialFailed(String),
    /// `open` was called while the connection task is still running.
    AlreadyOpen,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DialFailed(msg) => write!(f, "Dial failed: {msg}"),
            Self::AlreadyOpen => write!(f, "Connection already open"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Inbound frame could not be turned into an event.
///
/// Non-fatal: the frame is dropped and the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, missing a required field, or a field of the wrong type.
    Malformed(String),
    /// Well-formed frame with a `type` this client does not understand.
    UnknownKind(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed frame: {msg}"),
            Self::UnknownKind(kind) => write!(f, "Unknown event kind: {kind}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A single outbound message could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The connection is not `Open`. Nothing was queued.
    NotConnected,
    /// The frame was written but no ack arrived in time.
    Timeout,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected"),
            Self::Timeout => write!(f, "Timed out waiting for ack"),
        }
    }
}

impl std::error::Error for SendError {}

/// Rejection from the chat session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatError {
    /// No conversation is selected.
    NoActiveConversation,
    /// The transport is not open; no Pending entry was created.
    NotConnected,
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoActiveConversation => write!(f, "No active conversation"),
            Self::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for ChatError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(SendError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            DecodeError::UnknownKind("typing".into()).to_string(),
            "Unknown event kind: typing"
        );
        assert_eq!(
            ConnectionError::DialFailed("refused".into()).to_string(),
            "Dial failed: refused"
        );
        assert_eq!(
            ChatError::NoActiveConversation.to_string(),
            "No active conversation"
        );
    }
}
