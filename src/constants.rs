//! Default tunables for the synchronization core.
//!
//! Every value here can be overridden through [`crate::config::Config`];
//! these are only the defaults used when nothing is configured.

use std::time::Duration;

// ============================================================================
// Reconnection
// ============================================================================

/// Delay before the first reconnection attempt.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Upper bound for the exponential reconnection delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Maximum random jitter added on top of each reconnection delay.
///
/// Spreads reconnects from many clients after a server restart.
pub const BACKOFF_JITTER: Duration = Duration::from_secs(1);

// ============================================================================
// Liveness
// ============================================================================

/// Inbound silence after which an open connection is considered dead.
pub const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(45);

/// How often the message loop checks for a stale connection.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Messaging
// ============================================================================

/// How long a send waits for the server ack before the entry becomes `Failed`.
pub const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the store change feed before slow listeners start lagging.
pub const STORE_CHANGE_CAPACITY: usize = 256;

/// Default server URL.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3000/ws";
