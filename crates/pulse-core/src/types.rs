//! Shared types used across PulseGrid crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a client connection.
pub type ClientId = String;

// ── Node identity ──────────────────────────────────────────────────

/// This process's cluster identity. Created once at startup.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub name: String,
    pub version: String,
    /// Unix timestamp (seconds) when the node started.
    pub started_at: u64,
    started: Instant,
}

impl NodeIdentity {
    /// Create an identity with a freshly generated node ID.
    pub fn new(name: &str, version: &str) -> Self {
        Self::with_id(generate_node_id(name), name, version)
    }

    pub fn with_id(id: impl Into<NodeId>, name: &str, version: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            version: version.to_string(),
            started_at: epoch_secs(),
            started: Instant::now(),
        }
    }

    /// Seconds since the node started.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Generate a node ID from the node name, process ID and start time.
fn generate_node_id(name: &str) -> NodeId {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    format!("node-{:08x}", hasher.finish() as u32)
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Disconnect ─────────────────────────────────────────────────────

/// Disconnect codes sent to clients when the server closes a connection.
///
/// 3000-3499 allow the client to reconnect; 3500-3999 tell it not to.
pub mod disconnect_code {
    pub const CONNECTION_CLOSED: u32 = 3000;
    pub const SHUTDOWN: u32 = 3001;
    pub const SERVER_ERROR: u32 = 3004;
    pub const EXPIRED: u32 = 3005;
    pub const FORCE_RECONNECT: u32 = 3011;
    pub const INVALID_TOKEN: u32 = 3500;
    pub const BAD_REQUEST: u32 = 3501;
    pub const FORCE_NO_RECONNECT: u32 = 3503;
}

/// Why a connection is being closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub code: u32,
    pub reason: String,
}

impl Disconnect {
    pub fn new(code: u32, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn connection_closed() -> Self {
        Self::new(disconnect_code::CONNECTION_CLOSED, "connection closed")
    }

    pub fn shutdown() -> Self {
        Self::new(disconnect_code::SHUTDOWN, "shutdown")
    }

    pub fn expired() -> Self {
        Self::new(disconnect_code::EXPIRED, "expired")
    }

    pub fn bad_request() -> Self {
        Self::new(disconnect_code::BAD_REQUEST, "bad request")
    }

    pub fn server_error() -> Self {
        Self::new(disconnect_code::SERVER_ERROR, "internal server error")
    }

    /// Whether the client is allowed to reconnect after this disconnect.
    pub fn reconnect(&self) -> bool {
        self.code < 3500
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disconnect {}: {}", self.code, self.reason)
    }
}

impl std::error::Error for Disconnect {}

// ── Reply errors ───────────────────────────────────────────────────

pub mod error_code {
    pub const INTERNAL: u32 = 100;
    pub const UNAUTHORIZED: u32 = 101;
    pub const UNKNOWN_CHANNEL: u32 = 102;
    pub const PERMISSION_DENIED: u32 = 103;
    pub const METHOD_NOT_FOUND: u32 = 104;
    pub const ALREADY_SUBSCRIBED: u32 = 105;
    pub const LIMIT_EXCEEDED: u32 = 106;
    pub const BAD_REQUEST: u32 = 107;
    pub const NOT_AVAILABLE: u32 = 108;
    pub const TOKEN_EXPIRED: u32 = 109;
    pub const EXPIRED: u32 = 110;
    pub const UNRECOVERABLE_POSITION: u32 = 112;
}

/// Error carried in a client reply. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: u32,
    pub message: String,
    #[serde(default)]
    pub temporary: bool,
}

impl ReplyError {
    pub fn new(code: u32, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            temporary: false,
        }
    }

    pub fn internal() -> Self {
        Self {
            temporary: true,
            ..Self::new(error_code::INTERNAL, "internal server error")
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(error_code::UNAUTHORIZED, "unauthorized")
    }

    pub fn unknown_channel() -> Self {
        Self::new(error_code::UNKNOWN_CHANNEL, "unknown channel")
    }

    pub fn permission_denied() -> Self {
        Self::new(error_code::PERMISSION_DENIED, "permission denied")
    }

    pub fn method_not_found() -> Self {
        Self::new(error_code::METHOD_NOT_FOUND, "method not found")
    }

    pub fn already_subscribed() -> Self {
        Self::new(error_code::ALREADY_SUBSCRIBED, "already subscribed")
    }

    pub fn limit_exceeded() -> Self {
        Self::new(error_code::LIMIT_EXCEEDED, "limit exceeded")
    }

    pub fn bad_request() -> Self {
        Self::new(error_code::BAD_REQUEST, "bad request")
    }

    pub fn not_available() -> Self {
        Self::new(error_code::NOT_AVAILABLE, "not available")
    }

    pub fn expired() -> Self {
        Self::new(error_code::EXPIRED, "expired")
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ReplyError {}

// ── Unsubscribe ────────────────────────────────────────────────────

pub mod unsubscribe_code {
    /// Client asked to unsubscribe.
    pub const CLIENT: u32 = 0;
    /// Connection is going away.
    pub const DISCONNECT: u32 = 1;
    pub const SERVER: u32 = 2000;
    pub const EXPIRED: u32 = 2501;
}

/// Why a subscription ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub code: u32,
    pub reason: String,
}

impl Unsubscribe {
    pub fn new(code: u32, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn client() -> Self {
        Self::new(unsubscribe_code::CLIENT, "client unsubscribed")
    }

    pub fn disconnect() -> Self {
        Self::new(unsubscribe_code::DISCONNECT, "client disconnected")
    }

    pub fn server() -> Self {
        Self::new(unsubscribe_code::SERVER, "server unsubscribe")
    }

    pub fn expired() -> Self {
        Self::new(unsubscribe_code::EXPIRED, "subscription expired")
    }
}
