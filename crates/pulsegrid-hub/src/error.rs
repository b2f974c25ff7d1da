//! Error types for command dispatch and node assembly.

use thiserror::Error;

use pulse_core::{ConfigError, Disconnect, ReplyError, disconnect_code};
use pulsegrid_cluster::ClusterError;

/// Result type alias for node-level operations.
pub type HubResult<T> = Result<T, HubError>;

/// What an application handler can fail with.
///
/// A reply error goes back to the client and the connection survives; a
/// disconnect closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("reply error {0}")]
    Reply(#[from] ReplyError),

    #[error("{0}")]
    Disconnect(#[from] Disconnect),
}

/// Why a command was not accepted by a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The connection is closing or closed.
    #[error("connection closed: {0}")]
    Disconnected(Disconnect),

    /// The connection was closed because its credentials expired.
    #[error("connection expired")]
    Expired,

    /// The command is not allowed in the connection's current state; the
    /// connection has been closed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl DispatchError {
    pub(crate) fn closed(disconnect: Disconnect) -> Self {
        if disconnect.code == disconnect_code::EXPIRED {
            Self::Expired
        } else {
            Self::Disconnected(disconnect)
        }
    }
}

/// Errors from assembling or running a node.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}
