//! Error types for the cluster control plane.

use thiserror::Error;

use crate::broker::BrokerError;

/// Result type alias for control-plane operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced to callers of `broadcast` and `survey`.
///
/// Receive-side failures (bad envelopes, unknown methods) are logged and
/// dropped inside the coordinator and never become a `ClusterError`.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Codec(#[from] pulsegrid_control::ControlError),

    #[error("no survey handler registered")]
    NoSurveyHandler,
}
