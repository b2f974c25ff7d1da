//! Error types for the control codec.

use thiserror::Error;

/// Result type alias for codec operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur while encoding or decoding control messages.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unknown control method {method} from {sender}")]
    UnknownMethod { sender: String, method: u32 },
}
