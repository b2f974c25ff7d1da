//! pulsegrid-control — cluster control-message codec.
//!
//! Every control message travels between nodes inside an envelope that
//! carries the sender's node ID, a stable integer method tag and the
//! JSON-encoded payload as opaque bytes.
//!
//! # Wire shape
//!
//! ```text
//! Envelope { uid: "node-1a2b3c4d", method: 6, params: <bytes> }
//!                                          │
//!                                          └── Subscribe { user, channel }
//! ```
//!
//! Decoding never panics: malformed bytes become [`ControlError::Decode`]
//! and unrecognized tags become [`ControlError::UnknownMethod`] so the
//! receiver can log and drop without tearing down its pipeline.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode_envelope, decode_payload, encode_envelope, encode_payload, ControlEnvelope};
pub use error::{ControlError, ControlResult};
pub use message::*;
