//! Envelope and payload encoding.

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::message::*;

/// Serialized form of an envelope.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    uid: String,
    method: u32,
    #[serde(default)]
    params: Vec<u8>,
}

/// A decoded control message together with the node that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEnvelope {
    pub sender: String,
    pub message: ControlMessage,
}

impl ControlEnvelope {
    pub fn new(sender: impl Into<String>, message: impl Into<ControlMessage>) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
        }
    }

    pub fn encode(&self) -> ControlResult<Vec<u8>> {
        encode_envelope(&self.sender, &self.message)
    }
}

/// Encode a single payload.
pub fn encode_payload<T: ControlPayload>(msg: &T) -> ControlResult<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|e| ControlError::Encode(e.to_string()))
}

/// Decode a single payload.
pub fn decode_payload<T: ControlPayload>(bytes: &[u8]) -> ControlResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| ControlError::Decode(format!("{}: {e}", T::METHOD.as_str())))
}

/// Wrap `message` in an envelope stamped with `sender`.
pub fn encode_envelope(sender: &str, message: &ControlMessage) -> ControlResult<Vec<u8>> {
    let params = match message {
        ControlMessage::Node(m) => encode_payload(m)?,
        ControlMessage::Shutdown(m) => encode_payload(m)?,
        ControlMessage::Unsubscribe(m) => encode_payload(m)?,
        ControlMessage::Disconnect(m) => encode_payload(m)?,
        ControlMessage::SurveyRequest(m) => encode_payload(m)?,
        ControlMessage::SurveyResponse(m) => encode_payload(m)?,
        ControlMessage::Subscribe(m) => encode_payload(m)?,
        ControlMessage::Notification(m) => encode_payload(m)?,
    };

    let wire = WireEnvelope {
        uid: sender.to_string(),
        method: message.method().as_u32(),
        params,
    };
    serde_json::to_vec(&wire).map_err(|e| ControlError::Encode(e.to_string()))
}

/// Decode an envelope and its payload.
///
/// Returns [`ControlError::UnknownMethod`] for tags this build does not
/// know, so newer peers can introduce methods without breaking older ones.
pub fn decode_envelope(bytes: &[u8]) -> ControlResult<ControlEnvelope> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| ControlError::Decode(format!("envelope: {e}")))?;

    let Some(method) = ControlMethod::from_u32(wire.method) else {
        return Err(ControlError::UnknownMethod {
            sender: wire.uid,
            method: wire.method,
        });
    };

    let params = wire.params.as_slice();
    let message = match method {
        ControlMethod::Node => ControlMessage::Node(decode_payload(params)?),
        ControlMethod::Shutdown => ControlMessage::Shutdown(decode_payload(params)?),
        ControlMethod::Unsubscribe => ControlMessage::Unsubscribe(decode_payload(params)?),
        ControlMethod::Disconnect => ControlMessage::Disconnect(decode_payload(params)?),
        ControlMethod::SurveyRequest => ControlMessage::SurveyRequest(decode_payload(params)?),
        ControlMethod::SurveyResponse => ControlMessage::SurveyResponse(decode_payload(params)?),
        ControlMethod::Subscribe => ControlMessage::Subscribe(decode_payload(params)?),
        ControlMethod::Notification => ControlMessage::Notification(decode_payload(params)?),
    };

    Ok(ControlEnvelope {
        sender: wire.uid,
        message,
    })
}
