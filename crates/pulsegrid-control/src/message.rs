//! Control message payloads.
//!
//! Each payload type maps to exactly one [`ControlMethod`] tag. Maps use
//! `BTreeMap` so that encoding the same value always yields the same bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Method tag carried by every envelope.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMethod {
    Node = 0,
    Shutdown = 1,
    Unsubscribe = 2,
    Disconnect = 3,
    SurveyRequest = 4,
    SurveyResponse = 5,
    Subscribe = 6,
    Notification = 7,
}

impl ControlMethod {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Node),
            1 => Some(Self::Shutdown),
            2 => Some(Self::Unsubscribe),
            3 => Some(Self::Disconnect),
            4 => Some(Self::SurveyRequest),
            5 => Some(Self::SurveyResponse),
            6 => Some(Self::Subscribe),
            7 => Some(Self::Notification),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Shutdown => "shutdown",
            Self::Unsubscribe => "unsubscribe",
            Self::Disconnect => "disconnect",
            Self::SurveyRequest => "survey_request",
            Self::SurveyResponse => "survey_response",
            Self::Subscribe => "subscribe",
            Self::Notification => "notification",
        }
    }
}

/// Periodic heartbeat describing a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub uid: String,
    pub name: String,
    pub version: String,
    pub num_clients: u32,
    pub num_users: u32,
    pub num_channels: u32,
    pub num_subs: u32,
    /// Seconds since the node started.
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,
    /// Application data attached by the node-info-send handler.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

/// Metrics snapshot attached to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Seconds between snapshots.
    pub interval: f64,
    pub items: BTreeMap<String, f64>,
}

/// A node is leaving the cluster gracefully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {}

/// Close the connections of a user on every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub user: String,
    /// When non-empty only these client IDs are closed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_ids: Vec<String>,
    pub code: u32,
    pub reason: String,
}

impl Disconnect {
    /// Whether a connection of `user` with `client_id` is targeted.
    pub fn matches(&self, user: &str, client_id: &str) -> bool {
        self.user == user
            && (self.client_ids.is_empty() || self.client_ids.iter().any(|c| c == client_id))
    }
}

/// A user joined a channel on the sending node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub user: String,
    pub channel: String,
}

/// A user left a channel on the sending node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub user: String,
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyRequest {
    /// Unique per origin node, strictly increasing.
    pub id: u64,
    pub op: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub id: u64,
    pub code: u32,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Fire-and-forget broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub op: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Any control message, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Node(NodeInfo),
    Shutdown(Shutdown),
    Unsubscribe(Unsubscribe),
    Disconnect(Disconnect),
    SurveyRequest(SurveyRequest),
    SurveyResponse(SurveyResponse),
    Subscribe(Subscribe),
    Notification(Notification),
}

impl ControlMessage {
    pub fn method(&self) -> ControlMethod {
        match self {
            Self::Node(_) => ControlMethod::Node,
            Self::Shutdown(_) => ControlMethod::Shutdown,
            Self::Unsubscribe(_) => ControlMethod::Unsubscribe,
            Self::Disconnect(_) => ControlMethod::Disconnect,
            Self::SurveyRequest(_) => ControlMethod::SurveyRequest,
            Self::SurveyResponse(_) => ControlMethod::SurveyResponse,
            Self::Subscribe(_) => ControlMethod::Subscribe,
            Self::Notification(_) => ControlMethod::Notification,
        }
    }
}

/// A payload type with a fixed method tag.
pub trait ControlPayload: Serialize + DeserializeOwned + Into<ControlMessage> {
    const METHOD: ControlMethod;
}

macro_rules! control_payload {
    ($($ty:ident),* $(,)?) => {
        $(
            impl ControlPayload for $ty {
                const METHOD: ControlMethod = ControlMethod::$ty;
            }

            impl From<$ty> for ControlMessage {
                fn from(msg: $ty) -> Self {
                    ControlMessage::$ty(msg)
                }
            }
        )*
    };
}

control_payload!(
    Shutdown,
    Unsubscribe,
    Disconnect,
    SurveyRequest,
    SurveyResponse,
    Subscribe,
    Notification,
);

impl ControlPayload for NodeInfo {
    const METHOD: ControlMethod = ControlMethod::Node;
}

impl From<NodeInfo> for ControlMessage {
    fn from(msg: NodeInfo) -> Self {
        ControlMessage::Node(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tags_are_stable() {
        for v in 0..8 {
            let method = ControlMethod::from_u32(v).unwrap();
            assert_eq!(method.as_u32(), v);
        }
        assert_eq!(ControlMethod::from_u32(8), None);
        assert_eq!(ControlMethod::Subscribe.as_u32(), 6);
    }

    #[test]
    fn disconnect_matches_user_and_allowlist() {
        let all = Disconnect {
            user: "alice".to_string(),
            code: 3000,
            ..Default::default()
        };
        assert!(all.matches("alice", "c-1"));
        assert!(!all.matches("bob", "c-1"));

        let some = Disconnect {
            client_ids: vec!["c-2".to_string()],
            ..all
        };
        assert!(!some.matches("alice", "c-1"));
        assert!(some.matches("alice", "c-2"));
    }

    #[test]
    fn message_reports_its_method() {
        let msg: ControlMessage = Subscribe {
            user: "u".to_string(),
            channel: "news".to_string(),
        }
        .into();
        assert_eq!(msg.method(), ControlMethod::Subscribe);
        assert_eq!(<NodeInfo as ControlPayload>::METHOD, ControlMethod::Node);
    }
}
