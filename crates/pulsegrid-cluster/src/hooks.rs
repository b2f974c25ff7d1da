//! Seams between the control plane and the rest of the node.
//!
//! The coordinator applies inbound control messages through [`LocalNode`]
//! (implemented by the connection hub) and answers cluster-wide requests
//! through application handlers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use pulse_core::NodeId;
use pulsegrid_control::{Disconnect, Subscribe, Unsubscribe};
use pulsegrid_metrics::NodeGauges;

use crate::survey::SurveyReply;

/// Boxed future returned by asynchronous handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A survey request as seen by the answering node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurveyEvent {
    pub op: String,
    pub data: Vec<u8>,
}

/// Produces this node's answer to a survey.
pub type SurveyHandler = Arc<dyn Fn(SurveyEvent) -> BoxFuture<SurveyReply> + Send + Sync>;

/// A notification broadcast by some node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub from_node_id: NodeId,
    pub op: String,
    pub data: Vec<u8>,
}

/// Observes notifications. The return value is not awaited or checked.
pub type NotificationHandler = Arc<dyn Fn(NotificationEvent) + Send + Sync>;

/// Returns application data to attach to each outgoing heartbeat.
pub type NodeInfoSendHandler = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Node-local state that inbound control messages act upon.
///
/// None of these methods may broadcast: they apply changes that some
/// other node already announced.
pub trait LocalNode: Send + Sync {
    /// Close local connections targeted by `disconnect`. Returns how many
    /// were closed; connections already closing are not counted.
    fn apply_disconnect(&self, disconnect: &Disconnect) -> usize;

    /// Record that `subscribe.user` joined a channel on `from_node`.
    fn apply_subscribe(&self, from_node: &str, subscribe: &Subscribe);

    /// Record that `unsubscribe.user` left a channel on `from_node`.
    fn apply_unsubscribe(&self, from_node: &str, unsubscribe: &Unsubscribe);

    /// Drop everything learned from `node_id`; it left or went silent.
    fn forget_node(&self, node_id: &str);

    /// Current local counts for heartbeats.
    fn gauges(&self) -> NodeGauges;
}
