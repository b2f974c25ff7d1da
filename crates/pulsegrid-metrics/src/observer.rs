//! Observability collaborator contract.

use std::collections::BTreeMap;
use std::time::Duration;

/// Point-in-time node counts reported as gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeGauges {
    pub clients: usize,
    pub users: usize,
    pub channels: usize,
    pub subscriptions: usize,
}

/// Receives observations from the core.
///
/// Implementations must return quickly and never fail: the calling code
/// does not wait for or check the outcome of any of these methods.
pub trait Observer: Send + Sync {
    fn observe_command_duration(&self, _method: &str, _duration: Duration) {}

    fn inc_reply_error(&self, _method: &str, _code: u32) {}

    fn inc_recover(&self, _recovered: bool) {}

    fn observe_survey_duration(&self, _op: &str, _duration: Duration) {}

    fn inc_server_disconnect(&self, _code: u32) {}

    fn inc_messages_sent(&self, _kind: &str) {}

    fn inc_messages_received(&self, _kind: &str) {}

    fn set_node_gauges(&self, _gauges: NodeGauges) {}

    fn set_num_nodes(&self, _nodes: usize) {}

    /// Flat metric items attached to outgoing node heartbeats.
    fn export(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
