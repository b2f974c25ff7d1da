//! Node-wide connection registry and channel subscriber index.
//!
//! The hub knows every connected client on this node and, per channel,
//! which local clients and which remote users are subscribed. Local
//! membership changes are announced to peers; membership learned from
//! peers is applied without announcing anything.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pulse_core::{ClientId, Disconnect, NodeId, PulseConfig, ReplyError, Unsubscribe};
use pulsegrid_cluster::{Broker, BrokerError, BrokerHandler, ClusterResult, Coordinator, LocalNode};
use pulsegrid_control as control;
use pulsegrid_metrics::{NodeGauges, Observer};

use crate::client::Client;
use crate::command::Outbound;
use crate::handlers::Handlers;

/// Subscribers of one channel.
#[derive(Default)]
struct ChannelSubscribers {
    /// Local connections and the user each belongs to.
    local: HashMap<ClientId, String>,
    /// Users subscribed on other nodes. A set, so re-delivered control
    /// messages cannot double count.
    remote: HashSet<(NodeId, String)>,
}

impl ChannelSubscribers {
    fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    fn has_local_user(&self, user: &str) -> bool {
        self.local.values().any(|u| u == user)
    }
}

#[derive(Default)]
struct HubState {
    clients: HashMap<ClientId, Arc<Client>>,
    users: HashMap<String, HashSet<ClientId>>,
    channels: HashMap<String, ChannelSubscribers>,
}

const DEFAULT_PRESENCE_UPDATE_INTERVAL: Duration = Duration::from_secs(25);

pub struct Hub {
    coordinator: Arc<Coordinator>,
    broker: Arc<dyn Broker>,
    observer: Arc<dyn Observer>,
    handlers: RwLock<Arc<Handlers>>,
    channel_topic_prefix: String,
    channel_max_length: usize,
    presence_update_interval: Duration,
    next_client: AtomicU64,
    state: RwLock<HubState>,
    weak: Weak<Hub>,
}

impl Hub {
    pub fn new(
        coordinator: Arc<Coordinator>,
        broker: Arc<dyn Broker>,
        observer: Arc<dyn Observer>,
        config: &PulseConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            coordinator,
            broker,
            observer,
            handlers: RwLock::new(Arc::new(Handlers::default())),
            channel_topic_prefix: config.cluster.channel_topic_prefix.clone(),
            channel_max_length: config.client.channel_max_length,
            presence_update_interval: config
                .presence_update_interval()
                .ok()
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_PRESENCE_UPDATE_INTERVAL),
            next_client: AtomicU64::new(1),
            state: RwLock::new(HubState::default()),
            weak: weak.clone(),
        })
    }

    pub fn set_handlers(&self, handlers: Handlers) {
        *self.handlers.write().expect("handlers lock") = Arc::new(handlers);
    }

    pub(crate) fn handlers(&self) -> Arc<Handlers> {
        self.handlers.read().expect("handlers lock").clone()
    }

    pub(crate) fn presence_update_interval(&self) -> Duration {
        self.presence_update_interval
    }

    pub(crate) fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    pub fn node_id(&self) -> &str {
        self.coordinator.node_id()
    }

    pub(crate) fn version(&self) -> &str {
        &self.coordinator.identity().version
    }

    /// Accept a new transport connection. Frames for the client are sent
    /// on `tx`; the client starts in the connecting state.
    pub fn connect(self: &Arc<Self>, tx: mpsc::UnboundedSender<Outbound>) -> Arc<Client> {
        let n = self.next_client.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("{}-{n}", self.node_id());
        debug!(%client_id, "connection accepted");
        Client::new(client_id, Arc::clone(self), tx)
    }

    // ── Clients ────────────────────────────────────────────────────

    pub(crate) fn add_client(&self, client: &Arc<Client>, user: &str) {
        let mut state = self.state.write().expect("hub state lock");
        state
            .users
            .entry(user.to_string())
            .or_default()
            .insert(client.id().to_string());
        state.clients.insert(client.id().to_string(), Arc::clone(client));
    }

    pub(crate) fn remove_client(&self, client_id: &str, user: &str) {
        let mut state = self.state.write().expect("hub state lock");
        state.clients.remove(client_id);
        if let Some(ids) = state.users.get_mut(user) {
            ids.remove(client_id);
            if ids.is_empty() {
                state.users.remove(user);
            }
        }
    }

    pub fn client(&self, client_id: &str) -> Option<Arc<Client>> {
        let state = self.state.read().expect("hub state lock");
        state.clients.get(client_id).cloned()
    }

    pub fn num_clients(&self) -> usize {
        self.state.read().expect("hub state lock").clients.len()
    }

    pub fn num_users(&self) -> usize {
        self.state.read().expect("hub state lock").users.len()
    }

    fn user_clients(&self, user: &str) -> Vec<Arc<Client>> {
        let state = self.state.read().expect("hub state lock");
        state
            .users
            .get(user)
            .map(|ids| ids.iter().filter_map(|id| state.clients.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Close this node's connections of `user` and ask every other node to
    /// do the same. An empty `client_ids` targets all of the user's
    /// connections.
    pub fn disconnect_user(
        &self,
        user: &str,
        client_ids: &[ClientId],
        disconnect: &Disconnect,
    ) -> ClusterResult<usize> {
        let message = control::Disconnect {
            user: user.to_string(),
            client_ids: client_ids.to_vec(),
            code: disconnect.code,
            reason: disconnect.reason.clone(),
        };
        let closed = self.apply_disconnect(&message);
        self.coordinator.broadcast(message)?;
        Ok(closed)
    }

    /// End `user`'s subscriptions to `channel` on this node.
    pub fn unsubscribe_user(&self, user: &str, channel: &str) -> usize {
        self.user_clients(user)
            .into_iter()
            .filter(|c| c.unsubscribe(channel, Unsubscribe::server()))
            .count()
    }

    /// Close every connection on this node.
    pub fn close_all(&self, disconnect: Disconnect) -> usize {
        let clients: Vec<Arc<Client>> = {
            let state = self.state.read().expect("hub state lock");
            state.clients.values().cloned().collect()
        };
        let closed = clients
            .into_iter()
            .filter(|c| c.close(disconnect.clone()))
            .count();
        if closed > 0 {
            info!(closed, code = disconnect.code, "closed all clients");
        }
        closed
    }

    // ── Channels ───────────────────────────────────────────────────

    pub(crate) fn validate_channel(&self, channel: &str) -> Result<(), ReplyError> {
        if channel.is_empty() {
            return Err(ReplyError::bad_request());
        }
        if channel.len() > self.channel_max_length {
            return Err(ReplyError::limit_exceeded());
        }
        Ok(())
    }

    fn channel_topic(&self, channel: &str) -> String {
        format!("{}{channel}", self.channel_topic_prefix)
    }

    /// Record a local subscription. Peers hear about it when it is the
    /// user's first subscription to the channel on this node.
    pub(crate) fn subscribe_local(&self, channel: &str, client_id: &str, user: &str) {
        let first_for_user = {
            let mut state = self.state.write().expect("hub state lock");
            let subs = state.channels.entry(channel.to_string()).or_default();
            let first_local = subs.local.is_empty();
            let first_for_user = !subs.has_local_user(user);
            subs.local.insert(client_id.to_string(), user.to_string());
            if first_local {
                self.attach_channel(channel);
            }
            first_for_user
        };

        if first_for_user {
            let message = control::Subscribe {
                user: user.to_string(),
                channel: channel.to_string(),
            };
            if let Err(e) = self.coordinator.broadcast(message) {
                warn!(%channel, %user, error = %e, "failed to announce subscription");
            }
        }
        debug!(%channel, %client_id, "client subscribed");
    }

    /// Drop a local subscription. Peers hear about it when it was the
    /// user's last subscription to the channel on this node.
    pub(crate) fn unsubscribe_local(&self, channel: &str, client_id: &str, user: &str) {
        let last_for_user = {
            let mut state = self.state.write().expect("hub state lock");
            let Some(subs) = state.channels.get_mut(channel) else {
                return;
            };
            if subs.local.remove(client_id).is_none() {
                return;
            }
            let last_for_user = !subs.has_local_user(user);
            let no_local = subs.local.is_empty();
            if subs.is_empty() {
                state.channels.remove(channel);
            }
            if no_local {
                self.detach_channel(channel);
            }
            last_for_user
        };

        if last_for_user {
            let message = control::Unsubscribe {
                user: user.to_string(),
                channel: channel.to_string(),
            };
            if let Err(e) = self.coordinator.broadcast(message) {
                warn!(%channel, %user, error = %e, "failed to announce unsubscription");
            }
        }
        debug!(%channel, %client_id, "client unsubscribed");
    }

    fn attach_channel(&self, channel: &str) {
        let weak = self.weak.clone();
        let name = channel.to_string();
        let handler: BrokerHandler = Arc::new(move |payload: Bytes| {
            let weak = weak.clone();
            let name = name.clone();
            Box::pin(async move {
                if let Some(hub) = weak.upgrade() {
                    hub.deliver_publication(&name, payload);
                }
            })
        });
        if let Err(e) = self.broker.subscribe(&self.channel_topic(channel), handler) {
            warn!(%channel, error = %e, "failed to subscribe channel topic");
        }
    }

    fn detach_channel(&self, channel: &str) {
        if let Err(e) = self.broker.unsubscribe(&self.channel_topic(channel)) {
            warn!(%channel, error = %e, "failed to unsubscribe channel topic");
        }
    }

    /// Hand a publication to the broker for fan-out to every node.
    pub fn publish(&self, channel: &str, data: Vec<u8>) -> Result<(), BrokerError> {
        self.broker.publish(&self.channel_topic(channel), Bytes::from(data))?;
        self.observer.inc_messages_sent("publication");
        Ok(())
    }

    fn deliver_publication(&self, channel: &str, payload: Bytes) {
        self.observer.inc_messages_received("publication");
        let clients: Vec<Arc<Client>> = {
            let state = self.state.read().expect("hub state lock");
            let Some(subs) = state.channels.get(channel) else {
                return;
            };
            subs.local
                .keys()
                .filter_map(|id| state.clients.get(id).cloned())
                .collect()
        };
        for client in clients {
            client.push_publication(channel, payload.clone());
        }
    }

    /// Local connections plus remote users subscribed to `channel`.
    pub fn num_subscribers(&self, channel: &str) -> usize {
        let state = self.state.read().expect("hub state lock");
        state
            .channels
            .get(channel)
            .map(|s| s.local.len() + s.remote.len())
            .unwrap_or(0)
    }

    /// Channels with at least one subscriber anywhere, sorted.
    pub fn channels(&self) -> Vec<String> {
        let state = self.state.read().expect("hub state lock");
        let mut channels: Vec<String> = state.channels.keys().cloned().collect();
        channels.sort();
        channels
    }
}

impl LocalNode for Hub {
    fn apply_disconnect(&self, disconnect: &control::Disconnect) -> usize {
        let reason = Disconnect::new(disconnect.code, &disconnect.reason);
        self.user_clients(&disconnect.user)
            .into_iter()
            .filter(|c| disconnect.matches(&disconnect.user, c.id()))
            .filter(|c| c.close(reason.clone()))
            .count()
    }

    fn apply_subscribe(&self, from_node: &str, subscribe: &control::Subscribe) {
        let mut state = self.state.write().expect("hub state lock");
        let inserted = state
            .channels
            .entry(subscribe.channel.clone())
            .or_default()
            .remote
            .insert((from_node.to_string(), subscribe.user.clone()));
        if inserted {
            debug!(channel = %subscribe.channel, %from_node, user = %subscribe.user, "remote subscription added");
        }
    }

    fn apply_unsubscribe(&self, from_node: &str, unsubscribe: &control::Unsubscribe) {
        let mut state = self.state.write().expect("hub state lock");
        let Some(subs) = state.channels.get_mut(&unsubscribe.channel) else {
            return;
        };
        subs.remote
            .remove(&(from_node.to_string(), unsubscribe.user.clone()));
        if subs.is_empty() {
            state.channels.remove(&unsubscribe.channel);
        }
    }

    fn forget_node(&self, node_id: &str) {
        let mut state = self.state.write().expect("hub state lock");
        for subs in state.channels.values_mut() {
            subs.remote.retain(|(node, _)| node != node_id);
        }
        state.channels.retain(|_, subs| !subs.is_empty());
        debug!(%node_id, "forgot remote subscriptions");
    }

    fn gauges(&self) -> NodeGauges {
        let state = self.state.read().expect("hub state lock");
        let mut channels = 0;
        let mut subscriptions = 0;
        for subs in state.channels.values() {
            if !subs.local.is_empty() {
                channels += 1;
                subscriptions += subs.local.len();
            }
        }
        NodeGauges {
            clients: state.clients.len(),
            users: state.users.len(),
            channels,
            subscriptions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestNode;

    fn remote_sub(channel: &str, user: &str) -> control::Subscribe {
        control::Subscribe {
            user: user.into(),
            channel: channel.into(),
        }
    }

    fn remote_unsub(channel: &str, user: &str) -> control::Unsubscribe {
        control::Unsubscribe {
            user: user.into(),
            channel: channel.into(),
        }
    }

    #[tokio::test]
    async fn duplicate_remote_subscribe_counts_once() {
        let node = TestNode::new("node-a", Handlers::new());
        node.hub.apply_subscribe("node-b", &remote_sub("news", "u1"));
        node.hub.apply_subscribe("node-b", &remote_sub("news", "u1"));
        assert_eq!(node.hub.num_subscribers("news"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_twice_equals_once() {
        let node = TestNode::new("node-a", Handlers::new());
        node.hub.apply_subscribe("node-b", &remote_sub("news", "u1"));
        node.hub.apply_subscribe("node-c", &remote_sub("news", "u2"));

        node.hub.apply_unsubscribe("node-b", &remote_unsub("news", "u1"));
        assert_eq!(node.hub.num_subscribers("news"), 1);
        node.hub.apply_unsubscribe("node-b", &remote_unsub("news", "u1"));
        assert_eq!(node.hub.num_subscribers("news"), 1);
    }

    #[tokio::test]
    async fn forget_node_drops_its_memberships() {
        let node = TestNode::new("node-a", Handlers::new());
        node.hub.apply_subscribe("node-b", &remote_sub("news", "u1"));
        node.hub.apply_subscribe("node-b", &remote_sub("sport", "u1"));
        node.hub.apply_subscribe("node-c", &remote_sub("news", "u2"));

        node.hub.forget_node("node-b");

        assert_eq!(node.hub.num_subscribers("news"), 1);
        assert_eq!(node.hub.num_subscribers("sport"), 0);
        assert_eq!(node.hub.channels(), vec!["news".to_string()]);
    }

    #[tokio::test]
    async fn remote_memberships_do_not_count_as_local_gauges() {
        let node = TestNode::new("node-a", Handlers::new());
        node.hub.apply_subscribe("node-b", &remote_sub("news", "u1"));
        assert_eq!(node.hub.gauges(), NodeGauges::default());
    }

    #[tokio::test]
    async fn channel_validation() {
        let node = TestNode::new("node-a", Handlers::new());
        assert!(node.hub.validate_channel("news").is_ok());
        assert_eq!(node.hub.validate_channel(""), Err(ReplyError::bad_request()));
        let long = "x".repeat(256);
        assert_eq!(node.hub.validate_channel(&long), Err(ReplyError::limit_exceeded()));
    }
}
