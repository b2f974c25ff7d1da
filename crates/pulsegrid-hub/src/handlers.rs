//! Application handler surface.
//!
//! Every handler receives an event describing the command and completes
//! asynchronously. Completion may happen on any task at any later time;
//! the connection takes care of ordering the resulting replies.

use std::collections::BTreeMap;
use std::sync::Arc;

use pulse_core::{ClientId, Disconnect, Unsubscribe};
use pulsegrid_cluster::BoxFuture;

use crate::command::{Command, Outbound};
use crate::error::HandlerError;

/// Asynchronous handler taking an event and producing a reply.
pub type Handler<E, R> = Arc<dyn Fn(E) -> BoxFuture<Result<R, HandlerError>> + Send + Sync>;

/// Synchronous observer of an event; nothing is sent back to the client.
pub type Listener<E> = Arc<dyn Fn(E) + Send + Sync>;

// ── Shared payloads ────────────────────────────────────────────────

/// Who a connection belongs to. Returned by the connecting handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    /// Unix seconds when the connection expires; zero means never.
    pub expire_at: u64,
    pub info: Vec<u8>,
}

/// Per-subscription settings chosen by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Unix seconds when the subscription expires; zero means never.
    pub expire_at: u64,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub client: ClientId,
    pub user: String,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publication {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Stream position reported by the application after publishing itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishResult {
    pub offset: u64,
    pub epoch: String,
}

// ── Connect ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectEvent {
    pub client_id: ClientId,
    pub token: String,
    pub data: Vec<u8>,
    pub name: String,
    pub version: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReply {
    /// `None` accepts the connection anonymously.
    pub credentials: Option<Credentials>,
    pub data: Vec<u8>,
    /// Channels to subscribe the connection to right after connect.
    pub subscriptions: BTreeMap<String, SubscribeOptions>,
    /// Expect the client to send refresh commands instead of the server
    /// calling the refresh handler on a timer.
    pub client_side_refresh: bool,
}

/// Called once a connection moved to connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedEvent {
    pub client_id: ClientId,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub client_id: ClientId,
    pub user: String,
    pub disconnect: Disconnect,
}

// ── Refresh ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshEvent {
    pub client_id: ClientId,
    pub user: String,
    pub client_side_refresh: bool,
    /// Only set for client-side refresh.
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReply {
    pub expired: bool,
    /// New expiration in unix seconds; zero means never.
    pub expire_at: u64,
    /// Replacement connection info; `None` keeps the current one.
    pub info: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRefreshEvent {
    pub client_id: ClientId,
    pub user: String,
    pub client_side_refresh: bool,
    pub channel: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubRefreshReply {
    pub expired: bool,
    pub expire_at: u64,
    pub info: Option<Vec<u8>>,
}

// ── Subscriptions ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeEvent {
    pub client_id: ClientId,
    pub user: String,
    pub channel: String,
    pub token: String,
    pub data: Vec<u8>,
    pub recover: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeReply {
    pub options: SubscribeOptions,
    pub client_side_refresh: bool,
    /// Whether missed publications were recovered, when asked to.
    pub recovered: bool,
    /// Publications replayed to the client on recovery.
    pub publications: Vec<Publication>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeEvent {
    pub client_id: ClientId,
    pub user: String,
    pub channel: String,
    /// The subscription came from the connect reply.
    pub server_side: bool,
    pub unsubscribe: Unsubscribe,
}

// ── Channel operations ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEvent {
    pub client_id: ClientId,
    pub user: String,
    pub channel: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReply {
    /// Set when the handler already published; the hub then skips its own
    /// broker publish.
    pub result: Option<PublishResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub client_id: ClientId,
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceReply {
    pub clients: BTreeMap<String, ClientInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceStatsReply {
    pub num_clients: u32,
    pub num_users: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEvent {
    pub client_id: ClientId,
    pub channel: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryReply {
    pub publications: Vec<Publication>,
    pub offset: u64,
    pub epoch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEvent {
    pub client_id: ClientId,
    pub user: String,
    pub method: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcReply {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub client_id: ClientId,
    pub user: String,
    pub data: Vec<u8>,
}

// ── Connection lifecycle ───────────────────────────────────────────

/// A command after the connection processed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReadEvent {
    pub client_id: ClientId,
    pub command: Command,
}

/// A frame about to be written to the connection's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportWriteEvent {
    pub client_id: ClientId,
    pub frame: Outbound,
}

/// Periodic signal that a connection is still alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveEvent {
    pub client_id: ClientId,
    pub user: String,
}

// ── Registration ───────────────────────────────────────────────────

pub type ConnectingHandler = Handler<ConnectEvent, ConnectReply>;
pub type RefreshHandler = Handler<RefreshEvent, RefreshReply>;
pub type SubRefreshHandler = Handler<SubRefreshEvent, SubRefreshReply>;
pub type SubscribeHandler = Handler<SubscribeEvent, SubscribeReply>;
pub type PublishHandler = Handler<PublishEvent, PublishReply>;
pub type PresenceHandler = Handler<PresenceEvent, PresenceReply>;
pub type PresenceStatsHandler = Handler<PresenceEvent, PresenceStatsReply>;
pub type HistoryHandler = Handler<HistoryEvent, HistoryReply>;
pub type RpcHandler = Handler<RpcEvent, RpcReply>;
pub type MessageHandler = Listener<MessageEvent>;
pub type UnsubscribeHandler = Listener<UnsubscribeEvent>;
pub type ConnectedHandler = Listener<ConnectedEvent>;
pub type DisconnectedHandler = Listener<DisconnectEvent>;
pub type CommandReadHandler = Listener<CommandReadEvent>;
pub type AliveHandler = Listener<AliveEvent>;

/// Decides whether a frame is written. Returning `false` drops it.
pub type TransportWriteHandler = Arc<dyn Fn(&TransportWriteEvent) -> bool + Send + Sync>;

/// The set of handlers a hub dispatches to.
///
/// Every handler is optional. A command whose handler is missing gets a
/// `not available` reply, except connect which is accepted anonymously.
#[derive(Clone, Default)]
pub struct Handlers {
    pub(crate) connecting: Option<ConnectingHandler>,
    pub(crate) connected: Option<ConnectedHandler>,
    pub(crate) disconnected: Option<DisconnectedHandler>,
    pub(crate) refresh: Option<RefreshHandler>,
    pub(crate) sub_refresh: Option<SubRefreshHandler>,
    pub(crate) subscribe: Option<SubscribeHandler>,
    pub(crate) unsubscribe: Option<UnsubscribeHandler>,
    pub(crate) publish: Option<PublishHandler>,
    pub(crate) presence: Option<PresenceHandler>,
    pub(crate) presence_stats: Option<PresenceStatsHandler>,
    pub(crate) history: Option<HistoryHandler>,
    pub(crate) rpc: Option<RpcHandler>,
    pub(crate) message: Option<MessageHandler>,
    pub(crate) command_read: Option<CommandReadHandler>,
    pub(crate) transport_write: Option<TransportWriteHandler>,
    pub(crate) alive: Option<AliveHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connecting(mut self, handler: ConnectingHandler) -> Self {
        self.connecting = Some(handler);
        self
    }

    pub fn on_connected(mut self, handler: ConnectedHandler) -> Self {
        self.connected = Some(handler);
        self
    }

    pub fn on_disconnected(mut self, handler: DisconnectedHandler) -> Self {
        self.disconnected = Some(handler);
        self
    }

    pub fn on_refresh(mut self, handler: RefreshHandler) -> Self {
        self.refresh = Some(handler);
        self
    }

    pub fn on_sub_refresh(mut self, handler: SubRefreshHandler) -> Self {
        self.sub_refresh = Some(handler);
        self
    }

    pub fn on_subscribe(mut self, handler: SubscribeHandler) -> Self {
        self.subscribe = Some(handler);
        self
    }

    pub fn on_unsubscribe(mut self, handler: UnsubscribeHandler) -> Self {
        self.unsubscribe = Some(handler);
        self
    }

    pub fn on_publish(mut self, handler: PublishHandler) -> Self {
        self.publish = Some(handler);
        self
    }

    pub fn on_presence(mut self, handler: PresenceHandler) -> Self {
        self.presence = Some(handler);
        self
    }

    pub fn on_presence_stats(mut self, handler: PresenceStatsHandler) -> Self {
        self.presence_stats = Some(handler);
        self
    }

    pub fn on_history(mut self, handler: HistoryHandler) -> Self {
        self.history = Some(handler);
        self
    }

    pub fn on_rpc(mut self, handler: RpcHandler) -> Self {
        self.rpc = Some(handler);
        self
    }

    pub fn on_message(mut self, handler: MessageHandler) -> Self {
        self.message = Some(handler);
        self
    }

    pub fn on_command_read(mut self, handler: CommandReadHandler) -> Self {
        self.command_read = Some(handler);
        self
    }

    /// The handler runs while the connection is locked and must not call
    /// back into the client.
    pub fn on_transport_write(mut self, handler: TransportWriteHandler) -> Self {
        self.transport_write = Some(handler);
        self
    }

    /// Called every `client.presence_update_interval` while connected.
    pub fn on_alive(mut self, handler: AliveHandler) -> Self {
        self.alive = Some(handler);
        self
    }
}
