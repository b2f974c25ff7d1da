//! Per-connection command dispatch.
//!
//! A [`Client`] moves through `Connecting → Connected → Closing → Closed`.
//! Every command except fire-and-forget messages reserves a reply slot, runs
//! its handler on its own task and releases the reply through the
//! connection's [`ReplyBuffer`], so replies leave in dispatch order no
//! matter when handlers finish.
//!
//! Closing stops refresh timers and rejects new commands. Handlers already
//! running are left alone: their side effects still happen, only their
//! replies are dropped.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use pulse_core::{ClientId, Disconnect, ReplyError, Unsubscribe, disconnect_code, epoch_secs};

use crate::command::{Command, Method, Outbound, Reply, ReplyResult, Request};
use crate::error::{DispatchError, HandlerError};
use crate::handlers::{
    AliveEvent, CommandReadEvent, ConnectEvent, ConnectReply, ConnectedEvent, DisconnectEvent,
    HistoryEvent, MessageEvent, PresenceEvent, PublishEvent, RefreshEvent, RefreshReply, RpcEvent,
    SubRefreshEvent, SubRefreshReply, SubscribeEvent, SubscribeOptions, TransportWriteEvent,
    UnsubscribeEvent,
};
use crate::hub::Hub;
use crate::ordering::ReplyBuffer;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

struct Subscription {
    server_side: bool,
    client_side_refresh: bool,
    expire_at: u64,
    info: Vec<u8>,
    timer: Option<JoinHandle<()>>,
}

struct ClientState {
    status: ConnectionState,
    connect_pending: bool,
    user: String,
    info: Vec<u8>,
    expire_at: u64,
    client_side_refresh: bool,
    refresh_timer: Option<JoinHandle<()>>,
    subscriptions: HashMap<String, Subscription>,
    /// Channels with a subscribe handler in flight.
    subscribing: HashSet<String>,
    /// In-flight subscribes the client unsubscribed from before they
    /// completed.
    cancelled: HashSet<String>,
    alive_timer: Option<JoinHandle<()>>,
    replies: ReplyBuffer,
    disconnect: Option<Disconnect>,
}

impl ClientState {
    fn closed_reason(&self) -> Disconnect {
        self.disconnect.clone().unwrap_or_else(Disconnect::connection_closed)
    }
}

/// One client connection on this node.
pub struct Client {
    id: ClientId,
    hub: Arc<Hub>,
    tx: mpsc::UnboundedSender<Outbound>,
    state: Mutex<ClientState>,
    weak: Weak<Client>,
}

impl Client {
    pub(crate) fn new(id: ClientId, hub: Arc<Hub>, tx: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            hub,
            tx,
            state: Mutex::new(ClientState {
                status: ConnectionState::Connecting,
                connect_pending: false,
                user: String::new(),
                info: Vec::new(),
                expire_at: 0,
                client_side_refresh: false,
                refresh_timer: None,
                subscriptions: HashMap::new(),
                subscribing: HashSet::new(),
                cancelled: HashSet::new(),
                alive_timer: None,
                replies: ReplyBuffer::new(),
                disconnect: None,
            }),
            weak: weak.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> String {
        self.state.lock().expect("client state lock").user.clone()
    }

    pub fn info(&self) -> Vec<u8> {
        self.state.lock().expect("client state lock").info.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().expect("client state lock").status
    }

    /// Channels the connection is subscribed to, sorted.
    pub fn channels(&self) -> Vec<String> {
        let state = self.state.lock().expect("client state lock");
        let mut channels: Vec<String> = state.subscriptions.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        let state = self.state.lock().expect("client state lock");
        state.subscriptions.contains_key(channel)
    }

    /// Unix seconds when the connection expires; zero means never.
    pub fn expire_at(&self) -> u64 {
        self.state.lock().expect("client state lock").expire_at
    }

    /// Current settings of one subscription.
    pub fn subscription(&self, channel: &str) -> Option<SubscribeOptions> {
        let state = self.state.lock().expect("client state lock");
        state.subscriptions.get(channel).map(|sub| SubscribeOptions {
            expire_at: sub.expire_at,
            info: sub.info.clone(),
        })
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Accept one decoded command.
    ///
    /// Returns as soon as the command was scheduled; the reply arrives on
    /// the outbound channel later. Must be called from within a tokio
    /// runtime.
    pub fn dispatch(self: &Arc<Self>, command: Command) -> Result<(), DispatchError> {
        let read = self
            .hub
            .handlers()
            .command_read
            .clone()
            .map(|handler| (handler, command.clone()));
        self.schedule(command)?;
        if let Some((handler, command)) = read {
            handler(CommandReadEvent {
                client_id: self.id.clone(),
                command,
            });
        }
        Ok(())
    }

    fn schedule(self: &Arc<Self>, command: Command) -> Result<(), DispatchError> {
        let method = command.method();
        let reserved = {
            let mut state = self.state.lock().expect("client state lock");
            let status = state.status;
            match status {
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(DispatchError::closed(state.closed_reason()));
                }
                ConnectionState::Connecting if method != Method::Connect || state.connect_pending => {
                    drop(state);
                    return Err(self.violation(method, "command before connect"));
                }
                ConnectionState::Connected if method == Method::Connect => {
                    drop(state);
                    return Err(self.violation(method, "already connected"));
                }
                _ => {}
            }
            if method == Method::Connect {
                state.connect_pending = true;
            }
            (method != Method::Message).then(|| state.replies.reserve())
        };

        let Some(seq) = reserved else {
            if let Request::Message { data } = command.request {
                self.on_message(data);
            }
            return Ok(());
        };

        let id = command.id;
        let this = Arc::clone(self);
        match command.request {
            Request::Ping => self.finish(seq, id, method, Instant::now(), Ok(ReplyResult::Ping)),
            Request::Connect {
                token,
                data,
                name,
                version,
                channels,
            } => {
                let event = ConnectEvent {
                    client_id: self.id.clone(),
                    token,
                    data,
                    name,
                    version,
                    channels,
                };
                self.spawn_command(seq, id, method, this.connect(event));
            }
            Request::Refresh { token } => self.spawn_command(seq, id, method, this.refresh(token)),
            Request::Subscribe {
                channel,
                token,
                data,
                recover,
            } => self.spawn_command(seq, id, method, this.subscribe(channel, token, data, recover)),
            Request::Unsubscribe { channel } => {
                self.spawn_command(seq, id, method, this.client_unsubscribe(channel))
            }
            Request::Publish { channel, data } => {
                self.spawn_command(seq, id, method, this.publish(channel, data))
            }
            Request::Presence { channel } => self.spawn_command(seq, id, method, this.presence(channel)),
            Request::PresenceStats { channel } => {
                self.spawn_command(seq, id, method, this.presence_stats(channel))
            }
            Request::History { channel, limit } => {
                self.spawn_command(seq, id, method, this.history(channel, limit))
            }
            Request::Rpc { method: rpc, data } => self.spawn_command(seq, id, method, this.rpc(rpc, data)),
            Request::SubRefresh { channel, token } => {
                self.spawn_command(seq, id, method, this.sub_refresh(channel, token))
            }
            // Handled above without a slot.
            Request::Message { .. } => {}
        }
        Ok(())
    }

    fn violation(&self, method: Method, reason: &str) -> DispatchError {
        warn!(client_id = %self.id, %method, reason, "protocol violation");
        self.close(Disconnect::bad_request());
        DispatchError::ProtocolViolation(format!("{method}: {reason}"))
    }

    fn spawn_command<F>(&self, seq: u64, id: u32, method: Method, work: F)
    where
        F: Future<Output = Result<ReplyResult, HandlerError>> + Send + 'static,
    {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let started = Instant::now();
        tokio::spawn(async move {
            // A panicking handler must still release its slot.
            let outcome = match tokio::spawn(work).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(client_id = %this.id, %method, error = %e, "command task failed");
                    Err(ReplyError::internal().into())
                }
            };
            this.finish(seq, id, method, started, outcome);
        });
    }

    fn finish(
        &self,
        seq: u64,
        id: u32,
        method: Method,
        started: Instant,
        outcome: Result<ReplyResult, HandlerError>,
    ) {
        let observer = self.hub.observer();
        observer.observe_command_duration(method.as_str(), started.elapsed());

        let mut close_with = None;
        let result = match outcome {
            Ok(result) => Ok(result),
            Err(HandlerError::Reply(e)) => {
                observer.inc_reply_error(method.as_str(), e.code);
                if method == Method::Connect {
                    close_with = Some(Disconnect::bad_request());
                }
                Err(e)
            }
            Err(HandlerError::Disconnect(d)) => {
                // Close first so the reply is never written.
                self.close(d);
                Err(ReplyError::internal())
            }
        };

        self.release(seq, Reply { id, result });
        if let Some(d) = close_with {
            self.close(d);
        }
    }

    fn release(&self, seq: u64, reply: Reply) {
        let mut state = self.state.lock().expect("client state lock");
        let ready = state.replies.complete(seq, reply);
        if !matches!(state.status, ConnectionState::Connecting | ConnectionState::Connected) {
            return;
        }
        for reply in ready {
            self.write(Outbound::Reply(reply));
        }
    }

    /// Hand one frame to the transport unless the write handler vetoes it.
    /// The handler runs under the connection lock and must not call back
    /// into the client.
    fn write(&self, frame: Outbound) {
        let Some(handler) = self.hub.handlers().transport_write.clone() else {
            let _ = self.tx.send(frame);
            return;
        };
        let event = TransportWriteEvent {
            client_id: self.id.clone(),
            frame,
        };
        if handler(&event) {
            let _ = self.tx.send(event.frame);
        } else {
            trace!(client_id = %self.id, "frame skipped by transport write handler");
        }
    }

    fn on_message(&self, data: Vec<u8>) {
        let Some(handler) = self.hub.handlers().message.clone() else {
            debug!(client_id = %self.id, "no message handler, dropping message");
            return;
        };
        handler(MessageEvent {
            client_id: self.id.clone(),
            user: self.user(),
            data,
        });
    }

    // ── Connect and refresh ────────────────────────────────────────

    async fn connect(self: Arc<Self>, event: ConnectEvent) -> Result<ReplyResult, HandlerError> {
        let handlers = self.hub.handlers();
        let reply = match &handlers.connecting {
            Some(handler) => handler(event).await?,
            None => ConnectReply::default(),
        };
        let credentials = reply.credentials.unwrap_or_default();
        let now = epoch_secs();
        if credentials.expire_at > 0 && credentials.expire_at <= now {
            return Err(ReplyError::expired().into());
        }

        {
            let mut state = self.state.lock().expect("client state lock");
            if state.status != ConnectionState::Connecting {
                return Err(state.closed_reason().into());
            }
            state.status = ConnectionState::Connected;
            state.user = credentials.user.clone();
            state.info = credentials.info;
            state.expire_at = credentials.expire_at;
            state.client_side_refresh = reply.client_side_refresh;
            if credentials.expire_at > 0 {
                let delay = Duration::from_secs(credentials.expire_at - now);
                state.refresh_timer = Some(self.arm_refresh(delay));
            }
            if handlers.alive.is_some() {
                state.alive_timer = Some(self.arm_alive(self.hub.presence_update_interval()));
            }
            self.hub.add_client(&self, &credentials.user);
        }

        let mut subs = Vec::new();
        for (channel, options) in reply.subscriptions {
            if self.hub.validate_channel(&channel).is_err() {
                warn!(client_id = %self.id, %channel, "skipping invalid server-side channel");
                continue;
            }
            if self.add_subscription(&channel, options, true, false) {
                subs.push(channel);
            }
        }

        if let Some(handler) = &handlers.connected {
            handler(ConnectedEvent {
                client_id: self.id.clone(),
                user: credentials.user.clone(),
            });
        }
        info!(client_id = %self.id, user = %credentials.user, subs = subs.len(), "client connected");

        Ok(ReplyResult::Connect {
            client: self.id.clone(),
            version: self.hub.version().to_string(),
            data: reply.data,
            subs,
            expires: credentials.expire_at > 0,
            ttl: credentials.expire_at.saturating_sub(now),
        })
    }

    async fn refresh(self: Arc<Self>, token: String) -> Result<ReplyResult, HandlerError> {
        let (user, client_side) = {
            let state = self.state.lock().expect("client state lock");
            (state.user.clone(), state.client_side_refresh)
        };
        if !client_side {
            return Err(ReplyError::not_available().into());
        }
        let Some(handler) = self.hub.handlers().refresh.clone() else {
            return Err(ReplyError::not_available().into());
        };
        let reply = handler(RefreshEvent {
            client_id: self.id.clone(),
            user,
            client_side_refresh: true,
            token,
        })
        .await?;
        self.apply_refresh(reply)
    }

    fn apply_refresh(&self, reply: RefreshReply) -> Result<ReplyResult, HandlerError> {
        let now = epoch_secs();
        if reply.expired || (reply.expire_at > 0 && reply.expire_at <= now) {
            return Err(Disconnect::expired().into());
        }

        let mut state = self.state.lock().expect("client state lock");
        if state.status != ConnectionState::Connected {
            return Err(state.closed_reason().into());
        }
        if let Some(info) = reply.info {
            state.info = info;
        }
        state.expire_at = reply.expire_at;
        if let Some(timer) = state.refresh_timer.take() {
            timer.abort();
        }
        let ttl = reply.expire_at.saturating_sub(now);
        if reply.expire_at > 0 {
            state.refresh_timer = Some(self.arm_refresh(Duration::from_secs(ttl)));
        }
        Ok(ReplyResult::Refresh {
            expires: reply.expire_at > 0,
            ttl,
        })
    }

    fn arm_refresh(&self, delay: Duration) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(client) = weak.upgrade() {
                client.on_refresh_timer().await;
            }
        })
    }

    /// The connection reached its expiration time.
    ///
    /// In client-side mode the timer firing means the client never sent a
    /// refresh in time. In server-side mode the refresh handler decides.
    async fn on_refresh_timer(self: Arc<Self>) {
        let (user, client_side) = {
            let mut state = self.state.lock().expect("client state lock");
            if state.status != ConnectionState::Connected {
                return;
            }
            // This task; keep close() from aborting it.
            state.refresh_timer = None;
            (state.user.clone(), state.client_side_refresh)
        };

        let handler = self.hub.handlers().refresh.clone();
        let handler = match handler {
            Some(handler) if !client_side => handler,
            _ => {
                debug!(client_id = %self.id, "connection expired");
                self.close(Disconnect::expired());
                return;
            }
        };

        let outcome = handler(RefreshEvent {
            client_id: self.id.clone(),
            user,
            client_side_refresh: false,
            token: String::new(),
        })
        .await
        .and_then(|reply| self.apply_refresh(reply));

        match outcome {
            Ok(_) => {}
            Err(HandlerError::Disconnect(d)) => {
                self.close(d);
            }
            Err(HandlerError::Reply(e)) => {
                warn!(client_id = %self.id, error = %e, "refresh handler failed");
                self.close(Disconnect::server_error());
            }
        }
    }

    fn arm_alive(&self, period: Duration) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else {
                    return;
                };
                if client.state() != ConnectionState::Connected {
                    return;
                }
                let Some(handler) = client.hub.handlers().alive.clone() else {
                    return;
                };
                handler(AliveEvent {
                    client_id: client.id.clone(),
                    user: client.user(),
                });
            }
        })
    }

    // ── Subscriptions ──────────────────────────────────────────────

    async fn subscribe(
        self: Arc<Self>,
        channel: String,
        token: String,
        data: Vec<u8>,
        recover: bool,
    ) -> Result<ReplyResult, HandlerError> {
        self.hub.validate_channel(&channel)?;
        let user = {
            let mut state = self.state.lock().expect("client state lock");
            if state.subscriptions.contains_key(&channel) || !state.subscribing.insert(channel.clone()) {
                return Err(ReplyError::already_subscribed().into());
            }
            state.user.clone()
        };

        let outcome = match self.hub.handlers().subscribe.clone() {
            Some(handler) => {
                handler(SubscribeEvent {
                    client_id: self.id.clone(),
                    user,
                    channel: channel.clone(),
                    token,
                    data,
                    recover,
                })
                .await
            }
            None => Err(ReplyError::not_available().into()),
        };
        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                self.abandon_subscribe(&channel);
                return Err(e);
            }
        };

        let now = epoch_secs();
        let expire_at = reply.options.expire_at;
        if expire_at > 0 && expire_at <= now {
            self.abandon_subscribe(&channel);
            return Err(ReplyError::expired().into());
        }
        if recover {
            self.hub.observer().inc_recover(reply.recovered);
        }
        if !self.complete_subscribe(&channel, reply.options, reply.client_side_refresh) {
            debug!(client_id = %self.id, %channel, "subscribe completed after unsubscribe or close, not registered");
        }

        Ok(ReplyResult::Subscribe {
            expires: expire_at > 0,
            ttl: expire_at.saturating_sub(now),
            recoverable: recover,
            recovered: recover && reply.recovered,
            publications: reply.publications,
        })
    }

    /// Finish an in-flight subscribe. Registration is skipped when the
    /// client unsubscribed from the channel while the handler ran.
    fn complete_subscribe(&self, channel: &str, options: SubscribeOptions, client_side_refresh: bool) -> bool {
        let mut state = self.state.lock().expect("client state lock");
        state.subscribing.remove(channel);
        if state.cancelled.remove(channel) {
            return false;
        }
        self.insert_subscription(&mut state, channel, options, false, client_side_refresh)
    }

    fn abandon_subscribe(&self, channel: &str) {
        let mut state = self.state.lock().expect("client state lock");
        state.subscribing.remove(channel);
        state.cancelled.remove(channel);
    }

    fn add_subscription(
        &self,
        channel: &str,
        options: SubscribeOptions,
        server_side: bool,
        client_side_refresh: bool,
    ) -> bool {
        let mut state = self.state.lock().expect("client state lock");
        self.insert_subscription(&mut state, channel, options, server_side, client_side_refresh)
    }

    /// Register a subscription on a connected client. Returns `false` when
    /// the client is no longer connected or already subscribed.
    fn insert_subscription(
        &self,
        state: &mut ClientState,
        channel: &str,
        options: SubscribeOptions,
        server_side: bool,
        client_side_refresh: bool,
    ) -> bool {
        if state.status != ConnectionState::Connected || state.subscriptions.contains_key(channel) {
            return false;
        }
        let timer = (options.expire_at > 0).then(|| {
            let delay = Duration::from_secs(options.expire_at.saturating_sub(epoch_secs()));
            self.arm_sub_refresh(channel, delay)
        });
        state.subscriptions.insert(
            channel.to_string(),
            Subscription {
                server_side,
                client_side_refresh,
                expire_at: options.expire_at,
                info: options.info,
                timer,
            },
        );
        self.hub.subscribe_local(channel, &self.id, &state.user);
        true
    }

    /// Drop a subscription and tell the application. Returns `false` if
    /// there was nothing to drop.
    fn remove_subscription(&self, channel: &str, unsubscribe: Unsubscribe) -> bool {
        let (user, server_side) = {
            let mut state = self.state.lock().expect("client state lock");
            if state.status != ConnectionState::Connected {
                return false;
            }
            let Some(sub) = state.subscriptions.remove(channel) else {
                return false;
            };
            if let Some(timer) = sub.timer {
                timer.abort();
            }
            (state.user.clone(), sub.server_side)
        };

        self.hub.unsubscribe_local(channel, &self.id, &user);
        if let Some(handler) = &self.hub.handlers().unsubscribe {
            handler(UnsubscribeEvent {
                client_id: self.id.clone(),
                user,
                channel: channel.to_string(),
                server_side,
                unsubscribe,
            });
        }
        true
    }

    /// Server-initiated unsubscribe. The client is told with an
    /// unsubscribe push.
    pub fn unsubscribe(&self, channel: &str, unsubscribe: Unsubscribe) -> bool {
        if !self.remove_subscription(channel, unsubscribe.clone()) {
            return false;
        }
        self.write(Outbound::Unsubscribe {
            channel: channel.to_string(),
            unsubscribe,
        });
        true
    }

    async fn client_unsubscribe(self: Arc<Self>, channel: String) -> Result<ReplyResult, HandlerError> {
        self.hub.validate_channel(&channel)?;
        {
            let mut state = self.state.lock().expect("client state lock");
            if state.subscribing.contains(&channel) {
                state.cancelled.insert(channel.clone());
            }
        }
        self.remove_subscription(&channel, Unsubscribe::client());
        Ok(ReplyResult::Unsubscribe)
    }

    async fn sub_refresh(self: Arc<Self>, channel: String, token: String) -> Result<ReplyResult, HandlerError> {
        self.hub.validate_channel(&channel)?;
        let (user, client_side) = {
            let state = self.state.lock().expect("client state lock");
            let Some(sub) = state.subscriptions.get(&channel) else {
                return Err(ReplyError::permission_denied().into());
            };
            (state.user.clone(), sub.client_side_refresh)
        };
        if !client_side {
            return Err(ReplyError::not_available().into());
        }
        let Some(handler) = self.hub.handlers().sub_refresh.clone() else {
            return Err(ReplyError::not_available().into());
        };
        let reply = handler(SubRefreshEvent {
            client_id: self.id.clone(),
            user,
            client_side_refresh: true,
            channel: channel.clone(),
            token,
        })
        .await?;
        self.apply_sub_refresh(&channel, reply)
    }

    /// Apply a sub-refresh verdict. An expired subscription is ended with
    /// an expiration unsubscribe.
    fn apply_sub_refresh(&self, channel: &str, reply: SubRefreshReply) -> Result<ReplyResult, HandlerError> {
        let now = epoch_secs();
        if reply.expired || (reply.expire_at > 0 && reply.expire_at <= now) {
            self.unsubscribe(channel, Unsubscribe::expired());
            return Err(ReplyError::expired().into());
        }

        let mut state = self.state.lock().expect("client state lock");
        let Some(sub) = state.subscriptions.get_mut(channel) else {
            return Err(ReplyError::permission_denied().into());
        };
        if let Some(info) = reply.info {
            sub.info = info;
        }
        sub.expire_at = reply.expire_at;
        if let Some(timer) = sub.timer.take() {
            timer.abort();
        }
        let ttl = reply.expire_at.saturating_sub(now);
        if reply.expire_at > 0 {
            sub.timer = Some(self.arm_sub_refresh(channel, Duration::from_secs(ttl)));
        }
        Ok(ReplyResult::SubRefresh {
            expires: reply.expire_at > 0,
            ttl,
        })
    }

    fn arm_sub_refresh(&self, channel: &str, delay: Duration) -> JoinHandle<()> {
        let weak = self.weak.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(client) = weak.upgrade() {
                client.on_sub_refresh_timer(channel).await;
            }
        })
    }

    async fn on_sub_refresh_timer(self: Arc<Self>, channel: String) {
        let (user, client_side) = {
            let mut state = self.state.lock().expect("client state lock");
            if state.status != ConnectionState::Connected {
                return;
            }
            let Some(sub) = state.subscriptions.get_mut(&channel) else {
                return;
            };
            sub.timer = None;
            let client_side = sub.client_side_refresh;
            (state.user.clone(), client_side)
        };

        let handler = self.hub.handlers().sub_refresh.clone();
        let handler = match handler {
            Some(handler) if !client_side => handler,
            _ => {
                debug!(client_id = %self.id, %channel, "subscription expired");
                self.unsubscribe(&channel, Unsubscribe::expired());
                return;
            }
        };

        let outcome = handler(SubRefreshEvent {
            client_id: self.id.clone(),
            user,
            client_side_refresh: false,
            channel: channel.clone(),
            token: String::new(),
        })
        .await;

        match outcome {
            Ok(reply) => {
                if let Err(e) = self.apply_sub_refresh(&channel, reply) {
                    debug!(client_id = %self.id, %channel, error = %e, "subscription ended by server-side refresh");
                }
            }
            Err(HandlerError::Disconnect(d)) => {
                self.close(d);
            }
            Err(HandlerError::Reply(e)) => {
                warn!(client_id = %self.id, %channel, error = %e, "sub refresh handler failed");
                self.unsubscribe(&channel, Unsubscribe::expired());
            }
        }
    }

    // ── Channel operations ─────────────────────────────────────────

    async fn publish(self: Arc<Self>, channel: String, data: Vec<u8>) -> Result<ReplyResult, HandlerError> {
        self.hub.validate_channel(&channel)?;
        let Some(handler) = self.hub.handlers().publish.clone() else {
            return Err(ReplyError::not_available().into());
        };
        let reply = handler(PublishEvent {
            client_id: self.id.clone(),
            user: self.user(),
            channel: channel.clone(),
            data: data.clone(),
        })
        .await?;

        // The handler already published when it reports a result.
        if reply.result.is_none() {
            if let Err(e) = self.hub.publish(&channel, data) {
                error!(client_id = %self.id, %channel, error = %e, "publish to broker failed");
                return Err(ReplyError::internal().into());
            }
        }
        Ok(ReplyResult::Publish)
    }

    async fn presence(self: Arc<Self>, channel: String) -> Result<ReplyResult, HandlerError> {
        self.hub.validate_channel(&channel)?;
        let Some(handler) = self.hub.handlers().presence.clone() else {
            return Err(ReplyError::not_available().into());
        };
        let reply = handler(PresenceEvent {
            client_id: self.id.clone(),
            channel,
        })
        .await?;
        Ok(ReplyResult::Presence {
            presence: reply.clients,
        })
    }

    async fn presence_stats(self: Arc<Self>, channel: String) -> Result<ReplyResult, HandlerError> {
        self.hub.validate_channel(&channel)?;
        let Some(handler) = self.hub.handlers().presence_stats.clone() else {
            return Err(ReplyError::not_available().into());
        };
        let reply = handler(PresenceEvent {
            client_id: self.id.clone(),
            channel,
        })
        .await?;
        Ok(ReplyResult::PresenceStats {
            num_clients: reply.num_clients,
            num_users: reply.num_users,
        })
    }

    async fn history(self: Arc<Self>, channel: String, limit: usize) -> Result<ReplyResult, HandlerError> {
        self.hub.validate_channel(&channel)?;
        let Some(handler) = self.hub.handlers().history.clone() else {
            return Err(ReplyError::not_available().into());
        };
        let reply = handler(HistoryEvent {
            client_id: self.id.clone(),
            channel,
            limit,
        })
        .await?;
        Ok(ReplyResult::History {
            publications: reply.publications,
            offset: reply.offset,
            epoch: reply.epoch,
        })
    }

    async fn rpc(self: Arc<Self>, method: String, data: Vec<u8>) -> Result<ReplyResult, HandlerError> {
        let Some(handler) = self.hub.handlers().rpc.clone() else {
            return Err(ReplyError::not_available().into());
        };
        let reply = handler(RpcEvent {
            client_id: self.id.clone(),
            user: self.user(),
            method,
            data,
        })
        .await?;
        Ok(ReplyResult::Rpc { data: reply.data })
    }

    // ── Delivery and close ─────────────────────────────────────────

    pub(crate) fn push_publication(&self, channel: &str, data: Bytes) {
        let state = self.state.lock().expect("client state lock");
        if state.status == ConnectionState::Connected && state.subscriptions.contains_key(channel) {
            self.write(Outbound::Publication {
                channel: channel.to_string(),
                data,
            });
        }
    }

    /// Close the connection.
    ///
    /// Use [`Disconnect::connection_closed`] when the transport went away
    /// on its own. Returns `false` if the connection was already closing.
    pub fn close(&self, disconnect: Disconnect) -> bool {
        let (was_connected, user, subscriptions) = {
            let mut state = self.state.lock().expect("client state lock");
            if matches!(state.status, ConnectionState::Closing | ConnectionState::Closed) {
                return false;
            }
            let was_connected = state.status == ConnectionState::Connected;
            state.status = ConnectionState::Closing;
            state.disconnect = Some(disconnect.clone());
            for timer in [state.refresh_timer.take(), state.alive_timer.take()].into_iter().flatten() {
                timer.abort();
            }
            let subscriptions: Vec<(String, Subscription)> = state.subscriptions.drain().collect();
            (was_connected, state.user.clone(), subscriptions)
        };

        if disconnect.code != disconnect_code::CONNECTION_CLOSED {
            self.hub.observer().inc_server_disconnect(disconnect.code);
            self.write(Outbound::Disconnect(disconnect.clone()));
        }

        let handlers = self.hub.handlers();
        for (channel, sub) in subscriptions {
            if let Some(timer) = sub.timer {
                timer.abort();
            }
            self.hub.unsubscribe_local(&channel, &self.id, &user);
            if let Some(handler) = &handlers.unsubscribe {
                handler(UnsubscribeEvent {
                    client_id: self.id.clone(),
                    user: user.clone(),
                    channel,
                    server_side: sub.server_side,
                    unsubscribe: Unsubscribe::disconnect(),
                });
            }
        }

        if was_connected {
            self.hub.remove_client(&self.id, &user);
            if let Some(handler) = &handlers.disconnected {
                handler(DisconnectEvent {
                    client_id: self.id.clone(),
                    user: user.clone(),
                    disconnect: disconnect.clone(),
                });
            }
        }

        self.state.lock().expect("client state lock").status = ConnectionState::Closed;
        info!(client_id = %self.id, %user, code = disconnect.code, reason = %disconnect.reason, "client disconnected");
        true
    }
}
