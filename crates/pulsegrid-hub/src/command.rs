//! Decoded client commands, replies and server pushes.
//!
//! The transport decodes frames into [`Command`]s and hands them to a
//! connection; everything the connection wants to write goes back as
//! [`Outbound`] values in the order they must hit the wire.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use pulse_core::{Disconnect, ReplyError, Unsubscribe};

use crate::handlers::{ClientInfo, Publication};

/// Command method, used for handler lookup and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    Refresh,
    Subscribe,
    Unsubscribe,
    Publish,
    Presence,
    PresenceStats,
    History,
    Rpc,
    Message,
    SubRefresh,
    Ping,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Refresh => "refresh",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Presence => "presence",
            Self::PresenceStats => "presence_stats",
            Self::History => "history",
            Self::Rpc => "rpc",
            Self::Message => "message",
            Self::SubRefresh => "sub_refresh",
            Self::Ping => "ping",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command body, one variant per method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect {
        token: String,
        data: Vec<u8>,
        name: String,
        version: String,
        /// Channels the client would like to be subscribed to server-side.
        channels: Vec<String>,
    },
    Refresh {
        token: String,
    },
    Subscribe {
        channel: String,
        token: String,
        data: Vec<u8>,
        /// Ask the application to replay publications missed while away.
        recover: bool,
    },
    Unsubscribe {
        channel: String,
    },
    Publish {
        channel: String,
        data: Vec<u8>,
    },
    Presence {
        channel: String,
    },
    PresenceStats {
        channel: String,
    },
    History {
        channel: String,
        /// Maximum publications to return; zero means none, only the stream
        /// position.
        limit: usize,
    },
    Rpc {
        method: String,
        data: Vec<u8>,
    },
    Message {
        data: Vec<u8>,
    },
    SubRefresh {
        channel: String,
        token: String,
    },
    Ping,
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Self::Connect { .. } => Method::Connect,
            Self::Refresh { .. } => Method::Refresh,
            Self::Subscribe { .. } => Method::Subscribe,
            Self::Unsubscribe { .. } => Method::Unsubscribe,
            Self::Publish { .. } => Method::Publish,
            Self::Presence { .. } => Method::Presence,
            Self::PresenceStats { .. } => Method::PresenceStats,
            Self::History { .. } => Method::History,
            Self::Rpc { .. } => Method::Rpc,
            Self::Message { .. } => Method::Message,
            Self::SubRefresh { .. } => Method::SubRefresh,
            Self::Ping => Method::Ping,
        }
    }
}

/// A command as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Client-chosen ID echoed in the reply.
    pub id: u32,
    pub request: Request,
}

impl Command {
    pub fn new(id: u32, request: Request) -> Self {
        Self { id, request }
    }

    pub fn method(&self) -> Method {
        self.request.method()
    }
}

/// Successful reply payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyResult {
    Connect {
        client: String,
        version: String,
        data: Vec<u8>,
        /// Server-side subscriptions established for the connection.
        subs: Vec<String>,
        expires: bool,
        ttl: u64,
    },
    Refresh {
        expires: bool,
        ttl: u64,
    },
    Subscribe {
        expires: bool,
        ttl: u64,
        recoverable: bool,
        recovered: bool,
        publications: Vec<Publication>,
    },
    Unsubscribe,
    Publish,
    Presence {
        presence: BTreeMap<String, ClientInfo>,
    },
    PresenceStats {
        num_clients: u32,
        num_users: u32,
    },
    History {
        publications: Vec<Publication>,
        offset: u64,
        epoch: String,
    },
    Rpc {
        data: Vec<u8>,
    },
    SubRefresh {
        expires: bool,
        ttl: u64,
    },
    Ping,
}

/// Reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: u32,
    pub result: Result<ReplyResult, ReplyError>,
}

/// Frames a connection writes to its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Reply(Reply),
    /// A publication in a channel the connection is subscribed to.
    Publication { channel: String, data: Bytes },
    /// The server ended one of the connection's subscriptions.
    Unsubscribe {
        channel: String,
        unsubscribe: Unsubscribe,
    },
    /// Last frame before the transport closes.
    Disconnect(Disconnect),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reports_method() {
        let cmd = Command::new(
            1,
            Request::Subscribe {
                channel: "news".into(),
                token: String::new(),
                data: vec![],
                recover: false,
            },
        );
        assert_eq!(cmd.method(), Method::Subscribe);
        assert_eq!(Request::Ping.method(), Method::Ping);
        assert_eq!(Method::PresenceStats.to_string(), "presence_stats");
    }
}
