//! pulsegrid-hub — client connections and channel membership for a node.
//!
//! A transport hands each accepted connection to the [`Hub`], receives a
//! [`Client`] back and feeds it decoded [`Command`]s. The client calls the
//! application's [`Handlers`], keeps replies in dispatch order and writes
//! [`Outbound`] frames to the transport's channel. [`Node`] wires a hub to
//! a cluster coordinator and a broker.
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── Coordinator (pulsegrid-cluster) ── control topic ── peers
//!   └── Hub ── LocalNode for the coordinator
//!         ├── clients / users index
//!         ├── channel index: local clients + remote (node, user) pairs
//!         └── Client (one per connection)
//!               ├── dispatch() → handler task per command
//!               ├── ReplyBuffer → replies in dispatch order
//!               └── refresh timers for connection and subscriptions
//! ```

pub mod client;
pub mod command;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod node;
pub mod ordering;

pub use client::{Client, ConnectionState};
pub use command::{Command, Method, Outbound, Reply, ReplyResult, Request};
pub use error::{DispatchError, HandlerError, HubError, HubResult};
pub use handlers::*;
pub use hub::Hub;
pub use node::Node;
pub use ordering::ReplyBuffer;

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use pulse_core::{NodeIdentity, PulseConfig};
    use pulsegrid_cluster::{ClusterRegistry, Coordinator, LocalNode, MemoryBus};
    use pulsegrid_metrics::MetricsCollector;

    use crate::client::Client;
    use crate::command::{Outbound, Reply};
    use crate::handlers::Handlers;
    use crate::hub::Hub;

    pub struct TestNode {
        pub bus: MemoryBus,
        pub coordinator: Arc<Coordinator>,
        pub hub: Arc<Hub>,
        pub metrics: Arc<MetricsCollector>,
    }

    impl TestNode {
        pub fn new(id: &str, handlers: Handlers) -> Self {
            let bus = MemoryBus::new();
            let metrics = Arc::new(MetricsCollector::new("test"));
            let registry = Arc::new(ClusterRegistry::new(id));
            let coordinator = Arc::new(Coordinator::new(
                NodeIdentity::with_id(id, "test", "0.1.0"),
                Arc::new(bus.broker()),
                registry,
                metrics.clone(),
            ));
            let hub = Hub::new(
                coordinator.clone(),
                Arc::new(bus.broker()),
                metrics.clone(),
                &PulseConfig::default(),
            );
            hub.set_handlers(handlers);
            let local: Arc<dyn LocalNode> = hub.clone();
            coordinator.set_local(&local);
            coordinator.start().expect("start coordinator");
            Self {
                bus,
                coordinator,
                hub,
                metrics,
            }
        }

        pub fn client(&self) -> (Arc<Client>, mpsc::UnboundedReceiver<Outbound>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (self.hub.connect(tx), rx)
        }
    }

    pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open")
    }

    /// Next reply, skipping pushes.
    pub async fn next_reply(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Reply {
        loop {
            if let Outbound::Reply(reply) = next_frame(rx).await {
                return reply;
            }
        }
    }
}
