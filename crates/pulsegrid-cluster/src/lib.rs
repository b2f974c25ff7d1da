//! pulsegrid-cluster — multi-node coordination for PulseGrid.
//!
//! Nodes never talk to each other directly: every control message is
//! published on a broker topic and every node (the sender included, on
//! most brokers) receives it. This crate owns the sending and the
//! receiving side of that protocol for one node.
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!   ├── broadcast() → envelope stamped with our node ID → Broker
//!   ├── on_envelope() ← Broker delivery
//!   │   ├── drops our own echoes
//!   │   ├── Node → ClusterRegistry
//!   │   ├── Disconnect / Subscribe / Unsubscribe → LocalNode
//!   │   ├── Notification → notification handler
//!   │   ├── SurveyRequest → survey handler → SurveyResponse broadcast
//!   │   └── SurveyResponse → SurveyTable
//!   ├── survey() → fan-out + bounded wait for answers
//!   └── run() → heartbeat publish + registry sweep loop
//!
//! ClusterRegistry
//!   └── peers seen via heartbeats, aged out after a TTL
//! ```

pub mod broker;
pub mod coordinator;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod survey;

pub use broker::{Broker, BrokerError, BrokerHandler, MemoryBroker, MemoryBus};
pub use coordinator::Coordinator;
pub use error::{ClusterError, ClusterResult};
pub use hooks::{
    BoxFuture, LocalNode, NodeInfoSendHandler, NotificationEvent, NotificationHandler,
    SurveyEvent, SurveyHandler,
};
pub use registry::{ClusterRegistry, PeerInfo};
pub use survey::{SurveyReply, SurveyTable};
