//! pulsegrid-metrics — observability for PulseGrid nodes.
//!
//! The core records what happened through the [`Observer`] trait and never
//! waits on it. [`MetricsCollector`] is the in-process implementation; it
//! keeps counters in atomics and short-lived locked maps, and renders the
//! Prometheus text format on demand.
//!
//! # Architecture
//!
//! ```text
//! Hub / Coordinator
//!   └── Observer (trait)
//!         ├── NoopObserver
//!         └── MetricsCollector
//!               ├── snapshot() → MetricsSnapshot
//!               └── export()  → flat items for NodeInfo heartbeats
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for a /metrics endpoint
//! ```

pub mod collector;
pub mod observer;
pub mod prometheus;

pub use collector::{DurationStats, MetricsCollector, MetricsSnapshot};
pub use observer::{NodeGauges, NoopObserver, Observer};
pub use prometheus::render_prometheus;
