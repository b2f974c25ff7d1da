//! Metrics collector — tracks node-wide command, survey and cluster metrics.
//!
//! Uses atomics for gauges and plain counters and mutex-protected maps for
//! labeled counters and duration samples. Every lock is held only for a
//! map lookup and an increment.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::observer::{NodeGauges, Observer};

/// Samples kept per duration series for percentile computation.
const MAX_SAMPLES: usize = 1024;

/// Rolling duration series.
#[derive(Default)]
struct DurationSeries {
    count: u64,
    sum_us: u64,
    /// Most recent samples in microseconds.
    samples: VecDeque<u64>,
}

impl DurationSeries {
    fn observe(&mut self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.count += 1;
        self.sum_us += us;
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(us);
    }

    fn stats(&self) -> DurationStats {
        let samples: Vec<u64> = self.samples.iter().copied().collect();
        let (p50_ms, p99_ms) = compute_percentiles(&samples);
        DurationStats {
            count: self.count,
            sum_secs: self.sum_us as f64 / 1_000_000.0,
            p50_ms,
            p99_ms,
        }
    }
}

/// Aggregated view of one duration series.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DurationStats {
    pub count: u64,
    pub sum_secs: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
}

/// Everything the collector knows at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub namespace: String,
    /// Build version reported by the `node_build` gauge.
    pub version: String,
    pub gauges: NodeGauges,
    pub num_nodes: u64,
    pub command_durations: BTreeMap<String, DurationStats>,
    pub survey_durations: BTreeMap<String, DurationStats>,
    /// (method, code) → count.
    pub reply_errors: BTreeMap<(String, u32), u64>,
    pub server_disconnects: BTreeMap<u32, u64>,
    pub recover_yes: u64,
    pub recover_no: u64,
    pub messages_sent: BTreeMap<String, u64>,
    pub messages_received: BTreeMap<String, u64>,
}

/// In-process [`Observer`] implementation.
pub struct MetricsCollector {
    namespace: String,
    version: String,
    clients: AtomicU64,
    users: AtomicU64,
    channels: AtomicU64,
    subscriptions: AtomicU64,
    nodes: AtomicU64,
    recover_yes: AtomicU64,
    recover_no: AtomicU64,
    command_durations: Mutex<HashMap<String, DurationSeries>>,
    survey_durations: Mutex<HashMap<String, DurationSeries>>,
    reply_errors: Mutex<HashMap<(String, u32), u64>>,
    server_disconnects: Mutex<HashMap<u32, u64>>,
    messages_sent: Mutex<HashMap<String, u64>>,
    messages_received: Mutex<HashMap<String, u64>>,
}

impl MetricsCollector {
    /// Create a collector whose exposition uses `namespace` as metric prefix.
    pub fn new(namespace: &str) -> Self {
        let namespace = if namespace.is_empty() {
            "pulsegrid"
        } else {
            namespace
        };
        debug!(%namespace, "metrics collector created");
        Self {
            namespace: namespace.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            clients: AtomicU64::new(0),
            users: AtomicU64::new(0),
            channels: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
            nodes: AtomicU64::new(0),
            recover_yes: AtomicU64::new(0),
            recover_no: AtomicU64::new(0),
            command_durations: Mutex::new(HashMap::new()),
            survey_durations: Mutex::new(HashMap::new()),
            reply_errors: Mutex::new(HashMap::new()),
            server_disconnects: Mutex::new(HashMap::new()),
            messages_sent: Mutex::new(HashMap::new()),
            messages_received: Mutex::new(HashMap::new()),
        }
    }

    /// Report `version` instead of this crate's version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Take a consistent-enough copy of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let gauges = NodeGauges {
            clients: self.clients.load(Ordering::Relaxed) as usize,
            users: self.users.load(Ordering::Relaxed) as usize,
            channels: self.channels.load(Ordering::Relaxed) as usize,
            subscriptions: self.subscriptions.load(Ordering::Relaxed) as usize,
        };

        MetricsSnapshot {
            namespace: self.namespace.clone(),
            version: self.version.clone(),
            gauges,
            num_nodes: self.nodes.load(Ordering::Relaxed),
            command_durations: series_stats(&self.command_durations),
            survey_durations: series_stats(&self.survey_durations),
            reply_errors: sorted(&self.reply_errors),
            server_disconnects: sorted(&self.server_disconnects),
            recover_yes: self.recover_yes.load(Ordering::Relaxed),
            recover_no: self.recover_no.load(Ordering::Relaxed),
            messages_sent: sorted(&self.messages_sent),
            messages_received: sorted(&self.messages_received),
        }
    }

    /// Number of commands of `method` observed so far.
    pub fn command_count(&self, method: &str) -> u64 {
        let series = self.command_durations.lock().expect("command durations lock");
        series.get(method).map(|s| s.count).unwrap_or(0)
    }

    /// Number of reply errors observed for `method` and `code`.
    pub fn reply_error_count(&self, method: &str, code: u32) -> u64 {
        let errors = self.reply_errors.lock().expect("reply errors lock");
        errors
            .get(&(method.to_string(), code))
            .copied()
            .unwrap_or(0)
    }
}

impl Observer for MetricsCollector {
    fn observe_command_duration(&self, method: &str, duration: Duration) {
        let mut series = self.command_durations.lock().expect("command durations lock");
        series.entry(method.to_string()).or_default().observe(duration);
    }

    fn inc_reply_error(&self, method: &str, code: u32) {
        let mut errors = self.reply_errors.lock().expect("reply errors lock");
        *errors.entry((method.to_string(), code)).or_insert(0) += 1;
    }

    fn inc_recover(&self, recovered: bool) {
        if recovered {
            self.recover_yes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.recover_no.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn observe_survey_duration(&self, op: &str, duration: Duration) {
        let mut series = self.survey_durations.lock().expect("survey durations lock");
        series.entry(op.to_string()).or_default().observe(duration);
    }

    fn inc_server_disconnect(&self, code: u32) {
        let mut disconnects = self.server_disconnects.lock().expect("disconnects lock");
        *disconnects.entry(code).or_insert(0) += 1;
    }

    fn inc_messages_sent(&self, kind: &str) {
        let mut sent = self.messages_sent.lock().expect("messages sent lock");
        *sent.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn inc_messages_received(&self, kind: &str) {
        let mut received = self.messages_received.lock().expect("messages received lock");
        *received.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn set_node_gauges(&self, gauges: NodeGauges) {
        self.clients.store(gauges.clients as u64, Ordering::Relaxed);
        self.users.store(gauges.users as u64, Ordering::Relaxed);
        self.channels.store(gauges.channels as u64, Ordering::Relaxed);
        self.subscriptions
            .store(gauges.subscriptions as u64, Ordering::Relaxed);
    }

    fn set_num_nodes(&self, nodes: usize) {
        self.nodes.store(nodes as u64, Ordering::Relaxed);
    }

    fn export(&self) -> BTreeMap<String, f64> {
        let snap = self.snapshot();
        let mut items = BTreeMap::new();
        items.insert("num_nodes".to_string(), snap.num_nodes as f64);
        items.insert("recover_yes".to_string(), snap.recover_yes as f64);
        items.insert("recover_no".to_string(), snap.recover_no as f64);
        for (method, stats) in &snap.command_durations {
            items.insert(format!("command_count.{method}"), stats.count as f64);
            items.insert(format!("command_p99_ms.{method}"), stats.p99_ms);
        }
        for ((method, code), count) in &snap.reply_errors {
            items.insert(format!("reply_errors.{method}.{code}"), *count as f64);
        }
        items
    }
}

fn series_stats(series: &Mutex<HashMap<String, DurationSeries>>) -> BTreeMap<String, DurationStats> {
    let series = series.lock().expect("duration series lock");
    series.iter().map(|(k, s)| (k.clone(), s.stats())).collect()
}

fn sorted<K: Clone + Ord, V: Copy>(map: &Mutex<HashMap<K, V>>) -> BTreeMap<K, V> {
    let map = map.lock().expect("counter lock");
    map.iter().map(|(k, v)| (k.clone(), *v)).collect()
}

/// Compute P50 and P99 from samples in microseconds.
///
/// Returns (p50_ms, p99_ms). If empty, returns (0.0, 0.0).
fn compute_percentiles(latencies: &[u64]) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)] as f64 / 1000.0;
    let p99 = sorted[p99_idx.min(sorted.len() - 1)] as f64 / 1000.0;

    (p50, p99)
}
