//! Prometheus text exposition format.
//!
//! Renders a metrics snapshot into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::collector::{DurationStats, MetricsSnapshot};

/// Render a snapshot into Prometheus text format.
///
/// Node counts become gauges, timings become summaries with 0.5 and 0.99
/// quantiles, and everything else becomes labeled counters.
pub fn render_prometheus(snap: &MetricsSnapshot) -> String {
    let ns = &snap.namespace;
    let mut out = String::new();

    gauge(&mut out, ns, "node_num_clients", "Number of clients connected.", snap.gauges.clients as u64);
    gauge(&mut out, ns, "node_num_users", "Number of unique users connected.", snap.gauges.users as u64);
    gauge(
        &mut out,
        ns,
        "node_num_channels",
        "Number of channels with one or more subscribers.",
        snap.gauges.channels as u64,
    );
    gauge(
        &mut out,
        ns,
        "node_num_subscriptions",
        "Number of subscriptions.",
        snap.gauges.subscriptions as u64,
    );
    gauge(&mut out, ns, "node_num_nodes", "Number of nodes in cluster.", snap.num_nodes);

    let _ = writeln!(out, "# HELP {ns}_node_build Node build info.");
    let _ = writeln!(out, "# TYPE {ns}_node_build gauge");
    let _ = writeln!(out, "{ns}_node_build{{version=\"{}\"}} 1", snap.version);

    summary(
        &mut out,
        ns,
        "client_command_duration_seconds",
        "Client command duration summary.",
        "method",
        &snap.command_durations,
    );
    summary(
        &mut out,
        ns,
        "node_survey_duration_seconds",
        "Survey duration summary.",
        "op",
        &snap.survey_durations,
    );

    let _ = writeln!(out, "# HELP {ns}_client_num_reply_errors Number of errors in replies sent to clients.");
    let _ = writeln!(out, "# TYPE {ns}_client_num_reply_errors counter");
    for ((method, code), count) in &snap.reply_errors {
        let _ = writeln!(
            out,
            "{ns}_client_num_reply_errors{{method=\"{method}\",code=\"{code}\"}} {count}"
        );
    }

    let _ = writeln!(out, "# HELP {ns}_client_num_server_disconnects Number of server initiated disconnects.");
    let _ = writeln!(out, "# TYPE {ns}_client_num_server_disconnects counter");
    for (code, count) in &snap.server_disconnects {
        let _ = writeln!(out, "{ns}_client_num_server_disconnects{{code=\"{code}\"}} {count}");
    }

    let _ = writeln!(out, "# HELP {ns}_client_recover Count of recover operations.");
    let _ = writeln!(out, "# TYPE {ns}_client_recover counter");
    let _ = writeln!(out, "{ns}_client_recover{{recovered=\"yes\"}} {}", snap.recover_yes);
    let _ = writeln!(out, "{ns}_client_recover{{recovered=\"no\"}} {}", snap.recover_no);

    counter_by_type(&mut out, ns, "node_messages_sent_count", "Number of messages sent.", &snap.messages_sent);
    counter_by_type(
        &mut out,
        ns,
        "node_messages_received_count",
        "Number of messages received.",
        &snap.messages_received,
    );

    out
}

fn gauge(out: &mut String, ns: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {ns}_{name} {help}");
    let _ = writeln!(out, "# TYPE {ns}_{name} gauge");
    let _ = writeln!(out, "{ns}_{name} {value}");
}

fn summary(
    out: &mut String,
    ns: &str,
    name: &str,
    help: &str,
    label: &str,
    series: &BTreeMap<String, DurationStats>,
) {
    let _ = writeln!(out, "# HELP {ns}_{name} {help}");
    let _ = writeln!(out, "# TYPE {ns}_{name} summary");
    for (key, stats) in series {
        let _ = writeln!(
            out,
            "{ns}_{name}{{{label}=\"{key}\",quantile=\"0.5\"}} {:.6}",
            stats.p50_ms / 1000.0
        );
        let _ = writeln!(
            out,
            "{ns}_{name}{{{label}=\"{key}\",quantile=\"0.99\"}} {:.6}",
            stats.p99_ms / 1000.0
        );
        let _ = writeln!(out, "{ns}_{name}_sum{{{label}=\"{key}\"}} {:.6}", stats.sum_secs);
        let _ = writeln!(out, "{ns}_{name}_count{{{label}=\"{key}\"}} {}", stats.count);
    }
}

fn counter_by_type(out: &mut String, ns: &str, name: &str, help: &str, counts: &BTreeMap<String, u64>) {
    let _ = writeln!(out, "# HELP {ns}_{name} {help}");
    let _ = writeln!(out, "# TYPE {ns}_{name} counter");
    for (kind, count) in counts {
        let _ = writeln!(out, "{ns}_{name}{{type=\"{kind}\"}} {count}");
    }
}
