//! Metrics collection and export for datalink.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use datalink_core::{BusStats, RouterStats};
use datalink_transport::GatewayCounters;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tracing::info;

/// Metric names.
pub mod names {
    pub const ENVELOPES_IN: &str = "datalink_envelopes_in_total";
    pub const ENVELOPES_OUT: &str = "datalink_envelopes_out_total";
    pub const ENVELOPES_RELAYED: &str = "datalink_envelopes_relayed_total";
    pub const LINK_ERRORS: &str = "datalink_link_errors_total";
    pub const ROUTED: &str = "datalink_routed_total";
    pub const DROPPED: &str = "datalink_dropped_total";
    pub const EXCLUDED_TOPICS: &str = "datalink_excluded_topics";
    pub const SUBSCRIPTIONS: &str = "datalink_subscriptions";
    pub const BRIDGE_FORWARDS: &str = "datalink_bridge_forwards_total";
    pub const IPC_ERRORS: &str = "datalink_ipc_errors_total";
    pub const LAUNCHES: &str = "datalink_launches_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::ENVELOPES_IN, "Envelopes received per link");
    metrics::describe_counter!(
        names::ENVELOPES_OUT,
        "Envelopes created from local publishes and sent per link"
    );
    metrics::describe_counter!(
        names::ENVELOPES_RELAYED,
        "Envelopes relayed from another link and sent per link"
    );
    metrics::describe_counter!(names::LINK_ERRORS, "Link decode and send errors");
    metrics::describe_counter!(names::ROUTED, "Envelopes the router relayed");
    metrics::describe_counter!(names::DROPPED, "Envelopes the router dropped, by reason");
    metrics::describe_gauge!(names::EXCLUDED_TOPICS, "Size of the exclusion set");
    metrics::describe_gauge!(names::SUBSCRIPTIONS, "Live bus subscriptions");
    metrics::describe_counter!(names::BRIDGE_FORWARDS, "Values forwarded by the bridge, by step");
    metrics::describe_counter!(names::IPC_ERRORS, "Process channel errors");
    metrics::describe_counter!(names::LAUNCHES, "Estimation process launches");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record one value forwarded by a bridge step.
pub fn record_forward(step: &'static str) {
    counter!(names::BRIDGE_FORWARDS, "step" => step).increment(1);
}

/// Record a process channel error.
pub fn record_ipc_error(channel: u16) {
    counter!(names::IPC_ERRORS, "channel" => channel.to_string()).increment(1);
}

/// Record a process launch.
pub fn record_launch() {
    counter!(names::LAUNCHES).increment(1);
}

/// Export a gateway's counters.
pub fn export_gateway(link: &str, counters: &GatewayCounters) {
    let link = link.to_string();
    counter!(names::ENVELOPES_IN, "link" => link.clone())
        .absolute(counters.envelopes_in.load(Ordering::Relaxed));
    counter!(names::ENVELOPES_OUT, "link" => link.clone())
        .absolute(counters.envelopes_out.load(Ordering::Relaxed));
    counter!(names::ENVELOPES_RELAYED, "link" => link.clone())
        .absolute(counters.relayed_out.load(Ordering::Relaxed));
    counter!(names::LINK_ERRORS, "link" => link.clone(), "kind" => "decode")
        .absolute(counters.decode_errors.load(Ordering::Relaxed));
    counter!(names::LINK_ERRORS, "link" => link, "kind" => "send")
        .absolute(counters.send_errors.load(Ordering::Relaxed));
}

/// Export router statistics.
pub fn export_router(stats: &RouterStats) {
    counter!(names::ROUTED).absolute(stats.routed);
    counter!(names::DROPPED, "reason" => "hops").absolute(stats.dropped_hops);
    counter!(names::DROPPED, "reason" => "topic_report").absolute(stats.dropped_reports);
    counter!(names::DROPPED, "reason" => "excluded").absolute(stats.dropped_excluded);
    counter!(names::DROPPED, "reason" => "relay_full").absolute(stats.relay_failures);
    gauge!(names::EXCLUDED_TOPICS).set(stats.excluded_topics as f64);
}

/// Export bus statistics.
pub fn export_bus(stats: &BusStats) {
    gauge!(names::SUBSCRIPTIONS).set(stats.subscription_count as f64);
}
