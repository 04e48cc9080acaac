//! Prometheus metrics for the stream client
//!
//! Per-stream connection and frame metrics, plus process-wide latency,
//! cache and dispatcher metrics.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge_vec, Encoder, Gauge, GaugeVec, HistogramVec,
    IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};

use crate::endpoint::StreamTarget;
use crate::types::{ConnectionStatus, LatencyStage, MetricsSnapshot, SystemStatus};

const LABEL_SOURCE: &str = "source";
const LABEL_STREAM: &str = "stream";
const LABEL_MESSAGE_TYPE: &str = "message_type";
const LABEL_STAGE: &str = "stage";
const LABEL_OUTCOME: &str = "outcome";

/// Frames decoded per stream and message type
static FRAMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickstream_frames_total",
        "Frames decoded per stream and message type",
        &[LABEL_SOURCE, LABEL_STREAM, LABEL_MESSAGE_TYPE]
    )
    .expect("Failed to register frames_total metric")
});

static DECODE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickstream_decode_failures_total",
        "Frames dropped because no decoder recognised them",
        &[LABEL_SOURCE, LABEL_STREAM]
    )
    .expect("Failed to register decode_failures_total metric")
});

/// Connection status per stream (1 = connected, 0 = not connected)
static STREAM_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tickstream_stream_connected",
        "Connection status per stream (1=connected, 0=not connected)",
        &[LABEL_SOURCE, LABEL_STREAM]
    )
    .expect("Failed to register stream_connected metric")
});

static RECONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickstream_reconnects_total",
        "Scheduled reconnect attempts per stream",
        &[LABEL_SOURCE, LABEL_STREAM]
    )
    .expect("Failed to register reconnects_total metric")
});

static RECONNECTS_EXHAUSTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickstream_reconnects_exhausted_total",
        "Streams that gave up reconnecting",
        &[LABEL_SOURCE, LABEL_STREAM]
    )
    .expect("Failed to register reconnects_exhausted_total metric")
});

/// Last frame timestamp (epoch seconds) per stream
static LAST_ACTIVITY_TIMESTAMP: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tickstream_last_activity_timestamp",
        "Unix timestamp of the last frame per stream",
        &[LABEL_SOURCE, LABEL_STREAM]
    )
    .expect("Failed to register last_activity_timestamp metric")
});

static STAGE_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tickstream_stage_latency_ms",
        "Per-stage processing latency in milliseconds",
        &[LABEL_STAGE],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 7.5, 10.0, 15.0, 25.0, 50.0, 100.0]
    )
    .expect("Failed to register stage_latency_ms metric")
});

static AVERAGE_LATENCY_MS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "tickstream_average_latency_ms",
        "Smoothed end-to-end processing latency"
    )
    .expect("Failed to register average_latency_ms metric")
});

static SLA_COMPLIANCE_PERCENT: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "tickstream_sla_compliance_percent",
        "SLA compliance of the latest processing latency"
    )
    .expect("Failed to register sla_compliance_percent metric")
});

/// 0 = optimal, 1 = stable, 2 = degraded
static SYSTEM_STATUS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("tickstream_system_status", "0=optimal, 1=stable, 2=degraded")
        .expect("Failed to register system_status metric")
});

static FALLBACK_FETCHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickstream_fallback_fetches_total",
        "Out-of-band symbol fetches by outcome",
        &[LABEL_SOURCE, LABEL_OUTCOME]
    )
    .expect("Failed to register fallback_fetches_total metric")
});

static CALLBACK_PANICS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tickstream_callback_panics_total",
        "Subscriber or sink callbacks that panicked"
    )
    .expect("Failed to register callback_panics_total metric")
});

static SINK_WRITES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tickstream_sink_writes_total",
        "Coalesced writes delivered to update sinks"
    )
    .expect("Failed to register sink_writes_total metric")
});

/// Metrics handle bound to one stream
#[derive(Clone)]
pub struct StreamMetrics {
    source: String,
    stream: String,
}

impl StreamMetrics {
    pub fn new(target: &StreamTarget) -> Self {
        let stream = match target {
            StreamTarget::Symbols(_) => "symbols".to_string(),
            StreamTarget::Market { symbol, market, .. } => format!("{}/{}", symbol, market),
        };
        Self {
            source: target.source().to_string(),
            stream,
        }
    }

    fn labels(&self) -> [&str; 2] {
        [&self.source, &self.stream]
    }

    pub fn inc_frame(&self, message_type: &str) {
        FRAMES_TOTAL
            .with_label_values(&[&self.source, &self.stream, message_type])
            .inc();
    }

    pub fn inc_decode_failure(&self) {
        DECODE_FAILURES_TOTAL.with_label_values(&self.labels()).inc();
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        let connected = i64::from(status == ConnectionStatus::Connected);
        STREAM_CONNECTED.with_label_values(&self.labels()).set(connected);
    }

    pub fn inc_reconnect(&self) {
        RECONNECTS_TOTAL.with_label_values(&self.labels()).inc();
    }

    pub fn inc_exhausted(&self) {
        RECONNECTS_EXHAUSTED_TOTAL.with_label_values(&self.labels()).inc();
    }

    pub fn set_last_activity(&self, epoch_secs: f64) {
        LAST_ACTIVITY_TIMESTAMP
            .with_label_values(&self.labels())
            .set(epoch_secs);
    }
}

pub fn observe_stage(stage: LatencyStage, duration_ms: f64) {
    STAGE_LATENCY_MS
        .with_label_values(&[stage.label()])
        .observe(duration_ms);
}

pub fn record_snapshot(snapshot: &MetricsSnapshot) {
    AVERAGE_LATENCY_MS.set(snapshot.average_latency);
    SLA_COMPLIANCE_PERCENT.set(snapshot.sla_compliance_percent);
    SYSTEM_STATUS.set(match snapshot.system_status {
        SystemStatus::Optimal => 0.0,
        SystemStatus::Stable => 1.0,
        SystemStatus::Degraded => 2.0,
    });
}

pub fn inc_fallback(source: &str, outcome: &str) {
    FALLBACK_FETCHES_TOTAL
        .with_label_values(&[source, outcome])
        .inc();
}

pub fn inc_callback_panic() {
    CALLBACK_PANICS_TOTAL.inc();
}

pub fn inc_sink_writes(count: usize) {
    SINK_WRITES_TOTAL.inc_by(count as u64);
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
