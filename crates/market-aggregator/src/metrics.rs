//! Prometheus metrics for the aggregator
//!
//! Registered once in the default registry; [`encode_metrics`] renders them
//! for the optional `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

const LABEL_REASON: &str = "reason";
const LABEL_TRIGGER: &str = "trigger";

/// Messages pulled off the bus
static MESSAGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "market_aggregator_messages_total",
        "Total messages received from the bus"
    )
    .expect("Failed to register messages_total metric")
});

/// Messages decoded and appended to a batch
static EVENTS_ACCEPTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "market_aggregator_events_accepted_total",
        "Total events decoded and buffered"
    )
    .expect("Failed to register events_accepted_total metric")
});

/// Messages rejected by the decoder, by reason
static DECODE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "market_aggregator_decode_failures_total",
        "Total messages dropped by the decoder",
        &[LABEL_REASON]
    )
    .expect("Failed to register decode_failures_total metric")
});

/// Batches flushed to the sink, by trigger
static BATCHES_FLUSHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "market_aggregator_batches_flushed_total",
        "Total batches aggregated and written",
        &[LABEL_TRIGGER]
    )
    .expect("Failed to register batches_flushed_total metric")
});

/// Aggregate rows written
static ROWS_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "market_aggregator_rows_written_total",
        "Total aggregate rows written"
    )
    .expect("Failed to register rows_written_total metric")
});

/// Partition files written
static FILES_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "market_aggregator_files_written_total",
        "Total partition files written"
    )
    .expect("Failed to register files_written_total metric")
});

/// Failed sink write attempts
static SINK_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "market_aggregator_sink_failures_total",
        "Total failed sink write attempts"
    )
    .expect("Failed to register sink_failures_total metric")
});

/// Events left out of a row because they would overflow its volume
static VOLUME_OVERFLOWS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "market_aggregator_volume_overflows_total",
        "Total events dropped because the item volume would overflow"
    )
    .expect("Failed to register volume_overflows_total metric")
});

/// Events waiting in the current batch
static PENDING_EVENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "market_aggregator_pending_events",
        "Events buffered in the current batch"
    )
    .expect("Failed to register pending_events metric")
});

/// Last successful flush (epoch seconds)
static LAST_FLUSH_TIMESTAMP: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "market_aggregator_last_flush_timestamp",
        "Unix timestamp of the last successful flush"
    )
    .expect("Failed to register last_flush_timestamp metric")
});

pub fn inc_message() {
    MESSAGES_TOTAL.inc();
}

pub fn inc_event_accepted() {
    EVENTS_ACCEPTED_TOTAL.inc();
}

pub fn inc_decode_failure(reason: &str) {
    DECODE_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn inc_sink_failure() {
    SINK_FAILURES_TOTAL.inc();
}

pub fn inc_volume_overflow() {
    VOLUME_OVERFLOWS_TOTAL.inc();
}

pub fn set_pending_events(count: usize) {
    PENDING_EVENTS.set(count as i64);
}

/// Record a successful flush.
pub fn record_flush(trigger: &str, rows: u64, files: u64, epoch_secs: f64) {
    BATCHES_FLUSHED_TOTAL.with_label_values(&[trigger]).inc();
    ROWS_WRITTEN_TOTAL.inc_by(rows);
    FILES_WRITTEN_TOTAL.inc_by(files);
    LAST_FLUSH_TIMESTAMP.set(epoch_secs);
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
