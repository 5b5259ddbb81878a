//! Liveness signals shared between the aggregation task and the ops server.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

/// Default threshold in seconds (5 minutes) for a partial batch to be flushed
pub const DEFAULT_FLUSH_OVERDUE_SECS: u64 = 300;

/// Current Unix time in whole seconds.
pub fn now_epoch_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

#[derive(Debug, Default)]
struct Signals {
    /// Unix timestamps in seconds, 0 when unset
    last_message: AtomicU64,
    last_flush: AtomicU64,
    pending_since: AtomicU64,
    sink_failing: AtomicBool,
}

/// Cheap-to-clone handle; every clone observes the same signals.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    signals: Arc<Signals>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// A batch is held because the sink keeps rejecting it
    SinkFailing,
    /// Events have waited longer than the overdue threshold without a flush
    FlushOverdue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub sink_failing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush_secs_ago: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_secs_ago: Option<u64>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self, epoch_secs: u64) {
        self.signals.last_message.store(epoch_secs, Ordering::SeqCst);
    }

    /// When the oldest unflushed event arrived, `None` once nothing is pending.
    pub fn record_pending_since(&self, epoch_secs: Option<u64>) {
        self.signals
            .pending_since
            .store(epoch_secs.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn record_flush(&self, epoch_secs: u64) {
        self.signals.last_flush.store(epoch_secs, Ordering::SeqCst);
        self.signals.sink_failing.store(false, Ordering::SeqCst);
    }

    pub fn set_sink_failing(&self, failing: bool) {
        self.signals.sink_failing.store(failing, Ordering::SeqCst);
    }

    pub fn sink_failing(&self) -> bool {
        self.signals.sink_failing.load(Ordering::SeqCst)
    }

    /// Evaluate the signals at `now_epoch_secs`.
    pub fn snapshot(&self, now_epoch_secs: u64, flush_overdue_secs: u64) -> HealthSnapshot {
        let ago = |ts: u64| (ts != 0).then(|| now_epoch_secs.saturating_sub(ts));

        let sink_failing = self.sink_failing();
        let pending_secs = ago(self.signals.pending_since.load(Ordering::SeqCst));
        let status = if sink_failing {
            HealthStatus::SinkFailing
        } else if pending_secs.is_some_and(|secs| secs > flush_overdue_secs) {
            HealthStatus::FlushOverdue
        } else {
            HealthStatus::Ok
        };

        HealthSnapshot {
            status,
            sink_failing,
            pending_secs,
            last_flush_secs_ago: ago(self.signals.last_flush.load(Ordering::SeqCst)),
            last_message_secs_ago: ago(self.signals.last_message.load(Ordering::SeqCst)),
        }
    }
}
