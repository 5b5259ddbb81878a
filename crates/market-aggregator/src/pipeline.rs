//! Decode → accumulate → aggregate → sink, for one serialized message stream.

use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::accumulator::BatchAccumulator;
use crate::aggregator::{AggregateRow, Aggregator};
use crate::error::AggregatorError;
use crate::event::decode;
use crate::health::{now_epoch_secs, HealthState};
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::sink::{PartitionSink, SinkReport};

/// What caused a batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached its configured size
    Full,
    /// The oldest pending event exceeded the max batch age
    Age,
    /// The driver is stopping
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Full => "full",
            FlushTrigger::Age => "age",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Result of one successful flush.
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    /// Events in the flushed batch
    pub events: usize,
    /// Write attempts it took
    pub attempts: u32,
    pub sink: SinkReport,
}

/// Running totals, for the periodic stats log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub batches_flushed: u64,
    pub rows_written: u64,
    pub sink_failures: u64,
}

/// A drained batch whose aggregate has not been persisted yet.
struct StagedBatch {
    trigger: FlushTrigger,
    events: usize,
    rows: Vec<AggregateRow>,
}

/// Owns the accumulator for the lifetime of one driver run.
pub struct Pipeline<S> {
    accumulator: BatchAccumulator,
    aggregator: Aggregator,
    sink: S,
    retry: RetryPolicy,
    staged: Option<StagedBatch>,
    stats: PipelineStats,
    health: HealthState,
}

impl<S: PartitionSink> Pipeline<S> {
    pub fn new(
        batch_size: usize,
        aggregator: Aggregator,
        sink: S,
        retry: RetryPolicy,
    ) -> Result<Self, AggregatorError> {
        let batch_size = NonZeroUsize::new(batch_size).ok_or_else(|| {
            AggregatorError::Config("batch size must be greater than zero".to_string())
        })?;
        Ok(Self {
            accumulator: BatchAccumulator::new(batch_size),
            aggregator,
            sink,
            retry,
            staged: None,
            stats: PipelineStats::default(),
            health: HealthState::new(),
        })
    }

    /// Process one inbound payload.
    ///
    /// Undecodable payloads are logged, counted and dropped. When the payload
    /// completes a batch the batch is flushed before this returns, so the
    /// caller cannot hand over the next message while a write is pending.
    pub async fn handle_payload(
        &mut self,
        payload: &[u8],
    ) -> Result<Option<FlushReport>, AggregatorError> {
        self.stats.received += 1;
        metrics::inc_message();

        let event = match decode(payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.rejected += 1;
                metrics::inc_decode_failure(e.reason());
                warn!(reason = e.reason(), error = %e, bytes = payload.len(), "Dropping undecodable message");
                return Ok(None);
            }
        };

        self.stats.accepted += 1;
        metrics::inc_event_accepted();

        let full = self.accumulator.append(event);
        metrics::set_pending_events(self.accumulator.len());
        if self.accumulator.len() == 1 && self.staged.is_none() {
            self.health.record_pending_since(Some(now_epoch_secs()));
        }
        if full {
            self.flush(FlushTrigger::Full).await
        } else {
            Ok(None)
        }
    }

    /// Aggregate and persist whatever is pending.
    ///
    /// A batch left staged by an earlier failed flush is written first. Returns
    /// the report of the last batch written, or `None` if nothing was pending.
    pub async fn flush(
        &mut self,
        trigger: FlushTrigger,
    ) -> Result<Option<FlushReport>, AggregatorError> {
        let mut last = None;
        if self.staged.is_some() {
            last = Some(self.write_staged().await?);
        }
        if !self.accumulator.is_empty() {
            self.stage(trigger);
            last = Some(self.write_staged().await?);
        }
        Ok(last)
    }

    fn stage(&mut self, trigger: FlushTrigger) {
        let batch = self.accumulator.drain();
        metrics::set_pending_events(0);
        let rows = self.aggregator.aggregate(&batch);
        debug!(
            trigger = trigger.as_str(),
            events = batch.len(),
            rows = rows.len(),
            "Staged batch"
        );
        self.staged = Some(StagedBatch {
            trigger,
            events: batch.len(),
            rows,
        });
    }

    /// Write the staged batch, retrying with backoff. The staged batch is only
    /// released once the sink confirms the write.
    async fn write_staged(&mut self) -> Result<FlushReport, AggregatorError> {
        let Some(staged) = self.staged.as_ref() else {
            return Err(AggregatorError::Task("no staged batch".to_string()));
        };

        let mut backoff = self.retry.backoff();
        loop {
            match self.sink.write(&staged.rows) {
                Ok(sink) => {
                    let attempts = backoff.attempts() + 1;
                    let report = FlushReport {
                        trigger: staged.trigger,
                        events: staged.events,
                        attempts,
                        sink,
                    };
                    self.staged = None;
                    let now = now_epoch_secs();
                    self.health.record_flush(now);
                    self.health.record_pending_since(
                        self.accumulator
                            .oldest_age()
                            .map(|age| now.saturating_sub(age.as_secs())),
                    );
                    self.record_flush(&report);
                    return Ok(report);
                }
                Err(e) => {
                    self.stats.sink_failures += 1;
                    metrics::inc_sink_failure();
                    self.health.set_sink_failing(true);
                    match backoff.next_delay() {
                        Some(delay) => {
                            error!(
                                error = %e,
                                attempt = backoff.attempts(),
                                retry_in_ms = delay.as_millis() as u64,
                                events = staged.events,
                                rows = staged.rows.len(),
                                "Sink write failed, holding batch and retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!(
                                error = %e,
                                attempts = backoff.attempts(),
                                events = staged.events,
                                rows = staged.rows.len(),
                                "Sink write failed, retry budget exhausted"
                            );
                            return Err(AggregatorError::SinkExhausted {
                                attempts: backoff.attempts(),
                                source: e,
                            });
                        }
                    }
                }
            }
        }
    }

    fn record_flush(&mut self, report: &FlushReport) {
        let rows = report.sink.rows();
        self.stats.batches_flushed += 1;
        self.stats.rows_written += rows;
        metrics::record_flush(
            report.trigger.as_str(),
            rows,
            report.sink.files.len() as u64,
            Utc::now().timestamp() as f64,
        );
        info!(
            trigger = report.trigger.as_str(),
            events = report.events,
            rows,
            attempts = report.attempts,
            "Flushed batch"
        );
    }

    /// Events waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.accumulator.len()
    }

    /// Whether a failed batch is waiting to be rewritten.
    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.accumulator.oldest_age()
    }

    /// Handle to the signals behind `/healthz`.
    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
