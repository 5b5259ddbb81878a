//! Queue-group subscription feeding a [`Pipeline`] through a bounded channel.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use market_middleware::{Subscription, Transport, TransportError};

use crate::error::AggregatorError;
use crate::health::{now_epoch_secs, HealthState};
use crate::pipeline::{FlushTrigger, Pipeline};
use crate::sink::PartitionSink;

const MIN_AGE_CHECK: Duration = Duration::from_millis(10);
const MAX_AGE_CHECK: Duration = Duration::from_secs(1);

/// Runtime knobs of a driver run.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Payloads buffered between the receive task and the aggregation task
    pub channel_capacity: usize,
    /// Flush a partial batch once its oldest event is this old
    pub max_batch_age: Duration,
    pub stats_interval: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            max_batch_age: Duration::from_secs(60),
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl DriverSettings {
    /// How often the partial batch age is checked.
    fn age_check_interval(&self) -> Duration {
        (self.max_batch_age / 10).clamp(MIN_AGE_CHECK, MAX_AGE_CHECK)
    }
}

/// A joined queue-group subscription, ready to be run.
pub struct SubscriptionDriver {
    subscription: Box<dyn Subscription>,
    subject: String,
    queue_group: String,
    settings: DriverSettings,
}

impl SubscriptionDriver {
    /// Join `queue_group` on `subject`. Every message published on the subject
    /// reaches exactly one member of the group.
    pub async fn subscribe(
        transport: &dyn Transport,
        subject: &str,
        queue_group: &str,
        settings: DriverSettings,
    ) -> Result<Self, AggregatorError> {
        if settings.channel_capacity == 0 {
            return Err(AggregatorError::Config(
                "channel capacity must be greater than zero".to_string(),
            ));
        }

        let subscription = transport.queue_subscribe(subject, queue_group).await?;
        info!(subject = %subject, queue_group = %queue_group, "Subscribed");

        Ok(Self {
            subscription,
            subject: subject.to_string(),
            queue_group: queue_group.to_string(),
            settings,
        })
    }

    /// Consume messages until `shutdown` fires or the subscription closes.
    ///
    /// On the way out the receive task stops pulling, payloads already in the
    /// channel are processed and the partial batch is flushed. The pipeline is
    /// handed back so callers can inspect its final state.
    pub async fn run<S: PartitionSink>(
        self,
        mut pipeline: Pipeline<S>,
        shutdown: CancellationToken,
    ) -> Result<Pipeline<S>, AggregatorError> {
        let SubscriptionDriver {
            subscription,
            subject,
            queue_group,
            settings,
        } = self;

        let (tx, mut rx) = mpsc::channel::<Bytes>(settings.channel_capacity);
        let stop = shutdown.child_token();
        let receiver = tokio::spawn(receive_loop(
            subscription,
            tx,
            pipeline.health(),
            stop.clone(),
        ));

        info!(
            subject = %subject,
            queue_group = %queue_group,
            max_batch_age_secs = settings.max_batch_age.as_secs_f64(),
            channel_capacity = settings.channel_capacity,
            "Aggregation task running"
        );

        let result = aggregate_loop(&mut pipeline, &mut rx, &settings).await;

        // Stop the receiver if the aggregation side failed first, then release
        // the channel so a receiver blocked on `send` can observe it.
        stop.cancel();
        drop(rx);
        let received = receiver
            .await
            .map_err(|e| AggregatorError::Task(format!("receive task failed: {}", e)))?;

        result?;

        if let Some(report) = pipeline.flush(FlushTrigger::Shutdown).await? {
            info!(
                events = report.events,
                rows = report.sink.rows(),
                "Flushed partial batch on shutdown"
            );
        }
        log_stats(&pipeline);

        received?;
        info!(subject = %subject, "Aggregation task stopped");
        Ok(pipeline)
    }
}

/// Pull messages off the bus and hand payloads to the aggregation task.
async fn receive_loop(
    mut subscription: Box<dyn Subscription>,
    tx: mpsc::Sender<Bytes>,
    health: HealthState,
    stop: CancellationToken,
) -> Result<(), AggregatorError> {
    let outcome = loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("Receive task stopping");
                break Ok(());
            }
            msg = subscription.next() => match msg {
                Ok(msg) => {
                    health.record_message(now_epoch_secs());
                    // Blocks while the channel is full, which holds the bus back
                    // during a flush.
                    if tx.send(msg.payload).await.is_err() {
                        break Ok(());
                    }
                }
                Err(TransportError::Closed(subject)) => {
                    warn!(subject = %subject, "Subscription closed");
                    break Err(AggregatorError::Transport(TransportError::Closed(subject)));
                }
                Err(e) => {
                    warn!(error = %e, "Subscription failed");
                    break Err(AggregatorError::Transport(e));
                }
            }
        }
    };

    drop(tx);
    if outcome.is_ok() {
        if let Err(e) = subscription.unsubscribe().await {
            warn!(error = %e, "Failed to unsubscribe");
        }
    }
    outcome
}

/// Serially process payloads until the receive side hangs up.
async fn aggregate_loop<S: PartitionSink>(
    pipeline: &mut Pipeline<S>,
    rx: &mut mpsc::Receiver<Bytes>,
    settings: &DriverSettings,
) -> Result<(), AggregatorError> {
    let age_period = settings.age_check_interval();
    let mut age_check = interval_at(Instant::now() + age_period, age_period);
    age_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats = interval_at(Instant::now() + settings.stats_interval, settings.stats_interval);
    stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            payload = rx.recv() => match payload {
                Some(payload) => {
                    pipeline.handle_payload(&payload).await?;
                }
                None => return Ok(()),
            },
            _ = age_check.tick() => {
                let expired = pipeline
                    .oldest_pending_age()
                    .is_some_and(|age| age >= settings.max_batch_age);
                if expired {
                    pipeline.flush(FlushTrigger::Age).await?;
                }
            }
            _ = stats.tick() => log_stats(pipeline),
        }
    }
}

fn log_stats<S: PartitionSink>(pipeline: &Pipeline<S>) {
    let stats = pipeline.stats();
    info!(
        received = stats.received,
        accepted = stats.accepted,
        rejected = stats.rejected,
        pending = pipeline.pending(),
        batches_flushed = stats.batches_flushed,
        rows_written = stats.rows_written,
        sink_failures = stats.sink_failures,
        "Aggregator stats"
    );
}
