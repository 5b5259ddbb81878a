//! End-to-end driver runs against the in-memory transport.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Float64Array, UInt64Array};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use market_aggregator::health::now_epoch_secs;
use market_aggregator::{
    AggregateRow, AggregatorError, Aggregator, DriverSettings, HealthStatus, ParquetSink,
    PartitionSink, Pipeline, RetryPolicy, SinkError, SinkReport, SubscriptionDriver,
};
use market_middleware::{InMemoryTransport, Transport, TransportError};

const SUBJECT: &str = "marketorders.deduped";
const GROUP: &str = "workers";

/// Sink whose writes stay visible to the test while the driver owns it.
#[derive(Clone, Default)]
struct RecordingSink {
    writes: Arc<Mutex<Vec<Vec<AggregateRow>>>>,
    failures: Arc<Mutex<u32>>,
}

impl RecordingSink {
    fn writes(&self) -> Vec<Vec<AggregateRow>> {
        self.writes.lock().unwrap().clone()
    }

    fn items(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .flatten()
            .map(|row| row.item_id)
            .collect()
    }
}

impl PartitionSink for RecordingSink {
    fn write(&mut self, rows: &[AggregateRow]) -> Result<SinkReport, SinkError> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(SinkError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        self.writes.lock().unwrap().push(rows.to_vec());
        Ok(SinkReport::default())
    }
}

fn payload(item: &str, quality: i64, price: f64, amount: i64) -> Bytes {
    Bytes::from(format!(
        r#"{{"item_id":"{}","quality":{},"price":{},"amount":{}}}"#,
        item, quality, price, amount
    ))
}

fn settings(max_batch_age: Duration) -> DriverSettings {
    DriverSettings {
        channel_capacity: 16,
        max_batch_age,
        stats_interval: Duration::from_secs(30),
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_attempts,
    }
}

fn pipeline<S: PartitionSink>(batch_size: usize, sink: S) -> Pipeline<S> {
    Pipeline::new(batch_size, Aggregator::default(), sink, fast_retry(0)).unwrap()
}

async fn join(transport: &InMemoryTransport, max_batch_age: Duration) -> SubscriptionDriver {
    SubscriptionDriver::subscribe(transport, SUBJECT, GROUP, settings(max_batch_age))
        .await
        .unwrap()
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_full_batch_flushed_while_running() {
    let transport = InMemoryTransport::new();
    let sink = RecordingSink::default();
    let driver = join(&transport, Duration::from_secs(60)).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(driver.run(pipeline(3, sink.clone()), shutdown.clone()));

    transport.publish(SUBJECT, payload("T4_BAG", 4, 100.0, 2)).await.unwrap();
    transport.publish(SUBJECT, payload("T4_BAG", 1, 50.0, 5)).await.unwrap();
    transport.publish(SUBJECT, payload("T5_CAPE", 3, 30.0, 3)).await.unwrap();

    wait_for("full batch flush", || sink.writes().len() == 1).await;

    shutdown.cancel();
    let pipeline = handle.await.unwrap().unwrap();
    assert_eq!(pipeline.pending(), 0);
    assert_eq!(pipeline.stats().batches_flushed, 1);

    let mut rows = sink.writes().remove(0);
    rows.sort_by(|a, b| a.item_id.cmp(&b.item_id));
    assert_eq!(
        rows,
        vec![
            AggregateRow {
                item_id: "T4_BAG".to_string(),
                avg_price: 50.0,
                volume: 2,
            },
            AggregateRow {
                item_id: "T5_CAPE".to_string(),
                avg_price: 10.0,
                volume: 3,
            },
        ]
    );
}

#[tokio::test]
async fn test_idle_partial_batch_flushed_by_age() {
    let transport = InMemoryTransport::new();
    let sink = RecordingSink::default();
    let driver = join(&transport, Duration::from_millis(50)).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(driver.run(pipeline(1000, sink.clone()), shutdown.clone()));

    transport.publish(SUBJECT, payload("A", 5, 9.0, 3)).await.unwrap();
    wait_for("age flush", || sink.writes().len() == 1).await;

    shutdown.cancel();
    let pipeline = handle.await.unwrap().unwrap();
    assert_eq!(pipeline.stats().batches_flushed, 1);
    assert_eq!(sink.writes()[0][0].avg_price, 3.0);
}

#[tokio::test]
async fn test_shutdown_flushes_partial_batch() {
    let transport = InMemoryTransport::new();
    let sink = RecordingSink::default();
    let driver = join(&transport, Duration::from_secs(60)).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(driver.run(pipeline(1000, sink.clone()), shutdown.clone()));

    transport.publish(SUBJECT, payload("A", 3, 10.0, 1)).await.unwrap();
    transport.publish(SUBJECT, payload("A", 3, 30.0, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sink.writes().is_empty());

    shutdown.cancel();
    let pipeline = handle.await.unwrap().unwrap();
    assert_eq!(pipeline.pending(), 0);

    let writes = sink.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0][0].avg_price, 20.0);
    assert_eq!(writes[0][0].volume, 2);
}

#[tokio::test]
async fn test_malformed_messages_excluded() {
    let transport = InMemoryTransport::new();
    let sink = RecordingSink::default();
    let driver = join(&transport, Duration::from_secs(60)).await;

    for msg in [
        payload("A", 3, 10.0, 1),
        Bytes::from_static(b"not json"),
        payload("POISON", 4, 10.0, 0),
        payload("POISON", 9, 10.0, 1),
        payload("A", 4, 20.0, 1),
    ] {
        transport.publish(SUBJECT, msg).await.unwrap();
    }
    // Dropping the bus closes the subscription once its buffer is drained
    drop(transport);

    let Err(err) = driver
        .run(pipeline(2, sink.clone()), CancellationToken::new())
        .await
    else {
        panic!("closed subscription should end the run with an error");
    };
    assert!(matches!(err, AggregatorError::Transport(TransportError::Closed(_))));

    let writes = sink.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].len(), 1);
    assert_eq!(writes[0][0].item_id, "A");
    assert_eq!(writes[0][0].avg_price, 15.0);
}

#[tokio::test]
async fn test_closed_subscription_flushes_before_error() {
    let transport = InMemoryTransport::new();
    let sink = RecordingSink::default();
    let driver = join(&transport, Duration::from_secs(60)).await;

    transport.publish(SUBJECT, payload("A", 3, 10.0, 2)).await.unwrap();
    transport.publish(SUBJECT, payload("B", 5, 8.0, 4)).await.unwrap();
    drop(transport);

    let result = driver
        .run(pipeline(1000, sink.clone()), CancellationToken::new())
        .await;
    assert!(result.is_err());

    let items: BTreeSet<String> = sink.items().into_iter().collect();
    assert_eq!(items, BTreeSet::from(["A".to_string(), "B".to_string()]));
}

#[tokio::test]
async fn test_exhausted_sink_retries_end_run() {
    let transport = InMemoryTransport::new();
    let sink = RecordingSink {
        failures: Arc::new(Mutex::new(10)),
        ..Default::default()
    };
    let driver = join(&transport, Duration::from_secs(60)).await;

    transport.publish(SUBJECT, payload("A", 3, 10.0, 1)).await.unwrap();

    let pipeline = Pipeline::new(1, Aggregator::default(), sink.clone(), fast_retry(3)).unwrap();
    let health = pipeline.health();
    let Err(err) = driver.run(pipeline, CancellationToken::new()).await else {
        panic!("exhausted retries should end the run with an error");
    };
    assert!(matches!(err, AggregatorError::SinkExhausted { attempts: 3, .. }));
    assert!(sink.writes().is_empty());

    let snapshot = health.snapshot(now_epoch_secs(), 300);
    assert_eq!(snapshot.status, HealthStatus::SinkFailing);
    assert!(snapshot.pending_secs.is_some());
    assert!(snapshot.last_message_secs_ago.is_some());
    drop(transport);
}

#[tokio::test]
async fn test_competing_drivers_split_messages() {
    let transport = InMemoryTransport::new();
    let first_sink = RecordingSink::default();
    let second_sink = RecordingSink::default();

    let first = join(&transport, Duration::from_secs(60)).await;
    let second = join(&transport, Duration::from_secs(60)).await;

    let shutdown = CancellationToken::new();
    let first_handle =
        tokio::spawn(first.run(pipeline(1000, first_sink.clone()), shutdown.clone()));
    let second_handle =
        tokio::spawn(second.run(pipeline(1000, second_sink.clone()), shutdown.clone()));

    for i in 0..10 {
        transport
            .publish(SUBJECT, payload(&format!("ITEM_{}", i), 3, 10.0, 1))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    shutdown.cancel();
    let first_pipeline = first_handle.await.unwrap().unwrap();
    let second_pipeline = second_handle.await.unwrap().unwrap();
    assert_eq!(first_pipeline.stats().accepted, 5);
    assert_eq!(second_pipeline.stats().accepted, 5);

    let first_items: BTreeSet<String> = first_sink.items().into_iter().collect();
    let second_items: BTreeSet<String> = second_sink.items().into_iter().collect();
    assert!(first_items.is_disjoint(&second_items));
    assert_eq!(first_items.len() + second_items.len(), 10);
}

fn parquet_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map_or(false, |ext| ext == "parquet"))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_parquet_output_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("market_summary");
    let sink = ParquetSink::new(base.clone(), 3).unwrap();

    let transport = InMemoryTransport::new();
    let driver = join(&transport, Duration::from_secs(60)).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(driver.run(pipeline(2, sink), shutdown.clone()));

    transport.publish(SUBJECT, payload("T4_BAG", 4, 100.0, 2)).await.unwrap();
    transport.publish(SUBJECT, payload("T4_BAG", 1, 50.0, 5)).await.unwrap();

    let partition = base.join("item_id=T4_BAG");
    wait_for("partition file", || parquet_files(&partition).len() == 1).await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let files = parquet_files(&partition);
    assert_eq!(files.len(), 1);

    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&files[0]).unwrap())
        .unwrap()
        .build()
        .unwrap();
    let batches: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
    let prices = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    let volumes = batches[0]
        .column(1)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .unwrap();
    assert_eq!(prices.value(0), 50.0);
    assert_eq!(volumes.value(0), 2);
}
