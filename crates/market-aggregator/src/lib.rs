//! market-aggregator: NATS market orders to partitioned Parquet summaries
//!
//! Joins a queue group on the market order subject, decodes each JSON
//! payload, accumulates fixed-size batches and writes one zstd Parquet file
//! per item (average unit price and summed volume over quality >= 3 orders)
//! under `item_id=<key>` partition directories.

pub mod accumulator;
pub mod aggregator;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod health;
pub mod metrics;
pub mod parquet_sink;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod sink;

pub use accumulator::{Batch, BatchAccumulator};
pub use aggregator::{AggregateRow, Aggregator};
pub use config::Config;
pub use driver::{DriverSettings, SubscriptionDriver};
pub use error::{AggregatorError, DecodeError, SinkError};
pub use event::{decode, MarketEvent};
pub use health::{HealthSnapshot, HealthState, HealthStatus};
pub use parquet_sink::ParquetSink;
pub use pipeline::{FlushReport, FlushTrigger, Pipeline, PipelineStats};
pub use retry::RetryPolicy;
pub use sink::{PartitionFile, PartitionSink, SinkReport};
