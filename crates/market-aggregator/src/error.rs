use thiserror::Error;

use market_middleware::TransportError;

/// Why an inbound payload was rejected. Rejected payloads never reach a batch.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("item_id is empty")]
    EmptyItemId,

    #[error("quality {0} outside 1..=5")]
    QualityOutOfRange(i64),

    #[error("price {0} is negative or not finite")]
    InvalidPrice(f64),

    #[error("amount {0} must be positive")]
    NonPositiveAmount(i64),
}

impl DecodeError {
    /// Stable label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::EmptyItemId => "empty_item_id",
            DecodeError::QualityOutOfRange(_) => "quality_out_of_range",
            DecodeError::InvalidPrice(_) => "invalid_price",
            DecodeError::NonPositiveAmount(_) => "non_positive_amount",
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sink error after {attempts} attempt(s): {source}")]
    SinkExhausted {
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("Aggregation task failed: {0}")]
    Task(String),
}
