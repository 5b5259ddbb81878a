use std::path::PathBuf;

use crate::aggregator::AggregateRow;
use crate::error::SinkError;

/// Name of the partition column, used for the directory prefix.
pub const PARTITION_COLUMN: &str = "item_id";

/// One file produced by a sink write.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionFile {
    pub item_id: String,
    pub path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
}

/// Outcome of a successful [`PartitionSink::write`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkReport {
    /// Identifier shared by every file of this write; None for a no-op write
    pub write_id: Option<String>,
    pub files: Vec<PartitionFile>,
}

impl SinkReport {
    pub fn rows(&self) -> u64 {
        self.files.iter().map(|f| f.rows).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}

/// Destination for aggregate rows, physically partitioned by item.
///
/// Each call is an independent write: nothing is merged with what earlier
/// calls produced. An empty `rows` slice must succeed without side effects.
pub trait PartitionSink: Send {
    fn write(&mut self, rows: &[AggregateRow]) -> Result<SinkReport, SinkError>;
}

/// Directory name for one partition value, `item_id=<escaped>`.
///
/// Characters that are unsafe in a path segment are percent-encoded so that
/// no key can address a different directory.
pub fn partition_dir_name(item_id: &str) -> String {
    let escaped = match item_id {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => {
            let mut out = String::with_capacity(item_id.len());
            for c in item_id.chars() {
                match c {
                    '/' | '\\' | '%' | '=' => out.push_str(&format!("%{:02X}", c as u32)),
                    c if c.is_control() => {
                        let mut buf = [0u8; 4];
                        for b in c.encode_utf8(&mut buf).bytes() {
                            out.push_str(&format!("%{:02X}", b));
                        }
                    }
                    c => out.push(c),
                }
            }
            out
        }
    };
    format!("{}={}", PARTITION_COLUMN, escaped)
}
