use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Float64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::AggregateRow;
use crate::error::SinkError;
use crate::sink::{partition_dir_name, PartitionFile, PartitionSink, SinkReport};

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Writes each aggregate row as a zstd-compressed Parquet file under a
/// Hive-style `item_id=<key>` directory.
///
/// The partition value lives in the directory name; files carry only
/// `avg_price` and `volume`.
pub struct ParquetSink {
    base_path: PathBuf,
    compression: Compression,
    schema: SchemaRef,
}

impl ParquetSink {
    pub fn new(base_path: PathBuf, zstd_level: i32) -> Result<Self, SinkError> {
        let level = ZstdLevel::try_new(zstd_level)?;
        Ok(Self {
            base_path,
            compression: Compression::ZSTD(level),
            schema: summary_schema(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn writer_properties(&self, item_id: &str, write_id: &str, now: DateTime<Utc>) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(self.compression)
            .set_statistics_enabled(EnabledStatistics::Chunk)
            .set_created_by("market-aggregator".to_string())
            .set_key_value_metadata(Some(vec![
                KeyValue::new("market_summary.item_id".to_string(), item_id.to_string()),
                KeyValue::new("market_summary.write_id".to_string(), write_id.to_string()),
                KeyValue::new("market_summary.written_at".to_string(), now.to_rfc3339()),
            ]))
            .build()
    }

    /// Write one row to a `.tmp` file next to its final location.
    ///
    /// The tmp file is removed again if any step fails.
    fn stage_partition(
        &self,
        row: &AggregateRow,
        write_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StagedFile, SinkError> {
        let dir = self.base_path.join(partition_dir_name(&row.item_id));
        fs::create_dir_all(&dir)?;

        let filename = format!("part-{}.parquet", write_id);
        let tmp_path = dir.join(format!("{}.tmp", filename));
        let final_path = dir.join(&filename);

        let batch = RecordBatch::try_new(
            Arc::clone(&self.schema),
            vec![
                Arc::new(Float64Array::from(vec![row.avg_price])),
                Arc::new(UInt64Array::from(vec![row.volume])),
            ],
        )?;

        let written = self.write_file(&tmp_path, &batch, &row.item_id, write_id, now);
        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                remove_quietly(&tmp_path);
                return Err(e);
            }
        };

        Ok(StagedFile {
            item_id: row.item_id.clone(),
            tmp_path,
            final_path,
            rows: batch.num_rows() as u64,
            bytes,
        })
    }

    fn write_file(
        &self,
        path: &Path,
        batch: &RecordBatch,
        item_id: &str,
        write_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, SinkError> {
        let file = File::create(path)?;
        let props = self.writer_properties(item_id, write_id, now);
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;
        Ok(fs::metadata(path)?.len())
    }
}

/// A fully written partition file still under its `.tmp` name.
struct StagedFile {
    item_id: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    rows: u64,
    bytes: u64,
}

impl StagedFile {
    fn into_partition_file(self) -> PartitionFile {
        PartitionFile {
            item_id: self.item_id,
            path: self.final_path,
            rows: self.rows,
            bytes: self.bytes,
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove partial partition file");
        }
    }
}

/// Rename every staged file to its final name, or leave none of them.
fn commit(staged: Vec<StagedFile>) -> Result<Vec<PartitionFile>, SinkError> {
    for (i, file) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(&file.tmp_path, &file.final_path) {
            for done in &staged[..i] {
                remove_quietly(&done.final_path);
            }
            for pending in &staged[i..] {
                remove_quietly(&pending.tmp_path);
            }
            return Err(e.into());
        }
        debug!(item_id = %file.item_id, path = ?file.final_path, bytes = file.bytes, "Wrote partition file");
    }
    Ok(staged.into_iter().map(StagedFile::into_partition_file).collect())
}

impl PartitionSink for ParquetSink {
    /// Either every partition file of the batch becomes visible or none does.
    fn write(&mut self, rows: &[AggregateRow]) -> Result<SinkReport, SinkError> {
        if rows.is_empty() {
            return Ok(SinkReport::default());
        }

        let now = Utc::now();
        let write_id = format!("{}-{}", now.format("%Y%m%dT%H%M%S%.3fZ"), Uuid::new_v4().simple());

        let mut staged = Vec::with_capacity(rows.len());
        for row in rows {
            match self.stage_partition(row, &write_id, now) {
                Ok(file) => staged.push(file),
                Err(e) => {
                    for file in &staged {
                        remove_quietly(&file.tmp_path);
                    }
                    warn!(
                        write_id = %write_id,
                        item_id = %row.item_id,
                        error = %e,
                        discarded = staged.len(),
                        "Partition write failed, discarded staged files"
                    );
                    return Err(e);
                }
            }
        }

        let report = SinkReport {
            files: commit(staged)?,
            write_id: Some(write_id),
        };
        info!(
            write_id = ?report.write_id,
            partitions = report.files.len(),
            bytes = report.bytes(),
            "Wrote summary partitions"
        );
        Ok(report)
    }
}

/// Arrow schema of one partition file.
pub fn summary_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("avg_price", DataType::Float64, false),
        Field::new("volume", DataType::UInt64, false),
    ]))
}
