//! Per-item summary statistics over one batch.

use std::collections::HashMap;

use tracing::warn;

use crate::accumulator::Batch;
use crate::metrics;

/// Lowest quality tier included in the summary by default.
pub const DEFAULT_QUALITY_THRESHOLD: u8 = 3;

/// One summary row per item present (after filtering) in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub item_id: String,
    /// Mean unit price (price / amount) over the contributing events
    pub avg_price: f64,
    /// Total amount traded over the contributing events
    pub volume: u64,
}

#[derive(Default)]
struct GroupState {
    unit_price_sum: f64,
    count: u64,
    volume: u64,
}

/// Filters a batch by quality and groups it by item.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    quality_threshold: u8,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY_THRESHOLD)
    }
}

impl Aggregator {
    pub fn new(quality_threshold: u8) -> Self {
        Self { quality_threshold }
    }

    pub fn quality_threshold(&self) -> u8 {
        self.quality_threshold
    }

    /// Summarize `batch`. Rows come out in no particular order; items whose
    /// events are all filtered out produce no row.
    ///
    /// An event whose amount would push its item's volume past `u64::MAX` is
    /// left out of that row entirely (price and volume), so every emitted
    /// volume is the exact sum of the amounts that contributed to it.
    pub fn aggregate(&self, batch: &Batch) -> Vec<AggregateRow> {
        let mut groups: HashMap<&str, GroupState> = HashMap::new();

        for event in batch
            .events()
            .iter()
            .filter(|e| e.quality >= self.quality_threshold)
        {
            let group = groups.entry(event.item_id.as_str()).or_default();
            let Some(volume) = group.volume.checked_add(event.amount) else {
                metrics::inc_volume_overflow();
                warn!(
                    item_id = %event.item_id,
                    amount = event.amount,
                    volume = group.volume,
                    "Dropping event that would overflow item volume"
                );
                continue;
            };
            group.volume = volume;
            group.unit_price_sum += event.unit_price();
            group.count += 1;
        }

        groups
            .into_iter()
            .map(|(item_id, g)| AggregateRow {
                item_id: item_id.to_string(),
                avg_price: g.unit_price_sum / g.count as f64,
                volume: g.volume,
            })
            .collect()
    }
}
