use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::event::MarketEvent;

/// An ordered group of events aggregated as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    events: Vec<MarketEvent>,
}

impl Batch {
    pub fn events(&self) -> &[MarketEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl From<Vec<MarketEvent>> for Batch {
    fn from(events: Vec<MarketEvent>) -> Self {
        Self { events }
    }
}

/// Buffers decoded events until `batch_size` is reached.
///
/// Not synchronized: a single task owns it and is the only caller of
/// [`append`](Self::append) and [`drain`](Self::drain).
#[derive(Debug)]
pub struct BatchAccumulator {
    events: Vec<MarketEvent>,
    batch_size: usize,
    /// Arrival time of the oldest pending event
    oldest: Option<Instant>,
}

/// Upper bound on the buffer allocated up front.
const MAX_PREALLOCATED: usize = 65_536;

impl BatchAccumulator {
    pub fn new(batch_size: NonZeroUsize) -> Self {
        let batch_size = batch_size.get();
        Self {
            events: Vec::with_capacity(batch_size.min(MAX_PREALLOCATED)),
            batch_size,
            oldest: None,
        }
    }

    /// Append one event. Returns true once the batch is full.
    pub fn append(&mut self, event: MarketEvent) -> bool {
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }
        self.events.push(event);
        self.is_full()
    }

    /// Take the pending events, leaving an empty buffer behind.
    pub fn drain(&mut self) -> Batch {
        self.oldest = None;
        let events = std::mem::replace(
            &mut self.events,
            Vec::with_capacity(self.batch_size.min(MAX_PREALLOCATED)),
        );
        Batch { events }
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.batch_size
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// How long the oldest pending event has been waiting, if any.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.oldest.map(|t| t.elapsed())
    }
}
