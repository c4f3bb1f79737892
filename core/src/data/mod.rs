//! Streaming input for pairwise training.
//!
//! # Components
//!
//! - [`PairIndex`]: the labeled pair corpus, item adjacency and directional lookup.
//! - [`BatchSampler`]: an endless stream of [`Batch`]es drawn proportionally to pair-degree.
//! - [`build_label_matrices`]: dense `[B, B, G]` label / confidence matrices for a batch.
//! - [`QueuePipeline`]: producer threads that sample, load and enqueue [`QueueEntry`]s into a
//!   bounded queue until the configured number of epochs has been produced.
//! - [`ItemLoader`]: where item tensors come from.

pub mod items;
pub mod labels;
pub mod pairs;
pub mod pipeline;
pub mod sampler;

pub use items::{ItemLoader, RawItemLoader, SyntheticItemLoader};
pub use labels::build_label_matrices;
pub use pairs::{PairIndex, PairIndexBuilder, PairLabels};
pub use pipeline::{PipelineConfig, PipelineStats, QueueEntry, QueuePipeline, WorkerState};
pub use sampler::{BatchSampler, FAIRNESS_RATIO_BOUND, SamplerConfig, SamplingStats};

/// Dense index of an item inside a [`PairIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(u32);

impl ItemId {
    pub(crate) fn from_index(index: usize) -> Self {
        ItemId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An ordered set of distinct items, exactly one replica batch long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    items: Vec<ItemId>,
}

impl Batch {
    pub(crate) fn new(items: Vec<ItemId>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[ItemId] {
        &self.items
    }
}

impl From<Vec<ItemId>> for Batch {
    fn from(items: Vec<ItemId>) -> Self {
        Batch::new(items)
    }
}
