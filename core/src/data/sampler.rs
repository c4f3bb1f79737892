//! Degree-weighted batch sampling.
//!
//! Every item gets a **quota**: its pair-degree clamped to `[1, QUOTA_CAP_FACTOR x m]`, where
//! `m` is the median degree (at least 1). A batch is assembled by alternating two draws until it
//! holds `B` distinct items:
//!
//! 1. an **anchor**, drawn with probability proportional to its weight in a [`WeightTree`];
//! 2. one of the anchor's **partners**, or a fresh weighted draw when the anchor has no usable
//!    partner.
//!
//! Without replacement, every item starts a pass with its quota as budget, each admission spends
//! one unit, and the pass ends when all budgets are spent. Per pass an item therefore appears
//! about `quota` times, which bounds `max / median` frequency by `QUOTA_CAP_FACTOR` on any corpus.
//!
//! With replacement the weights stay fixed. A uniformly drawn partner `j` is kept with
//! probability `quota(j) / deg(j)`, so the partner draw reaches `j` at most as often as the
//! anchor draw does. A hub item paired with most of the corpus is thus sampled no more than
//! `2 x QUOTA_CAP_FACTOR` times as often as the median item.
//!
//! Items without partners keep a quota of 1: they remain sampleable, but are drawn far less
//! often than items with several partners. [`SamplingStats`] measures all of this.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Batch, ItemId, PairIndex};
use crate::error::DataError;

/// Upper bound on `max / median` per-item sampling frequency, measured over at least 1000
/// batches. Holds for every corpus, hub items included.
pub const FAIRNESS_RATIO_BOUND: f64 = 4.0;

/// Largest quota as a multiple of the median degree.
pub const QUOTA_CAP_FACTOR: u64 = 2;

/// Anchor/partner rounds allowed per batch before the remainder is filled from open budgets.
const RETRY_FACTOR: usize = 16;

/// Sampling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub batch_size: usize,
    /// Draw from fixed quota weights forever instead of spending per-pass budgets.
    pub with_replacement: bool,
    pub seed: u64,
}

impl SamplerConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            with_replacement: false,
            seed: 0,
        }
    }
}

/// Endless, restartable stream of batches over a shared [`PairIndex`].
pub struct BatchSampler {
    index: Arc<PairIndex>,
    config: SamplerConfig,
    rng: StdRng,
    quotas: Vec<u64>,
    budget: WeightTree,
    epoch: u64,
    batches: u64,
}

impl BatchSampler {
    /// Fails with [`DataError::InsufficientData`] when the corpus cannot fill one batch.
    pub fn new(index: Arc<PairIndex>, config: SamplerConfig) -> Result<Self, DataError> {
        if config.batch_size == 0 || index.len() < config.batch_size {
            return Err(DataError::InsufficientData {
                available: index.len(),
                required: config.batch_size.max(1),
            });
        }

        let quotas = quotas(&index);
        debug!(
            items = index.len(),
            max_quota = quotas.iter().copied().max().unwrap_or(0),
            "sampler quotas computed"
        );
        Ok(Self {
            budget: WeightTree::new(&quotas),
            rng: StdRng::seed_from_u64(config.seed),
            quotas,
            index,
            config,
            epoch: 0,
            batches: 0,
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Per-pass quota of an item.
    pub fn quota(&self, id: ItemId) -> u64 {
        self.quotas.get(id.index()).copied().unwrap_or(0)
    }

    /// Completed passes. Without replacement a pass ends when every budget is spent;
    /// with replacement it is every `len / B` batches.
    pub fn epoch(&self) -> u64 {
        if self.config.with_replacement {
            let per_epoch = (self.index.len() / self.config.batch_size).max(1) as u64;
            self.batches / per_epoch
        } else {
            self.epoch
        }
    }

    /// Number of batches produced since construction or the last [`BatchSampler::reset`].
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Restarts the stream from the configured seed.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.budget = WeightTree::new(&self.quotas);
        self.epoch = 0;
        self.batches = 0;
    }

    /// Draws the next batch of exactly `batch_size` distinct items.
    pub fn next_batch(&mut self) -> Batch {
        let b = self.config.batch_size;
        let mut members = Vec::with_capacity(b);
        let mut seen = HashSet::with_capacity(b);

        let mut rounds = 0;
        while members.len() < b && rounds < RETRY_FACTOR * b {
            rounds += 1;
            let anchor = self.draw_weighted();
            self.admit(anchor, &mut members, &mut seen);
            if members.len() == b {
                break;
            }
            let partner = self.draw_partner(anchor);
            self.admit(partner, &mut members, &mut seen);
        }

        if members.len() < b {
            // Items with open budget first, so the fill does not skew the pass.
            let (mut open, mut spent): (Vec<ItemId>, Vec<ItemId>) = self
                .index
                .item_ids()
                .filter(|id| !seen.contains(id))
                .partition(|id| self.config.with_replacement || self.budget.weight(id.index()) > 0);
            open.shuffle(&mut self.rng);
            spent.shuffle(&mut self.rng);
            let missing = b - members.len();
            for id in open.into_iter().chain(spent).take(missing) {
                self.admit(id, &mut members, &mut seen);
            }
        }

        self.batches += 1;
        Batch::new(members)
    }

    fn admit(&mut self, id: ItemId, members: &mut Vec<ItemId>, seen: &mut HashSet<ItemId>) {
        if !seen.insert(id) {
            return;
        }
        members.push(id);
        if !self.config.with_replacement {
            let w = self.budget.weight(id.index());
            if w > 0 {
                self.budget.set(id.index(), w - 1);
            }
        }
    }

    fn draw_weighted(&mut self) -> ItemId {
        if self.budget.total() == 0 && !self.config.with_replacement {
            self.budget = WeightTree::new(&self.quotas);
            self.epoch += 1;
            debug!(epoch = self.epoch, "sampler pass complete, budgets refilled");
        }

        let total = self.budget.total();
        if total == 0 {
            return ItemId::from_index(self.rng.random_range(0..self.index.len()));
        }
        let target = self.rng.random_range(0..total);
        ItemId::from_index(self.budget.find(target))
    }

    fn draw_partner(&mut self, anchor: ItemId) -> ItemId {
        let partners = self.index.partners(anchor);
        let pick = if self.config.with_replacement {
            if partners.is_empty() {
                None
            } else {
                let candidate = partners[self.rng.random_range(0..partners.len())];
                let degree = self.index.degree(candidate) as u64;
                let quota = self.quota(candidate);
                (self.rng.random_range(0..degree.max(1)) < quota).then_some(candidate)
            }
        } else {
            let open: Vec<ItemId> = partners
                .iter()
                .copied()
                .filter(|p| self.budget.weight(p.index()) > 0)
                .collect();
            (!open.is_empty()).then(|| open[self.rng.random_range(0..open.len())])
        };
        match pick {
            Some(id) => id,
            None => self.draw_weighted(),
        }
    }
}

impl Iterator for BatchSampler {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        Some(self.next_batch())
    }
}

/// Degree clamped to `[1, QUOTA_CAP_FACTOR x max(1, median degree)]`.
fn quotas(index: &PairIndex) -> Vec<u64> {
    let degrees: Vec<u64> = index.item_ids().map(|id| index.degree(id) as u64).collect();
    let mut sorted = degrees.clone();
    sorted.sort_unstable();
    let median = sorted.get(sorted.len() / 2).copied().unwrap_or(0).max(1);
    let cap = QUOTA_CAP_FACTOR * median;
    degrees.into_iter().map(|d| d.clamp(1, cap)).collect()
}

/// Fenwick tree over non-negative integer weights: O(log n) update and weighted search.
#[derive(Debug, Clone)]
struct WeightTree {
    tree: Vec<u64>,
    weights: Vec<u64>,
    total: u64,
}

impl WeightTree {
    fn new(weights: &[u64]) -> Self {
        let n = weights.len();
        let mut tree = vec![0u64; n + 1];
        for (i, &w) in weights.iter().enumerate() {
            let mut k = i + 1;
            tree[k] += w;
            let parent = k + (k & k.wrapping_neg());
            if parent <= n {
                let carry = tree[k];
                k = parent;
                tree[k] += carry;
            }
        }
        Self {
            tree,
            weights: weights.to_vec(),
            total: weights.iter().sum(),
        }
    }

    fn total(&self) -> u64 {
        self.total
    }

    fn weight(&self, i: usize) -> u64 {
        self.weights[i]
    }

    fn set(&mut self, i: usize, w: u64) {
        let old = self.weights[i];
        self.weights[i] = w;
        self.total = self.total - old + w;

        let n = self.weights.len();
        let mut k = i + 1;
        while k <= n {
            self.tree[k] = self.tree[k] - old + w;
            k += k & k.wrapping_neg();
        }
    }

    /// Smallest index whose inclusive prefix sum exceeds `target`. Requires `target < total`.
    fn find(&self, mut target: u64) -> usize {
        let n = self.weights.len();
        let mut pos = 0;
        let mut step = if n == 0 { 0 } else { 1 << (usize::BITS - 1 - n.leading_zeros()) };
        while step > 0 {
            let next = pos + step;
            if next <= n && self.tree[next] <= target {
                pos = next;
                target -= self.tree[next];
            }
            step >>= 1;
        }
        pos
    }
}

/// Per-item sampling frequencies accumulated over many batches.
#[derive(Debug, Clone)]
pub struct SamplingStats {
    counts: Vec<u64>,
    batches: u64,
}

impl SamplingStats {
    pub fn new(items: usize) -> Self {
        Self {
            counts: vec![0; items],
            batches: 0,
        }
    }

    pub fn record(&mut self, batch: &Batch) {
        self.batches += 1;
        for id in batch.items() {
            if let Some(c) = self.counts.get_mut(id.index()) {
                *c += 1;
            }
        }
    }

    pub fn count(&self, id: ItemId) -> u64 {
        self.counts.get(id.index()).copied().unwrap_or(0)
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn median(&self) -> f64 {
        if self.counts.is_empty() {
            return 0.0;
        }
        let mut sorted = self.counts.clone();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
        } else {
            sorted[mid] as f64
        }
    }

    /// `max / median` of per-item counts; infinite when the median item was never drawn.
    pub fn max_median_ratio(&self) -> f64 {
        let max = self.counts.iter().copied().max().unwrap_or(0) as f64;
        let median = self.median();
        if median == 0.0 {
            return f64::INFINITY;
        }
        max / median
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(n: usize) -> Arc<PairIndex> {
        let mut builder = PairIndex::builder(1);
        for i in 0..n {
            builder
                .add_pair(&format!("i{i}"), &format!("i{}", (i + 1) % n), &[1.0], &[0.0])
                .unwrap();
        }
        Arc::new(builder.build())
    }

    #[test]
    fn test_weight_tree_find_matches_prefix_sums() {
        let tree = WeightTree::new(&[3, 0, 2, 5, 1]);
        assert_eq!(tree.total(), 11);
        let expected = [0, 0, 0, 2, 2, 3, 3, 3, 3, 3, 4];
        for (target, &want) in expected.iter().enumerate() {
            assert_eq!(tree.find(target as u64), want, "target {target}");
        }
    }

    #[test]
    fn test_weight_tree_updates() {
        let mut tree = WeightTree::new(&[1, 1, 1]);
        tree.set(0, 0);
        tree.set(2, 4);
        assert_eq!(tree.total(), 5);
        assert_eq!(tree.find(0), 1);
        assert_eq!(tree.find(1), 2);
        assert_eq!(tree.find(4), 2);
    }

    #[test]
    fn test_batches_have_exact_size_and_distinct_items() {
        let mut sampler = BatchSampler::new(ring(20), SamplerConfig::new(6)).unwrap();
        for batch in sampler.by_ref().take(200) {
            assert_eq!(batch.len(), 6);
            let unique: HashSet<_> = batch.items().iter().collect();
            assert_eq!(unique.len(), 6);
        }
    }

    #[test]
    fn test_batch_as_large_as_corpus_uses_every_item() {
        let mut sampler = BatchSampler::new(ring(5), SamplerConfig::new(5)).unwrap();
        let mut items = sampler.next_batch().items().to_vec();
        items.sort();
        assert_eq!(items, ring(5).item_ids().collect::<Vec<_>>());
    }

    #[test]
    fn test_too_small_corpus_is_rejected() {
        let err = BatchSampler::new(ring(3), SamplerConfig::new(4)).err();
        assert_eq!(
            err,
            Some(DataError::InsufficientData {
                available: 3,
                required: 4
            })
        );
    }

    #[test]
    fn test_reset_replays_the_same_stream() {
        let mut config = SamplerConfig::new(4);
        config.seed = 7;
        let mut sampler = BatchSampler::new(ring(12), config).unwrap();
        let first: Vec<Batch> = sampler.by_ref().take(10).collect();
        sampler.reset();
        let again: Vec<Batch> = sampler.by_ref().take(10).collect();
        assert_eq!(first, again);
        assert_eq!(sampler.batches(), 10);
    }

    #[test]
    fn test_passes_without_replacement_advance_epoch() {
        // Ring of 8: total degree 16, every batch spends at least its first anchor's unit.
        let mut sampler = BatchSampler::new(ring(8), SamplerConfig::new(4)).unwrap();
        assert_eq!(sampler.epoch(), 0);
        for _ in 0..40 {
            sampler.next_batch();
        }
        assert!(sampler.epoch() >= 1);
    }

    #[test]
    fn test_corpus_without_pairs_is_still_sampled() {
        let mut builder = PairIndex::builder(1);
        for name in ["a", "b", "c", "d"] {
            builder.add_item(name);
        }
        let index = Arc::new(builder.build());
        let mut stats = SamplingStats::new(index.len());
        let mut sampler = BatchSampler::new(index.clone(), SamplerConfig::new(2)).unwrap();
        for batch in sampler.by_ref().take(200) {
            stats.record(&batch);
        }
        assert!(index.item_ids().all(|id| stats.count(id) > 0));
    }

    #[test]
    fn test_quotas_clamp_hubs_and_isolated_items() {
        let mut builder = PairIndex::builder(1);
        for i in 1..=30 {
            builder.add_pair("hub", &format!("leaf{i}"), &[1.0], &[0.0]).unwrap();
        }
        for i in (1..=30).step_by(2) {
            builder
                .add_pair(&format!("leaf{i}"), &format!("leaf{}", i + 1), &[1.0], &[0.0])
                .unwrap();
        }
        builder.add_item("alone");
        let index = Arc::new(builder.build());
        let sampler = BatchSampler::new(Arc::clone(&index), SamplerConfig::new(4)).unwrap();

        // Leaves have degree 2, so the median is 2 and the cap is 4.
        assert_eq!(sampler.quota(index.item_id("hub").unwrap()), 4);
        assert_eq!(sampler.quota(index.item_id("leaf3").unwrap()), 2);
        assert_eq!(sampler.quota(index.item_id("alone").unwrap()), 1);
    }

    #[test]
    fn test_stats_ratio() {
        let mut stats = SamplingStats::new(3);
        stats.record(&Batch::new(vec![ItemId(0), ItemId(1)]));
        stats.record(&Batch::new(vec![ItemId(0), ItemId(2)]));
        assert_eq!(stats.median(), 1.0);
        assert_eq!(stats.max_median_ratio(), 2.0);
        assert_eq!(SamplingStats::new(2).max_median_ratio(), f64::INFINITY);
    }
}
