//! Approximate reconciliation tree.
//!
//! A fixed-depth alternative to the Merkle exchange: the summarised interval
//! is bisected a fixed number of times, and each level stores one Bloom
//! filter over the content hashes of its sub-arcs. The sub-arcs are derived
//! from the interval alone, never from item counts, so two summaries of the
//! same interval line up position by position no matter how many items either
//! side holds; comparison walks the bisection down to the remote summary's
//! own depth. Absence from the remote level filter marks a subtree divergent.
//! False positives prune real differences, so reconciliation is approximate.

use serde::{Deserialize, Serialize};

use crate::bloom::BloomFilter;
use crate::interval::Interval;
use crate::keys::RingKey;
use crate::merkle::{leaf_hash, MerkleError, NodeHash};

/// Items a deepest-level arc aims to hold when sizing the depth.
const LEAF_TARGET: usize = 16;

/// Hard cap on the bisection depth.
const MAX_DEPTH: usize = 16;

/// Filter sizing for the level filters.
#[derive(Debug, Clone, Copy)]
pub struct ArtConfig {
    /// False-positive rate of inner-level filters.
    pub inner_fpr: f64,
    /// False-positive rate of the deepest (leaf) level filter.
    pub leaf_fpr: f64,
    /// Multiplier on the expected item count of every level filter, to
    /// compensate for error compounding across levels.
    pub correction_factor: f64,
}

impl Default for ArtConfig {
    fn default() -> Self {
        ArtConfig {
            inner_fpr: 0.01,
            leaf_fpr: 0.1,
            correction_factor: 2.0,
        }
    }
}

/// One Bloom filter per bisection level, root level first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Art {
    interval: Interval,
    levels: Vec<BloomFilter>,
}

impl Art {
    /// Summarise `items` (keys with their content hashes) of `interval`.
    ///
    /// The item count picks the single depth number; every leaf sits at that
    /// same depth, and the arcs of a level are a pure function of the
    /// interval.
    pub fn build(
        interval: Interval,
        items: &[(RingKey, NodeHash)],
        config: ArtConfig,
        seed: u64,
    ) -> Result<Art, MerkleError> {
        if interval.is_empty() {
            return Err(MerkleError::EmptyInterval);
        }
        let depth = fixed_depth(items.len());
        let mut levels = Vec::with_capacity(depth + 1);
        let mut arcs = vec![interval];
        for level in 0..=depth {
            let fpr = if level == depth {
                config.leaf_fpr
            } else {
                config.inner_fpr
            };
            let expected = ((arcs.len() as f64) * config.correction_factor).ceil() as usize;
            let mut filter = BloomFilter::new(expected.max(1), fpr, seed ^ level as u64);
            for arc in &arcs {
                filter.add(subset_hash(items, arc));
            }
            levels.push(filter);
            if level < depth {
                arcs = bisect(&arcs);
            }
        }
        Ok(Art { interval, levels })
    }

    /// The interval the summary covers.
    pub fn interval(&self) -> &Interval {
        &self.interval
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// The level filters, root level first.
    pub fn levels(&self) -> &[BloomFilter] {
        &self.levels
    }

    /// Walk local `items` of the same `interval` against this (remote)
    /// summary and return the deepest arcs whose content is not covered by
    /// the remote filters.
    ///
    /// No false negatives at the filter level means a reported arc really
    /// differs from the remote summary; a false positive hides a real
    /// difference, which is the accepted approximation.
    pub fn diff_against(
        &self,
        interval: &Interval,
        items: &[(RingKey, NodeHash)],
    ) -> Result<Vec<Interval>, MerkleError> {
        if *interval != self.interval {
            return Err(MerkleError::IntervalMismatch);
        }
        let mut out = Vec::new();
        self.walk(self.interval, 0, items, &mut out);
        Ok(out)
    }

    fn walk(
        &self,
        arc: Interval,
        level: usize,
        items: &[(RingKey, NodeHash)],
        out: &mut Vec<Interval>,
    ) {
        let covered = self
            .levels
            .get(level)
            .map(|filter| filter.contains(subset_hash(items, &arc)))
            .unwrap_or(false);
        if covered {
            return;
        }
        if level + 1 >= self.levels.len() {
            out.push(arc);
            return;
        }
        for child in arc.partition(2) {
            if !child.is_empty() {
                self.walk(child, level + 1, items, out);
            }
        }
    }
}

/// Fixed bisection depth for an item count: enough levels to bring the
/// deepest arcs down to roughly [`LEAF_TARGET`] items each.
fn fixed_depth(n: usize) -> usize {
    let leaves = n.div_ceil(LEAF_TARGET).max(1);
    (leaves.next_power_of_two().trailing_zeros() as usize).min(MAX_DEPTH)
}

fn bisect(arcs: &[Interval]) -> Vec<Interval> {
    arcs.iter()
        .flat_map(|arc| arc.partition(2))
        .filter(|arc| !arc.is_empty())
        .collect()
}

/// Content hash of the items falling into `arc`: the leaf hash of the
/// key-sorted subset, so both sides hash identical content identically.
fn subset_hash(items: &[(RingKey, NodeHash)], arc: &Interval) -> NodeHash {
    let subset: Vec<(RingKey, NodeHash)> = items
        .iter()
        .filter(|(key, _)| arc.contains(*key))
        .copied()
        .collect();
    leaf_hash(&subset)
}
