//! Per-tensor activation statistics

use crate::{ImatrixError, Result};
use std::collections::HashMap;
use tracing::warn;

/// Running second-moment statistics for one weight tensor.
///
/// Cells are laid out expert-major: cell `e * n_features + j` holds feature
/// `j` of expert `e`. Non-routed tensors have a single expert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    /// Last observed row per expert (diagnostic snapshot)
    pub(crate) activations: Vec<f32>,
    /// Running sum of squares per cell
    pub(crate) values: Vec<f32>,
    /// Running sample count per cell
    pub(crate) counts: Vec<u32>,
    /// Collection events folded into this record
    pub(crate) ncall: u32,
    /// Expert count recorded at first observation
    pub(crate) n_as: usize,
}

impl Stats {
    /// Zeroed record for `n_features` features across `n_as` experts.
    pub fn new(n_features: usize, n_as: usize) -> Self {
        let len = n_features * n_as;
        Self {
            activations: vec![0.0; len],
            values: vec![0.0; len],
            counts: vec![0; len],
            ncall: 0,
            n_as,
        }
    }

    /// Last observed raw values.
    pub fn activations(&self) -> &[f32] {
        &self.activations
    }

    /// Sums of squares.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Sample counts.
    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    /// Collection events folded into this record.
    pub fn ncall(&self) -> u32 {
        self.ncall
    }

    /// Expert count.
    pub fn n_as(&self) -> usize {
        self.n_as
    }

    /// Number of cells (features x experts).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the record holds no cells yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean of squares for cell `i`, `None` while uncounted.
    pub fn mean(&self, i: usize) -> Option<f32> {
        match self.counts.get(i)? {
            0 => None,
            &c => Some(self.values[i] / c as f32),
        }
    }

    /// Number of cells that never received a sample.
    pub fn zero_count_cells(&self) -> usize {
        self.counts.iter().filter(|&&c| c == 0).count()
    }

    /// Experts none of whose cells received a sample.
    pub fn uncovered_experts(&self) -> Vec<usize> {
        if self.n_as == 0 || self.counts.len() % self.n_as != 0 {
            return Vec::new();
        }
        let per_expert = self.counts.len() / self.n_as;
        if per_expert == 0 {
            return Vec::new();
        }
        self.counts
            .chunks_exact(per_expert)
            .enumerate()
            .filter(|(_, cells)| cells.iter().all(|&c| c == 0))
            .map(|(e, _)| e)
            .collect()
    }

    /// Expert-by-feature view over this record.
    ///
    /// Fails when the record does not split into rows of `n_features`.
    pub fn expert_view(&mut self, n_features: usize) -> Option<ExpertView<'_>> {
        if n_features == 0 || self.values.len() % n_features != 0 {
            return None;
        }
        let n_experts = self.values.len() / n_features;
        Some(ExpertView {
            stats: self,
            n_features,
            n_experts,
        })
    }
}

/// Why a row could not be folded into an [`ExpertView`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellFault {
    /// Expert index past the last slot
    OutOfRange { expert: usize },
    /// Cell stopped being finite; earlier features of the row were applied
    NonFinite { feature: usize, value: f32 },
}

/// Bounds-checked 2-D (expert x feature) access to a [`Stats`] record.
///
/// The feature width is checked once when the view is created; every later
/// access only has to check the expert index.
pub struct ExpertView<'a> {
    stats: &'a mut Stats,
    n_features: usize,
    n_experts: usize,
}

impl ExpertView<'_> {
    /// Features per expert.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Expert slots.
    pub fn n_experts(&self) -> usize {
        self.n_experts
    }

    /// Fold one row into expert `expert`.
    ///
    /// Overwrites the activation snapshot, adds squares and bumps counts.
    pub fn accumulate<I>(&mut self, expert: usize, row: I) -> std::result::Result<(), CellFault>
    where
        I: IntoIterator<Item = f32>,
    {
        if expert >= self.n_experts {
            return Err(CellFault::OutOfRange { expert });
        }
        let range = expert * self.n_features..(expert + 1) * self.n_features;
        let activations = &mut self.stats.activations[range.clone()];
        let values = &mut self.stats.values[range.clone()];
        let counts = &mut self.stats.counts[range];

        for (j, x) in row.into_iter().take(self.n_features).enumerate() {
            activations[j] = x;
            values[j] += x * x;
            counts[j] += 1;
            if !values[j].is_finite() {
                return Err(CellFault::NonFinite {
                    feature: j,
                    value: values[j],
                });
            }
        }
        Ok(())
    }
}

/// Owner of every [`Stats`] record, keyed by canonical tensor name.
#[derive(Debug, Clone, Default)]
pub struct StatsStore {
    records: HashMap<String, Stats>,
}

impl StatsStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record for `name`.
    pub fn get(&self, name: &str) -> Option<&Stats> {
        self.records.get(name)
    }

    /// Iterate over all records in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Stats)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Record names in lexical order.
    pub fn sorted_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.records.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Record for an observation of `n_features` x `n_as` cells.
    ///
    /// Creates the record on first sight. A cell-count change is an error;
    /// an expert-count change with the same cell count is only logged.
    pub fn observe(&mut self, name: &str, n_features: usize, n_as: usize) -> Result<&mut Stats> {
        let len = n_features * n_as;
        let stats = self
            .records
            .entry(name.to_string())
            .or_insert_with(|| Stats::new(n_features, n_as));

        if stats.values.is_empty() {
            *stats = Stats {
                ncall: stats.ncall,
                ..Stats::new(n_features, n_as)
            };
        } else if stats.values.len() != len {
            return Err(ImatrixError::ShapeMismatch {
                name: name.to_string(),
                expected: stats.values.len(),
                actual: len,
            });
        } else if stats.n_as != n_as {
            warn!(
                "inconsistent n_as for {} ({} vs {})",
                name, stats.n_as, n_as
            );
        }

        Ok(stats)
    }

    /// Record for `name` holding `len` cells, created as non-routed if absent.
    pub(crate) fn get_or_insert(&mut self, name: &str, len: usize) -> &mut Stats {
        self.records
            .entry(name.to_string())
            .or_insert_with(|| Stats::new(len, 1))
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, name: &str, stats: Stats) {
        self.records.insert(name.to_string(), stats);
    }
}
