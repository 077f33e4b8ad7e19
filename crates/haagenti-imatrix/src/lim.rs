//! Layer importance (LIM) scoring
//!
//! For every tensor type, consecutive layers are compared through their
//! activation snapshots. A layer whose snapshot diverges from the next
//! layer's (low cosine similarity) transforms its input more, so the score
//! is the negated cosine similarity: `-1.0` for identical directions, `0.0`
//! for orthogonal ones.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::name::LayerName;
use crate::StatsStore;

/// Outcome of scoring one layer pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimScore {
    /// Negated cosine similarity
    Score(f64),
    /// Snapshot lengths differ
    DimensionMismatch { input: usize, output: usize },
    /// One of the snapshots is all zeros
    ZeroMagnitude,
}

impl LimScore {
    /// Score value, if one was computed.
    pub fn value(&self) -> Option<f64> {
        match self {
            LimScore::Score(s) => Some(*s),
            _ => None,
        }
    }
}

/// Score of a layer against the next layer of the same type.
#[derive(Debug, Clone, PartialEq)]
pub struct LimEntry {
    pub layer: u32,
    pub score: LimScore,
}

/// Scores of one tensor type.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupResult {
    /// Fewer than two layers
    Insufficient,
    /// One entry per layer except the last
    Scores(Vec<LimEntry>),
}

/// All layers of one tensor type.
#[derive(Debug, Clone, PartialEq)]
pub struct LimGroup {
    pub tensor_type: String,
    pub result: GroupResult,
}

/// Layer importance scores, grouped by tensor type in lexical order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimReport {
    pub groups: Vec<LimGroup>,
}

impl LimReport {
    /// Group for `tensor_type`.
    pub fn group(&self, tensor_type: &str) -> Option<&LimGroup> {
        self.groups.iter().find(|g| g.tensor_type == tensor_type)
    }

    /// Whether no tensor could be grouped.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Negated cosine similarity of two activation snapshots.
pub fn lim_score(input: &[f32], output: &[f32]) -> LimScore {
    if input.len() != output.len() {
        return LimScore::DimensionMismatch {
            input: input.len(),
            output: output.len(),
        };
    }

    let mut dot = 0.0f64;
    let mut in_sq = 0.0f64;
    let mut out_sq = 0.0f64;
    for (&a, &b) in input.iter().zip(output) {
        let (a, b) = (a as f64, b as f64);
        dot += a * b;
        in_sq += a * a;
        out_sq += b * b;
    }

    if in_sq == 0.0 || out_sq == 0.0 {
        return LimScore::ZeroMagnitude;
    }
    LimScore::Score(-(dot / (in_sq * out_sq).sqrt()))
}

/// Score every tensor type found in `store`.
///
/// Names that do not split into layer and type are left out.
pub fn analyze(store: &StatsStore) -> LimReport {
    let mut groups: BTreeMap<String, Vec<(u32, &[f32])>> = BTreeMap::new();
    for (name, stats) in store.iter() {
        match LayerName::parse(name) {
            Some(parsed) => groups
                .entry(parsed.tensor_type)
                .or_default()
                .push((parsed.layer, stats.activations())),
            None => debug!("lim: skipping {}", name),
        }
    }

    let groups = groups
        .into_iter()
        .map(|(tensor_type, mut layers)| {
            layers.sort_by_key(|&(layer, _)| layer);
            let result = if layers.len() < 2 {
                GroupResult::Insufficient
            } else {
                GroupResult::Scores(
                    layers
                        .windows(2)
                        .map(|pair| LimEntry {
                            layer: pair[0].0,
                            score: lim_score(pair[0].1, pair[1].1),
                        })
                        .collect(),
                )
            };
            LimGroup {
                tensor_type,
                result,
            }
        })
        .collect();

    LimReport { groups }
}

impl fmt::Display for LimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.groups.is_empty() {
            return writeln!(f, "no data collected - cannot compute LIM scores");
        }
        writeln!(f, "Computing Layer Importance Modification (LIM) Scores...")?;
        for group in &self.groups {
            writeln!(f)?;
            writeln!(f, "Tensor: {}", group.tensor_type)?;
            writeln!(f, "Layer\tLIM Score")?;
            writeln!(f, "-----\t---------")?;
            match &group.result {
                GroupResult::Insufficient => {
                    writeln!(f, "(Need at least 2 layers to compute LIM scores)")?;
                }
                GroupResult::Scores(entries) => {
                    for entry in entries {
                        match entry.score {
                            LimScore::Score(s) => writeln!(f, "{}\t{:.4}", entry.layer, s)?,
                            LimScore::DimensionMismatch { input, output } => writeln!(
                                f,
                                "{}\t(skipped - dimension mismatch: {} vs {})",
                                entry.layer, input, output
                            )?,
                            LimScore::ZeroMagnitude => {
                                writeln!(f, "{}\t(skipped - zero magnitude)", entry.layer)?
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;

    fn with_activations(activations: &[f32]) -> Stats {
        let mut stats = Stats::new(activations.len(), 1);
        stats.activations.copy_from_slice(activations);
        stats
    }

    #[test]
    fn test_identical_vectors() {
        assert_eq!(lim_score(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), LimScore::Score(-1.0));
        assert_eq!(lim_score(&[0.3, -7.1], &[0.3, -7.1]), LimScore::Score(-1.0));
    }

    #[test]
    fn test_orthogonal_vectors() {
        assert_eq!(lim_score(&[1.0, 0.0], &[0.0, 5.0]), LimScore::Score(0.0));
    }

    #[test]
    fn test_opposite_vectors() {
        let score = lim_score(&[1.0, 2.0], &[-2.0, -4.0]).value().unwrap();
        assert!((score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_skips() {
        assert_eq!(lim_score(&[0.0, 0.0], &[1.0, 1.0]), LimScore::ZeroMagnitude);
        assert_eq!(lim_score(&[1.0, 1.0], &[0.0, 0.0]), LimScore::ZeroMagnitude);
        assert_eq!(
            lim_score(&[1.0], &[1.0, 1.0]),
            LimScore::DimensionMismatch {
                input: 1,
                output: 2
            }
        );
    }

    #[test]
    fn test_analyze_groups_and_orders() {
        let mut store = StatsStore::new();
        store.insert("blk.10.ffn_up.weight", with_activations(&[0.0, 1.0]));
        store.insert("blk.2.ffn_up.weight", with_activations(&[1.0, 0.0]));
        store.insert("blk.1.ffn_up.weight", with_activations(&[1.0, 0.0]));
        store.insert("blk.0.attn_q.weight", with_activations(&[1.0, 1.0]));
        store.insert("output.weight", with_activations(&[1.0, 1.0]));

        let report = analyze(&store);
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].tensor_type, "attn_q");
        assert_eq!(report.groups[0].result, GroupResult::Insufficient);

        let ffn = report.group("ffn_up").unwrap();
        assert_eq!(
            ffn.result,
            GroupResult::Scores(vec![
                LimEntry {
                    layer: 1,
                    score: LimScore::Score(-1.0)
                },
                LimEntry {
                    layer: 2,
                    score: LimScore::Score(0.0)
                },
            ])
        );
    }

    #[test]
    fn test_report_rendering() {
        let mut store = StatsStore::new();
        store.insert("blk.0.attn_k.weight", with_activations(&[1.0, 0.0]));
        store.insert("blk.1.attn_k.weight", with_activations(&[0.0, 0.0]));
        store.insert("blk.2.attn_k.weight", with_activations(&[1.0]));
        store.insert("blk.0.ffn_down.weight", with_activations(&[2.0]));

        let text = analyze(&store).to_string();
        assert!(text.contains("Tensor: attn_k\nLayer\tLIM Score\n-----\t---------\n"));
        assert!(text.contains("0\t(skipped - zero magnitude)\n"));
        assert!(text.contains("1\t(skipped - dimension mismatch: 2 vs 1)\n"));
        assert!(text.contains("Tensor: ffn_down\nLayer\tLIM Score\n-----\t---------\n(Need at least 2 layers"));

        assert!(analyze(&StatsStore::new()).to_string().starts_with("no data collected"));
    }
}
