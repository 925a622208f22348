//! Differential expression between groups of cells: Wilcoxon rank-sum marker detection,
//! conserved markers across conditions and p-value adjustment.

/// markers conserved across grouping levels
pub mod conserved;
/// p-value helpers
pub mod dist;
/// two-group and one-vs-rest marker tests
pub mod markers;
/// rank-sum test
pub mod wilcoxon;

pub use crate::conserved::{find_conserved_markers, ConservedMarker};
pub use crate::dist::{adjust_bh, adjust_bonferroni};
pub use crate::markers::{find_all_markers, find_markers, Expression, MarkerParams, MarkerRow};
pub use crate::wilcoxon::{wilcoxon_rank_sum, wilcoxon_rank_sum_sparse, RankSumTest};
