use crate::dist::minimum_p;
use crate::markers::{find_markers, Expression, MarkerParams, MarkerRow};
use anyhow::{bail, Error};
use log::{info, warn};
use std::collections::HashMap;

/// A gene that is a marker of the same cluster in every evaluated grouping level.
#[derive(Clone, Debug, PartialEq)]
pub struct ConservedMarker {
    pub gene: String,
    /// `(level, marker statistics within that level)`, in level order
    pub levels: Vec<(String, MarkerRow)>,
    pub max_pval: f64,
    /// `1 - (1 - min p)^m` over the `m` levels
    pub minimump_p_val: f64,
}

impl ConservedMarker {
    /// Mean of the per-level average log2 fold changes.
    pub fn mean_log2fc(&self) -> f64 {
        self.levels.iter().map(|(_, r)| r.avg_log2fc).sum::<f64>() / self.levels.len() as f64
    }
}

/// Markers of cluster `ident` that hold within each level of `grouping` (e.g. the sample of
/// each cell). Within a level, the cells of `ident` are compared against the cells of every
/// other cluster. Levels where either side has fewer than `min_cells_group` cells are skipped.
/// Only genes reported in every evaluated level are returned, sorted by `minimump_p_val`.
pub fn find_conserved_markers(
    data: &Expression,
    cluster_labels: &[usize],
    ident: usize,
    grouping: &[String],
    params: &MarkerParams,
) -> Result<Vec<ConservedMarker>, Error> {
    if cluster_labels.len() != data.num_cells() || grouping.len() != data.num_cells() {
        bail!(
            "{} cluster labels and {} grouping labels for {} cells",
            cluster_labels.len(),
            grouping.len(),
            data.num_cells()
        );
    }

    let mut levels: Vec<&str> = Vec::new();
    for g in grouping {
        if !levels.contains(&g.as_str()) {
            levels.push(g.as_str());
        }
    }
    levels.sort_unstable();

    let mut per_level: Vec<(String, HashMap<String, MarkerRow>)> = Vec::new();
    let mut gene_order: Vec<String> = Vec::new();
    for level in levels {
        let (ident_cells, other_cells): (Vec<usize>, Vec<usize>) = (0..grouping.len())
            .filter(|&c| grouping[c] == level)
            .partition(|&c| cluster_labels[c] == ident);

        if ident_cells.len() < params.min_cells_group || other_cells.len() < params.min_cells_group {
            warn!(
                "{} has {} cells of cluster {} and {} other cells; skipping",
                level,
                ident_cells.len(),
                ident,
                other_cells.len()
            );
            continue;
        }

        let rows = find_markers(data, &ident_cells, &other_cells, params)?;
        info!("cluster {} in {}: {} markers", ident, level, rows.len());
        if per_level.is_empty() {
            gene_order = rows.iter().map(|r| r.gene.clone()).collect();
        }
        per_level.push((level.to_string(), rows.into_iter().map(|r| (r.gene.clone(), r)).collect()));
    }

    if per_level.is_empty() {
        bail!("no grouping level has enough cells to test cluster {}", ident);
    }

    let mut conserved: Vec<ConservedMarker> = gene_order
        .into_iter()
        .filter(|gene| per_level.iter().all(|(_, rows)| rows.contains_key(gene)))
        .map(|gene| {
            let levels: Vec<(String, MarkerRow)> = per_level
                .iter()
                .map(|(level, rows)| (level.clone(), rows[&gene].clone()))
                .collect();
            let pvals: Vec<f64> = levels.iter().map(|(_, r)| r.p_val).collect();
            ConservedMarker {
                max_pval: pvals.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                minimump_p_val: minimum_p(&pvals),
                gene,
                levels,
            }
        })
        .collect();

    conserved.sort_by(|a, b| {
        a.minimump_p_val
            .total_cmp(&b.minimump_p_val)
            .then(a.max_pval.total_cmp(&b.max_pval))
    });
    Ok(conserved)
}
