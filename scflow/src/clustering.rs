//! Graph clustering of the shared-nearest-neighbor graph over a sweep of resolutions, and the
//! per-cluster tables used to judge the result.

use crate::stats::median;
use anyhow::{bail, Error};
use log::info;
use louvain::{Louvain, Network};
use serde::{Deserialize, Serialize};
use sc_types::CellRecord;
use sprs::CsMat;
use std::collections::BTreeMap;

pub const DEFAULT_RESOLUTIONS: [f64; 5] = [0.4, 0.6, 0.8, 1.0, 1.4];

/// Name under which the labels of resolution `r` are stored, e.g. `integrated_snn_res.0.8`.
pub fn resolution_key(resolution: f64) -> String {
    format!("integrated_snn_res.{}", resolution)
}

/// Louvain network of a symmetric SNN graph; every undirected edge is taken once.
pub fn snn_network(snn: &CsMat<f64>) -> Result<Network, Error> {
    if snn.rows() != snn.cols() {
        bail!("SNN graph must be square, got {:?}", snn.shape());
    }
    let edges = snn.iter().filter(|&(_, (i, j))| i < j).map(|(&w, (i, j))| (i, j, w));
    Network::from_edges(snn.rows(), edges)
}

/// Louvain labels at every resolution, keyed by `resolution_key`. Cluster 0 is the largest.
pub fn find_clusters(snn: &CsMat<f64>, resolutions: &[f64], seed: u64) -> Result<BTreeMap<String, Vec<usize>>, Error> {
    let network = snn_network(snn)?;
    let mut sweep = BTreeMap::new();
    for &r in resolutions {
        if r.is_nan() || r <= 0.0 {
            bail!("resolution must be positive, got {}", r);
        }
        let labels = Louvain::new(r, seed).run(&network).into_labels();
        let n_clusters = labels.iter().max().map_or(0, |&m| m + 1);
        info!("resolution {}: {} clusters over {} cells", r, n_clusters, labels.len());
        sweep.insert(resolution_key(r), labels);
    }
    Ok(sweep)
}

/// Copy the labels of `resolution` into the metadata.
pub fn set_idents(metadata: &mut [CellRecord], sweep: &BTreeMap<String, Vec<usize>>, resolution: f64) -> Result<(), Error> {
    let key = resolution_key(resolution);
    let Some(labels) = sweep.get(&key) else {
        bail!(
            "no clustering at resolution {} (have {})",
            resolution,
            sweep.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    };
    if labels.len() != metadata.len() {
        bail!("{} has {} labels for {} cells", key, labels.len(), metadata.len());
    }
    for (cell, &l) in metadata.iter_mut().zip(labels) {
        cell.cluster = Some(l);
    }
    Ok(())
}

/// Number of cells of one cluster in one group (sample or phase).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCount {
    pub cluster: usize,
    pub group: String,
    pub n_cells: usize,
}

fn count_by(metadata: &[CellRecord], group: impl Fn(&CellRecord) -> Option<String>) -> Vec<ClusterCount> {
    let mut counts: BTreeMap<(usize, String), usize> = BTreeMap::new();
    for cell in metadata {
        if let (Some(c), Some(g)) = (cell.cluster, group(cell)) {
            *counts.entry((c, g)).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|((cluster, group), n_cells)| ClusterCount { cluster, group, n_cells })
        .collect()
}

/// Cells per cluster and sample. Cells without a cluster are not counted.
pub fn cluster_sample_counts(metadata: &[CellRecord]) -> Vec<ClusterCount> {
    count_by(metadata, |c| Some(c.sample.clone()))
}

/// Cells per cluster and cell-cycle phase.
pub fn cluster_phase_counts(metadata: &[CellRecord]) -> Vec<ClusterCount> {
    count_by(metadata, |c| c.phase.map(|p| p.to_string()))
}

/// Median QC metrics of one cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterQc {
    pub cluster: usize,
    pub n_cells: usize,
    pub median_umi: f64,
    pub median_genes: f64,
    pub median_novelty: f64,
    pub median_mito_ratio: f64,
    pub median_s_score: Option<f64>,
    pub median_g2m_score: Option<f64>,
}

pub fn cluster_qc(metadata: &[CellRecord]) -> Vec<ClusterQc> {
    let mut groups: BTreeMap<usize, Vec<&CellRecord>> = BTreeMap::new();
    for cell in metadata {
        if let Some(c) = cell.cluster {
            groups.entry(c).or_default().push(cell);
        }
    }
    groups
        .into_iter()
        .map(|(cluster, cells)| {
            let med = |f: &dyn Fn(&CellRecord) -> f64| median(&cells.iter().map(|&c| f(c)).collect::<Vec<_>>());
            let med_opt = |f: &dyn Fn(&CellRecord) -> Option<f64>| {
                let v: Option<Vec<f64>> = cells.iter().map(|&c| f(c)).collect();
                v.map(|v| median(&v))
            };
            ClusterQc {
                cluster,
                n_cells: cells.len(),
                median_umi: med(&|c| c.n_umi as f64),
                median_genes: med(&|c| c.n_gene as f64),
                median_novelty: med(&|c| c.log10_genes_per_umi),
                median_mito_ratio: med(&|c| c.mito_ratio),
                median_s_score: med_opt(&|c| c.s_score),
                median_g2m_score: med_opt(&|c| c.g2m_score),
            }
        })
        .collect()
}
