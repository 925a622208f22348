use crate::annotation::GeneAnnotations;
use crate::mtx::open_text;
use crate::normalization::feature_means;
use anyhow::{bail, Context, Error};
use log::{info, warn};
use noisy_float::prelude::*;
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use sc_types::{CellRecord, Phase};
use serde::Deserialize;
use sprs::CsMat;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Deserialize)]
struct CellCycleRow {
    phase: String,
    #[serde(rename = "geneID")]
    gene_id: String,
}

/// Marker genes of the S and G2/M phases, as feature indices of the matrix they were resolved
/// against.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CellCycleGenes {
    pub s: Vec<usize>,
    pub g2m: Vec<usize>,
}

impl CellCycleGenes {
    /// Read a `phase,geneID` CSV of Ensembl ids and resolve each id to a feature of
    /// `feature_names` through its gene symbol. Genes without a symbol or absent from the
    /// features are dropped with a warning.
    pub fn from_csv(
        path: impl AsRef<Path>,
        annotations: &GeneAnnotations,
        feature_names: &[String],
    ) -> Result<CellCycleGenes, Error> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_reader(open_text(path)?);
        let mut genes = CellCycleGenes::default();
        let mut dropped = Vec::new();
        for row in reader.deserialize() {
            let row: CellCycleRow = row.with_context(|| path.display().to_string())?;
            let phase: Phase = row.phase.parse()?;
            let feature = annotations
                .lookup_symbol(&row.gene_id)
                .and_then(|symbol| feature_names.iter().position(|f| f == symbol));
            let Some(f) = feature else {
                dropped.push(row.gene_id);
                continue;
            };
            match phase {
                Phase::S => genes.s.push(f),
                Phase::G2M => genes.g2m.push(f),
                _ => bail!("{}: cell-cycle genes must be S or G2/M, found {}", path.display(), row.phase),
            }
        }
        if !dropped.is_empty() {
            warn!(
                "{} cell-cycle genes are not annotated or not in the data: {}",
                dropped.len(),
                dropped.join(", ")
            );
        }
        info!("{} S and {} G2/M genes", genes.s.len(), genes.g2m.len());
        Ok(genes)
    }
}

/// Per-cell module score of a gene set. Genes are binned by average expression into `n_bins`
/// equal-frequency bins; for every gene of the set up to `n_ctrl` control genes are drawn
/// without replacement from its bin. The score is the mean expression of the set minus the
/// mean expression of all drawn controls.
pub fn module_score(
    normalized: &CsMat<f64>,
    features: &[usize],
    n_bins: usize,
    n_ctrl: usize,
    rng: &mut Pcg64Mcg,
) -> Result<Vec<f64>, Error> {
    if features.is_empty() {
        bail!("module score of an empty gene set");
    }
    if let Some(&f) = features.iter().find(|&&f| f >= normalized.rows()) {
        bail!("feature {} out of bounds for {} features", f, normalized.rows());
    }
    let n_genes = normalized.rows();
    let means = feature_means(normalized);
    let mut order: Vec<usize> = (0..n_genes).collect();
    order.sort_by_key(|&g| (n64(means[g]), g));
    let n_bins = n_bins.clamp(1, n_genes.max(1));
    let mut bin_of = vec![0; n_genes];
    for (rank, &g) in order.iter().enumerate() {
        bin_of[g] = rank * n_bins / n_genes;
    }
    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); n_bins];
    for &g in &order {
        bins[bin_of[g]].push(g);
    }

    let mut controls = BTreeSet::new();
    for &f in features {
        let bin = &bins[bin_of[f]];
        let take = n_ctrl.min(bin.len());
        for i in sample(rng, bin.len(), take) {
            controls.insert(bin[i]);
        }
    }

    let feature_set: BTreeSet<usize> = features.iter().copied().collect();
    let n_cells = normalized.cols();
    let mut feature_sum = vec![0.0; n_cells];
    let mut control_sum = vec![0.0; n_cells];
    for (&v, (g, c)) in normalized.iter() {
        if feature_set.contains(&g) {
            feature_sum[c] += v;
        }
        if controls.contains(&g) {
            control_sum[c] += v;
        }
    }
    let nf = feature_set.len() as f64;
    let nc = controls.len() as f64;
    Ok(feature_sum
        .into_iter()
        .zip(control_sum)
        .map(|(f, c)| f / nf - c / nc)
        .collect())
}

/// Phase from S and G2/M scores: G1 when both are negative, Undecided when they are equal,
/// otherwise the phase with the larger score.
pub fn assign_phase(s: f64, g2m: f64) -> Phase {
    if s < 0.0 && g2m < 0.0 {
        Phase::G1
    } else if s == g2m {
        Phase::Undecided
    } else if s > g2m {
        Phase::S
    } else {
        Phase::G2M
    }
}

/// S and G2/M scores and the phase of every cell, written into `metadata`.
pub fn cell_cycle_scoring(
    normalized: &CsMat<f64>,
    genes: &CellCycleGenes,
    metadata: &mut [CellRecord],
    n_bins: usize,
    n_ctrl: usize,
    seed: u64,
) -> Result<(), Error> {
    if metadata.len() != normalized.cols() {
        bail!("{} metadata rows for {} cells", metadata.len(), normalized.cols());
    }
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let s = module_score(normalized, &genes.s, n_bins, n_ctrl, &mut rng)?;
    let g2m = module_score(normalized, &genes.g2m, n_bins, n_ctrl, &mut rng)?;
    for ((cell, s), g2m) in metadata.iter_mut().zip(s).zip(g2m) {
        cell.s_score = Some(s);
        cell.g2m_score = Some(g2m);
        cell.phase = Some(assign_phase(s, g2m));
    }
    let n_g1 = metadata.iter().filter(|c| c.phase == Some(Phase::G1)).count();
    info!("cell-cycle scoring: {} of {} cells in G1", n_g1, metadata.len());
    Ok(())
}
