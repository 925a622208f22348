//! Pipeline settings, read from a JSON file. Every section and field is optional.

use crate::clustering::DEFAULT_RESOLUTIONS;
use crate::integration::IntegrationParams;
use crate::normalization::Normalization;
use crate::qc::QcThresholds;
use crate::sctransform::SctParams;
use anyhow::{bail, Context, Error};
use diff_exp::MarkerParams;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use umap_rs::Umap;

/// A sample directory and the name its barcodes are prefixed with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleInput {
    pub name: String,
    pub dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub samples: Vec<SampleInput>,
    pub annotations: PathBuf,
    /// `phase,geneID` table of cell-cycle marker genes
    pub cell_cycle_genes: PathBuf,
    /// saved integrated object; when set, loading through integration is skipped
    pub precomputed: Option<PathBuf>,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            samples: ["ctrl", "stim"]
                .iter()
                .map(|s| SampleInput {
                    name: s.to_string(),
                    dir: PathBuf::from(format!("data/{s}_raw_feature_bc_matrix")),
                })
                .collect(),
            annotations: PathBuf::from("data/annotations.csv"),
            cell_cycle_genes: PathBuf::from("data/cycle.csv"),
            precomputed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    pub mito_prefix: String,
    pub thresholds: QcThresholds,
    /// genes must be detected in at least this many filtered cells
    pub min_cells_per_gene: usize,
}

impl Default for QcConfig {
    fn default() -> Self {
        QcConfig {
            mito_prefix: "MT-".to_string(),
            thresholds: QcThresholds::default(),
            min_cells_per_gene: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// normalization feeding the integration
    pub method: Normalization,
    pub scale_factor: f64,
    pub n_variable_features: usize,
    pub scale_clip: f64,
    pub sct: SctParams,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        NormalizationConfig {
            method: Normalization::SCTransform,
            scale_factor: 10_000.0,
            n_variable_features: 2000,
            scale_clip: 10.0,
            sct: SctParams::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellCycleConfig {
    pub n_bins: usize,
    pub n_ctrl: usize,
    pub seed: u64,
}

impl Default for CellCycleConfig {
    fn default() -> Self {
        CellCycleConfig {
            n_bins: 24,
            n_ctrl: 100,
            seed: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    pub n_pcs: usize,
    pub seed: u64,
}

impl Default for PcaConfig {
    fn default() -> Self {
        PcaConfig { n_pcs: 50, seed: 42 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborsConfig {
    /// neighborhood size, the cell itself included
    pub k_param: usize,
    pub dims: usize,
    pub prune: f64,
}

impl Default for NeighborsConfig {
    fn default() -> Self {
        NeighborsConfig {
            k_param: 20,
            dims: 40,
            prune: 1.0 / 15.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub resolutions: Vec<f64>,
    pub active_resolution: f64,
    pub seed: u64,
    /// cell type of each cluster id; clusters left out keep their number
    pub cell_types: BTreeMap<usize, String>,
    /// cell types dropped from the labelled object
    pub exclude: Vec<String>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        ClusteringConfig {
            resolutions: DEFAULT_RESOLUTIONS.to_vec(),
            active_resolution: 0.8,
            seed: 0,
            cell_types: BTreeMap::new(),
            exclude: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UmapConfig {
    pub dims: usize,
    pub params: Umap,
}

impl Default for UmapConfig {
    fn default() -> Self {
        UmapConfig {
            dims: 40,
            params: Umap::default(),
        }
    }
}

/// One cluster against a set of clusters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub ident1: usize,
    pub ident2: Vec<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkersConfig {
    /// clusters to find conserved markers for; all clusters when empty
    pub clusters: Vec<usize>,
    pub params: MarkerParams,
    pub top_n: usize,
    pub comparisons: Vec<Comparison>,
    /// genes written with the UMAP coordinates
    pub feature_genes: Vec<String>,
}

impl Default for MarkersConfig {
    fn default() -> Self {
        MarkersConfig {
            clusters: Vec::new(),
            params: MarkerParams {
                only_pos: true,
                ..MarkerParams::default()
            },
            top_n: 10,
            comparisons: Vec::new(),
            feature_genes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            results_dir: PathBuf::from("results"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input: InputConfig,
    pub qc: QcConfig,
    pub normalization: NormalizationConfig,
    pub cell_cycle: CellCycleConfig,
    pub integration: IntegrationParams,
    pub pca: PcaConfig,
    pub neighbors: NeighborsConfig,
    pub clustering: ClusteringConfig,
    pub umap: UmapConfig,
    pub markers: MarkersConfig,
    pub output: OutputConfig,
    /// memory ceiling of the integration, in bytes
    pub max_object_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            input: InputConfig::default(),
            qc: QcConfig::default(),
            normalization: NormalizationConfig::default(),
            cell_cycle: CellCycleConfig::default(),
            integration: IntegrationParams::default(),
            pca: PcaConfig::default(),
            neighbors: NeighborsConfig::default(),
            clustering: ClusteringConfig::default(),
            umap: UmapConfig::default(),
            markers: MarkersConfig::default(),
            output: OutputConfig::default(),
            max_object_bytes: 4000 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(path: impl AsRef<Path>) -> Result<PipelineConfig, Error> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| path.display().to_string())?;
        let config: PipelineConfig =
            serde_json::from_reader(BufReader::new(file)).with_context(|| path.display().to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no stage can run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.input.samples.is_empty() && self.input.precomputed.is_none() {
            bail!("no input samples and no precomputed object");
        }
        if self.neighbors.k_param < 2 {
            bail!("neighbors.k_param must be at least 2, got {}", self.neighbors.k_param);
        }
        if self.clustering.resolutions.is_empty() {
            bail!("no clustering resolutions");
        }
        if !self.clustering.resolutions.contains(&self.clustering.active_resolution) {
            bail!(
                "active resolution {} is not among the clustering resolutions {:?}",
                self.clustering.active_resolution,
                self.clustering.resolutions
            );
        }
        Ok(())
    }
}
