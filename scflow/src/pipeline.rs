//! The whole analysis, stage by stage. Every stage logs its duration and writes its tables into
//! the results directory.

use crate::annotation::GeneAnnotations;
use crate::cell_cycle::{cell_cycle_scoring, CellCycleGenes};
use crate::clustering::{cluster_phase_counts, cluster_qc, cluster_sample_counts, find_clusters};
use crate::config::PipelineConfig;
use crate::dim_red::{elbow_pcs, run_pca};
use crate::experiment::{Experiment, NormalizedData};
use crate::integration::{integrate, integrate_log_normalized, IntegratedData};
use crate::markers::{conserved_markers_all, markers_between, top_markers, write_conserved_csv, write_markers_csv, ConservedRow};
use crate::merge::merge;
use crate::mtx::load_10x_dir;
use crate::nn::{knn, snn_graph};
use crate::normalization::{find_variable_features, log_normalize, scale_data, scale_rows, Normalization};
use crate::output::{write_csv, write_elbow, write_embedding, write_feature_data};
use crate::qc::{assign_mito_classes, compute_qc_metrics, filter_cells, filter_genes, summarize_qc};
use crate::sctransform::{sctransform, SctModel};
use anyhow::{format_err, Context, Error};
use log::{info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;

fn timed<T>(stage: &str, f: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
    let tick = Instant::now();
    info!("{}: starting", stage);
    let out = f().with_context(|| format!("stage {}", stage))?;
    info!("{}: done in {:.2?}", stage, tick.elapsed());
    Ok(out)
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Pipeline {
        Pipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Path of `name` in the results directory, which is created if missing.
    fn output(&self, name: &str) -> Result<PathBuf, Error> {
        let dir = &self.config.output.results_dir;
        std::fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
        Ok(dir.join(name))
    }

    /// Run every stage. A configured precomputed object replaces everything up to and
    /// including integration.
    pub fn run(&self) -> Result<Experiment, Error> {
        let mut exp = match &self.config.input.precomputed {
            Some(path) => {
                info!("using precomputed object {}", path.display());
                Experiment::load(path)?
            }
            None => {
                let exp = self.qc()?;
                let exp = self.normalize(exp)?;
                self.integrate(exp)?
            }
        };
        if exp.normalized.is_none() {
            exp.normalized = Some(NormalizedData {
                matrix: log_normalize(&exp.counts.matrix, self.config.normalization.scale_factor)?,
            });
        }
        let exp = self.cluster(exp)?;
        self.markers(&exp)?;
        self.label(exp)
    }

    /// Load and merge the samples, compute QC metrics and filter cells and genes. Writes the
    /// raw and filtered QC tables and saves the filtered object.
    pub fn qc(&self) -> Result<Experiment, Error> {
        timed("qc", || {
            let input = &self.config.input;
            let qc = &self.config.qc;
            let samples = input
                .samples
                .iter()
                .map(|s| load_10x_dir(&s.dir, &s.name))
                .collect::<Result<Vec<_>, Error>>()?;
            let names: Vec<String> = input.samples.iter().map(|s| s.name.clone()).collect();
            let mut merged = merge(&samples, Some(&names[..]))?;
            merged.sample = "merged".to_string();

            let metadata = compute_qc_metrics(&merged, &qc.mito_prefix, &names);
            write_csv(self.output("metadata_raw.csv")?, &metadata)?;
            write_csv(self.output("qc_summary_raw.csv")?, &summarize_qc(&metadata))?;

            let (filtered, metadata) = filter_cells(&merged, &metadata, &qc.thresholds)?;
            let filtered = filter_genes(&filtered, qc.min_cells_per_gene)?;
            write_csv(self.output("qc_summary_filtered.csv")?, &summarize_qc(&metadata))?;
            info!(
                "{} cells and {} genes after filtering",
                filtered.num_cells(),
                filtered.num_features()
            );

            let exp = Experiment::new(filtered, metadata)?;
            exp.save(self.output("seurat_filtered.json.gz")?)?;
            Ok(exp)
        })
    }

    /// Log-normalize, score the cell cycle and check it on a PCA of the variable features.
    pub fn normalize(&self, mut exp: Experiment) -> Result<Experiment, Error> {
        timed("normalize", || {
            let norm = &self.config.normalization;
            let normalized = log_normalize(&exp.counts.matrix, norm.scale_factor)?;

            let cc = &self.config.cell_cycle;
            let annotations = GeneAnnotations::from_csv(&self.config.input.annotations)?;
            let genes = CellCycleGenes::from_csv(&self.config.input.cell_cycle_genes, &annotations, &exp.counts.feature_names)?;
            if genes.s.is_empty() || genes.g2m.is_empty() {
                warn!("no S or no G2/M genes in the data, skipping cell-cycle scoring");
            } else {
                cell_cycle_scoring(&normalized, &genes, &mut exp.metadata, cc.n_bins, cc.n_ctrl, cc.seed)?;
            }

            let variable = find_variable_features(&exp.counts.matrix, norm.n_variable_features);
            let scaled = scale_data(&normalized, &variable, norm.scale_clip)?;
            let pca = run_pca(&scaled, self.config.pca.n_pcs, self.config.pca.seed)?;
            write_embedding(self.output("cell_cycle_pca.csv")?, &exp.metadata, pca.dims(2), "PC_")?;

            assign_mito_classes(&mut exp.metadata);
            exp.variable_features = variable.iter().map(|&f| exp.counts.feature_names[f].clone()).collect();
            exp.normalized = Some(NormalizedData { matrix: normalized });
            exp.pca = Some(pca);
            Ok(exp)
        })
    }

    /// Normalize every sample on its own and integrate them. Saves the integrated object.
    pub fn integrate(&self, mut exp: Experiment) -> Result<Experiment, Error> {
        timed("integrate", || {
            let norm = &self.config.normalization;
            let groups = exp.samples();
            let parts = exp.split_by_sample()?;
            info!("integrating {} samples", parts.len());

            let integrated = match norm.method {
                Normalization::SCTransform => {
                    let models = parts
                        .par_iter()
                        .map(|p| sctransform(&p.counts, &p.metadata, &norm.sct))
                        .collect::<Result<Vec<SctModel>, Error>>()?;
                    integrate(&models, &self.config.integration, self.config.max_object_bytes)?
                }
                Normalization::LogNormalize => {
                    let counts: Vec<_> = parts.into_iter().map(|p| p.counts).collect();
                    integrate_log_normalized(
                        &counts,
                        norm.scale_factor,
                        &self.config.integration,
                        self.config.max_object_bytes,
                    )?
                }
            };

            // back to the cell order of the experiment
            let mut data = Array2::zeros(integrated.data.dim());
            let mut col = 0;
            for (_, cells) in groups.iter() {
                for &c in cells {
                    data.column_mut(c).assign(&integrated.data.column(col));
                    col += 1;
                }
            }
            exp.integrated = Some(IntegratedData {
                features: integrated.features,
                data,
            });
            exp.save(self.output("integrated_seurat.json.gz")?)?;
            Ok(exp)
        })
    }

    /// PCA, UMAP, SNN graph and clustering of the integrated data.
    pub fn cluster(&self, mut exp: Experiment) -> Result<Experiment, Error> {
        timed("cluster", || {
            let integrated = exp
                .integrated
                .as_ref()
                .ok_or_else(|| format_err!("the experiment has no integrated data"))?;
            let mut scaled = integrated.data.clone();
            scale_rows(&mut scaled, self.config.normalization.scale_clip);
            let pca = run_pca(&scaled, self.config.pca.n_pcs, self.config.pca.seed)?;
            write_elbow(self.output("elbow.csv")?, &pca.stdev)?;
            info!("elbow at {} PCs", elbow_pcs(&pca.stdev));

            let umap_cfg = &self.config.umap;
            exp.umap = Some(umap_cfg.params.fit(&pca.dims(umap_cfg.dims).to_owned()));

            let nb = &self.config.neighbors;
            let (neighbors, _) = knn(&pca.dims(nb.dims), nb.k_param - 1)?;
            let snn = snn_graph(&neighbors, nb.prune)?;
            info!("SNN graph: {} edges", snn.nnz() / 2);

            let cl = &self.config.clustering;
            exp.clusters = find_clusters(&snn, &cl.resolutions, cl.seed)?;
            exp.pca = Some(pca);
            exp.set_idents(cl.active_resolution)?;

            write_csv(self.output("cluster_sample_counts.csv")?, &cluster_sample_counts(&exp.metadata))?;
            write_csv(self.output("cluster_phase_counts.csv")?, &cluster_phase_counts(&exp.metadata))?;
            write_csv(self.output("cluster_qc.csv")?, &cluster_qc(&exp.metadata))?;
            self.write_embeddings(&exp)?;
            Ok(exp)
        })
    }

    /// UMAP and PCA coordinates with the cell metadata.
    pub fn write_embeddings(&self, exp: &Experiment) -> Result<(), Error> {
        if let Some(umap) = &exp.umap {
            write_embedding(self.output("umap.csv")?, &exp.metadata, umap.view(), "UMAP_")?;
        }
        if let Some(pca) = &exp.pca {
            write_embedding(self.output("pca.csv")?, &exp.metadata, pca.dims(self.config.neighbors.dims), "PC_")?;
        }
        Ok(())
    }

    /// Conserved markers of the configured clusters (all clusters by default), the top markers
    /// per cluster, the configured pairwise comparisons and feature-plot data.
    pub fn markers(&self, exp: &Experiment) -> Result<Vec<ConservedRow>, Error> {
        timed("markers", || {
            let cfg = &self.config.markers;
            let annotations = GeneAnnotations::from_csv(&self.config.input.annotations)?;
            let clusters = if cfg.clusters.is_empty() {
                let n = exp.idents()?.into_iter().max().map_or(0, |m| m + 1);
                (0..n).collect()
            } else {
                cfg.clusters.clone()
            };

            let rows = conserved_markers_all(exp, &clusters, &cfg.params, &annotations)?;
            write_conserved_csv(self.output("conserved_markers.csv")?, &rows)?;
            write_conserved_csv(self.output("top_markers.csv")?, &top_markers(&rows, cfg.top_n))?;

            for cmp in &cfg.comparisons {
                let markers = markers_between(exp, cmp.ident1, &cmp.ident2, &cfg.params, &annotations)?;
                let others: Vec<String> = cmp.ident2.iter().map(usize::to_string).collect();
                write_markers_csv(
                    self.output(&format!("markers_{}_vs_{}.csv", cmp.ident1, others.join("_")))?,
                    &markers,
                )?;
            }

            if !cfg.feature_genes.is_empty() {
                let data = exp.fetch_features(&cfg.feature_genes)?;
                write_feature_data(self.output("feature_plot.csv")?, &data)?;
            }
            Ok(rows)
        })
    }

    /// Name the clusters, drop the excluded cell types and save the labelled object.
    pub fn label(&self, mut exp: Experiment) -> Result<Experiment, Error> {
        timed("label", || {
            let cl = &self.config.clustering;
            if !cl.cell_types.is_empty() {
                exp.rename_idents(&cl.cell_types)?;
            }
            if !cl.exclude.is_empty() {
                exp = exp.subset_idents(&cl.exclude)?;
            }
            write_csv(self.output("metadata.csv")?, &exp.metadata)?;
            exp.save(self.output("seurat_labelled.json.gz")?)?;
            Ok(exp)
        })
    }
}
