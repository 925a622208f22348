//! Cluster marker tables on the log-normalized data, joined with gene annotations.

use crate::annotation::{annotate_markers, Annotate, GeneAnnotations};
use crate::experiment::Experiment;
use anyhow::{bail, Context, Error};
use diff_exp::{find_conserved_markers, find_markers, Expression, MarkerParams, MarkerRow};
use log::{info, warn};
use noisy_float::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// A conserved marker of one cluster with its per-sample statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct ConservedRow {
    pub cluster_id: usize,
    pub gene: String,
    /// `(sample, statistics)` in sample order
    pub levels: Vec<(String, MarkerRow)>,
    pub max_pval: f64,
    pub minimump_p_val: f64,
    pub description: Option<String>,
}

impl ConservedRow {
    /// Mean of the per-sample average log2 fold changes.
    pub fn mean_log2fc(&self) -> f64 {
        self.levels.iter().map(|(_, r)| r.avg_log2fc).sum::<f64>() / self.levels.len().max(1) as f64
    }
}

impl Annotate for ConservedRow {
    fn gene(&self) -> &str {
        &self.gene
    }
    fn set_description(&mut self, description: Option<String>) {
        self.description = description;
    }
}

/// A two-group marker with its annotation.
#[derive(Clone, Debug, PartialEq)]
pub struct AnnotatedMarker {
    pub marker: MarkerRow,
    pub description: Option<String>,
}

impl Annotate for AnnotatedMarker {
    fn gene(&self) -> &str {
        &self.marker.gene
    }
    fn set_description(&mut self, description: Option<String>) {
        self.description = description;
    }
}

/// Inputs shared by every marker test on one experiment.
struct MarkerContext {
    expression: Expression,
    idents: Vec<usize>,
    samples: Vec<String>,
}

impl MarkerContext {
    fn new(exp: &Experiment) -> Result<MarkerContext, Error> {
        Ok(MarkerContext {
            expression: Expression::new(exp.counts.feature_names.clone(), exp.normalized_matrix()?)?,
            idents: exp.idents()?,
            samples: exp.metadata.iter().map(|c| c.sample.clone()).collect(),
        })
    }

    /// Whether some sample has enough cells inside and outside `cluster`.
    fn evaluable(&self, cluster: usize, min_cells: usize) -> bool {
        let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for (s, &l) in self.samples.iter().zip(&self.idents) {
            let e = counts.entry(s.as_str()).or_default();
            if l == cluster {
                e.0 += 1;
            } else {
                e.1 += 1;
            }
        }
        counts.values().any(|&(i, o)| i >= min_cells && o >= min_cells)
    }

    fn conserved(&self, cluster: usize, params: &MarkerParams) -> Result<Vec<ConservedRow>, Error> {
        let markers = find_conserved_markers(&self.expression, &self.idents, cluster, &self.samples, params)?;
        Ok(markers
            .into_iter()
            .map(|m| ConservedRow {
                cluster_id: cluster,
                gene: m.gene,
                levels: m.levels,
                max_pval: m.max_pval,
                minimump_p_val: m.minimump_p_val,
                description: None,
            })
            .collect())
    }
}

/// Markers of `cluster` conserved across samples, annotated with gene descriptions.
pub fn get_conserved(
    exp: &Experiment,
    cluster: usize,
    params: &MarkerParams,
    annotations: &GeneAnnotations,
) -> Result<Vec<ConservedRow>, Error> {
    let ctx = MarkerContext::new(exp)?;
    Ok(annotate_markers(ctx.conserved(cluster, params)?, annotations))
}

/// Conserved markers of every listed cluster. Clusters without a sample holding enough cells
/// on both sides are skipped.
pub fn conserved_markers_all(
    exp: &Experiment,
    clusters: &[usize],
    params: &MarkerParams,
    annotations: &GeneAnnotations,
) -> Result<Vec<ConservedRow>, Error> {
    let ctx = MarkerContext::new(exp)?;
    let mut rows = Vec::new();
    for &cluster in clusters {
        if !ctx.evaluable(cluster, params.min_cells_group) {
            warn!("cluster {}: no sample has enough cells to test, skipping", cluster);
            continue;
        }
        let markers = ctx.conserved(cluster, params)?;
        info!("cluster {}: {} conserved markers", cluster, markers.len());
        rows.extend(annotate_markers(markers, annotations));
    }
    Ok(rows)
}

/// The `n` markers of each cluster with the largest mean fold change across samples. Clusters
/// keep their first-appearance order.
pub fn top_markers(rows: &[ConservedRow], n: usize) -> Vec<ConservedRow> {
    let mut order: Vec<usize> = Vec::new();
    let mut by_cluster: BTreeMap<usize, Vec<&ConservedRow>> = BTreeMap::new();
    for r in rows {
        if !by_cluster.contains_key(&r.cluster_id) {
            order.push(r.cluster_id);
        }
        by_cluster.entry(r.cluster_id).or_default().push(r);
    }
    let mut out = Vec::new();
    for cluster in order {
        let mut group = by_cluster.remove(&cluster).unwrap_or_default();
        group.sort_by_key(|r| -n64(r.mean_log2fc()));
        out.extend(group.into_iter().take(n).cloned());
    }
    out
}

/// Markers of cluster `ident1` against the cells of all `ident2` clusters.
pub fn markers_between(
    exp: &Experiment,
    ident1: usize,
    ident2: &[usize],
    params: &MarkerParams,
    annotations: &GeneAnnotations,
) -> Result<Vec<AnnotatedMarker>, Error> {
    if ident2.contains(&ident1) {
        bail!("cluster {} is on both sides of the comparison", ident1);
    }
    let ctx = MarkerContext::new(exp)?;
    let group1: Vec<usize> = (0..ctx.idents.len()).filter(|&c| ctx.idents[c] == ident1).collect();
    let group2: Vec<usize> = (0..ctx.idents.len()).filter(|&c| ident2.contains(&ctx.idents[c])).collect();
    let rows = find_markers(&ctx.expression, &group1, &group2, params)
        .with_context(|| format!("cluster {} vs {:?}", ident1, ident2))?;
    info!("cluster {} vs {:?}: {} markers", ident1, ident2, rows.len());
    let rows = rows
        .into_iter()
        .map(|marker| AnnotatedMarker {
            marker,
            description: None,
        })
        .collect();
    Ok(annotate_markers(rows, annotations))
}

fn fmt_opt(x: Option<f64>) -> String {
    x.map_or_else(String::new, |v| v.to_string())
}

/// Write conserved markers with one block of columns per sample (`<sample>_p_val`, ...).
pub fn write_conserved_csv(path: impl AsRef<Path>, rows: &[ConservedRow]) -> Result<(), Error> {
    let path = path.as_ref();
    let mut levels: Vec<&str> = Vec::new();
    for r in rows {
        for (l, _) in &r.levels {
            if !levels.contains(&l.as_str()) {
                levels.push(l.as_str());
            }
        }
    }

    let file = File::create(path).with_context(|| path.display().to_string())?;
    let mut w = csv::Writer::from_writer(BufWriter::new(file));
    let mut header = vec!["cluster_id".to_string(), "gene".to_string()];
    for l in &levels {
        for col in ["p_val", "avg_log2FC", "pct.1", "pct.2", "p_val_adj"] {
            header.push(format!("{l}_{col}"));
        }
    }
    header.extend(["max_pval", "minimump_p_val", "description"].map(String::from));
    w.write_record(&header)?;

    for r in rows {
        let mut record = vec![r.cluster_id.to_string(), r.gene.clone()];
        for l in &levels {
            let m = r.levels.iter().find(|(name, _)| name.as_str() == *l).map(|(_, m)| m);
            record.push(fmt_opt(m.map(|m| m.p_val)));
            record.push(fmt_opt(m.map(|m| m.avg_log2fc)));
            record.push(fmt_opt(m.map(|m| m.pct_1)));
            record.push(fmt_opt(m.map(|m| m.pct_2)));
            record.push(fmt_opt(m.map(|m| m.p_val_adj)));
        }
        record.push(r.max_pval.to_string());
        record.push(r.minimump_p_val.to_string());
        record.push(r.description.clone().unwrap_or_default());
        w.write_record(&record)?;
    }
    w.flush()?;
    Ok(())
}

/// Write two-group markers.
pub fn write_markers_csv(path: impl AsRef<Path>, rows: &[AnnotatedMarker]) -> Result<(), Error> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| path.display().to_string())?;
    let mut w = csv::Writer::from_writer(BufWriter::new(file));
    w.write_record(["gene", "p_val", "avg_log2FC", "pct.1", "pct.2", "p_val_adj", "description"])?;
    for r in rows {
        let m = &r.marker;
        w.write_record([
            m.gene.clone(),
            m.p_val.to_string(),
            m.avg_log2fc.to_string(),
            m.pct_1.to_string(),
            m.pct_2.to_string(),
            m.p_val_adj.to_string(),
            r.description.clone().unwrap_or_default(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::annotation::GeneAnnotation;
    use crate::experiment::NormalizedData;
    use crate::normalization::log_normalize;
    use sc_types::sparse::csc_from_columns;
    use sc_types::{CellRecord, FeatureBarcodeMatrix};

    /// 3 genes x 16 cells; 8 ctrl and 8 stim cells, the first half of each sample in cluster 0.
    /// MARK is high in cluster 0, HOUSE is flat, RARE is only in one stim cell of cluster 1.
    fn experiment() -> Experiment {
        let columns: Vec<Vec<(usize, u32)>> = (0..16)
            .map(|c| {
                let in0 = c % 8 < 4;
                let mut col = vec![(1, 5 + (c % 3) as u32)];
                col.insert(0, (0, if in0 { 20 + c as u32 } else { 1 + (c % 2) as u32 }));
                if c == 15 {
                    col.push((2, 3));
                }
                col
            })
            .collect();
        let barcodes: Vec<String> = (0..16)
            .map(|c| format!("{}_{c}", if c < 8 { "ctrl" } else { "stim" }))
            .collect();
        let counts = FeatureBarcodeMatrix::new(
            "merged",
            barcodes.clone(),
            vec!["ENSG1".into(), "ENSG2".into(), "ENSG3".into()],
            vec!["MARK".into(), "HOUSE".into(), "RARE".into()],
            csc_from_columns(3, columns).unwrap(),
        )
        .unwrap();
        let meta = barcodes
            .iter()
            .enumerate()
            .map(|(c, b)| {
                let mut r = CellRecord::new(b.clone(), if c < 8 { "ctrl" } else { "stim" });
                r.cluster = Some(if c % 8 < 4 { 0 } else { 1 });
                r
            })
            .collect();
        let mut exp = Experiment::new(counts, meta).unwrap();
        exp.normalized = Some(NormalizedData {
            matrix: log_normalize(&exp.counts.matrix, 1e4).unwrap(),
        });
        exp
    }

    fn annotations() -> GeneAnnotations {
        GeneAnnotations::new(vec![GeneAnnotation {
            gene_id: "ENSG1".into(),
            gene_name: "MARK".into(),
            seq_name: None,
            gene_biotype: None,
            description: Some("marker gene".into()),
        }])
    }

    fn only_pos() -> MarkerParams {
        MarkerParams {
            only_pos: true,
            ..MarkerParams::default()
        }
    }

    #[test]
    fn test_get_conserved() -> Result<(), Error> {
        let rows = get_conserved(&experiment(), 0, &only_pos(), &annotations())?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].gene, "MARK");
        assert_eq!(rows[0].cluster_id, 0);
        assert_eq!(rows[0].description.as_deref(), Some("marker gene"));
        let levels: Vec<&str> = rows[0].levels.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(levels, vec!["ctrl", "stim"]);
        assert!(rows[0].mean_log2fc() > 1.0);
        Ok(())
    }

    #[test]
    fn test_conserved_all_skips_small_clusters() -> Result<(), Error> {
        let mut exp = experiment();
        // clusters 1 and 2 hold two cells per sample each
        for c in [4, 5, 12, 13] {
            exp.metadata[c].cluster = Some(2);
        }
        let rows = conserved_markers_all(&exp, &[0, 1, 2], &only_pos(), &annotations())?;
        assert!(rows.iter().all(|r| r.cluster_id == 0));
        assert!(rows.iter().any(|r| r.cluster_id == 0 && r.gene == "MARK"));
        Ok(())
    }

    fn row(cluster_id: usize, gene: &str, fcs: [f64; 2]) -> ConservedRow {
        let stat = |fc: f64| MarkerRow {
            gene: gene.to_string(),
            p_val: 0.01,
            avg_log2fc: fc,
            pct_1: 1.0,
            pct_2: 0.5,
            p_val_adj: 0.03,
        };
        ConservedRow {
            cluster_id,
            gene: gene.to_string(),
            levels: vec![("ctrl".into(), stat(fcs[0])), ("stim".into(), stat(fcs[1]))],
            max_pval: 0.01,
            minimump_p_val: 0.02,
            description: None,
        }
    }

    #[test]
    fn test_top_markers() {
        let rows = vec![
            row(3, "A", [1.0, 1.0]),
            row(3, "B", [3.0, 1.0]),
            row(3, "C", [0.5, 0.1]),
            row(0, "D", [1.0, 2.0]),
        ];
        let top = top_markers(&rows, 2);
        let genes: Vec<&str> = top.iter().map(|r| r.gene.as_str()).collect();
        // cluster 3: B (mean 2) then A (mean 1)
        assert_eq!(genes, vec!["B", "A", "D"]);
    }

    #[test]
    fn test_markers_between() -> Result<(), Error> {
        let exp = experiment();
        let rows = markers_between(&exp, 0, &[1], &only_pos(), &annotations())?;
        assert_eq!(rows[0].marker.gene, "MARK");
        assert_eq!(rows[0].description.as_deref(), Some("marker gene"));
        assert!(markers_between(&exp, 0, &[0, 1], &only_pos(), &annotations()).is_err());
        Ok(())
    }

    #[test]
    fn test_write_conserved() -> Result<(), Error> {
        let path = std::env::temp_dir().join(format!("scflow-conserved-{}.csv", std::process::id()));
        write_conserved_csv(&path, &[row(1, "A", [1.0, 2.0])])?;
        let text = std::fs::read_to_string(&path)?;
        let header = text.lines().next().unwrap_or_default();
        assert!(header.starts_with("cluster_id,gene,ctrl_p_val,ctrl_avg_log2FC"));
        assert!(header.ends_with("stim_p_val_adj,max_pval,minimump_p_val,description"));
        assert_eq!(text.lines().count(), 2);
        std::fs::remove_file(path)?;
        Ok(())
    }
}
