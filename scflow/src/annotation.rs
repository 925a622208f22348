//! Gene annotation table (Ensembl id, symbol, biotype, description) and the symbol join used to
//! label marker tables.

use crate::mtx::open_text;
use anyhow::{Context, Error};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One row of the annotation table. Columns other than these are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneAnnotation {
    pub gene_id: String,
    pub gene_name: String,
    #[serde(default)]
    pub seq_name: Option<String>,
    #[serde(default)]
    pub gene_biotype: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct GeneAnnotations {
    rows: Vec<GeneAnnotation>,
    by_id: HashMap<String, usize>,
    by_symbol: HashMap<String, Vec<usize>>,
}

impl GeneAnnotations {
    pub fn new(rows: Vec<GeneAnnotation>) -> GeneAnnotations {
        let mut by_id = HashMap::new();
        let mut by_symbol: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, r) in rows.iter().enumerate() {
            by_id.entry(r.gene_id.clone()).or_insert(i);
            by_symbol.entry(r.gene_name.clone()).or_default().push(i);
        }
        GeneAnnotations { rows, by_id, by_symbol }
    }

    /// Read a CSV annotation table with a header row (plain or gzipped).
    pub fn from_csv(path: impl AsRef<Path>) -> Result<GeneAnnotations, Error> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_reader(open_text(path)?);
        let rows = reader
            .deserialize()
            .collect::<Result<Vec<GeneAnnotation>, _>>()
            .with_context(|| path.display().to_string())?;
        info!("loaded {} gene annotations from {}", rows.len(), path.display());
        Ok(GeneAnnotations::new(rows))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Gene symbol of an Ensembl id.
    pub fn lookup_symbol(&self, gene_id: &str) -> Option<&str> {
        self.by_id.get(gene_id).map(|&i| self.rows[i].gene_name.as_str())
    }

    /// First non-empty description of a gene symbol.
    pub fn description(&self, symbol: &str) -> Option<&str> {
        self.by_symbol
            .get(symbol)?
            .iter()
            .filter_map(|&i| self.rows[i].description.as_deref())
            .find(|d| !d.is_empty())
    }

    /// Distinct descriptions of a symbol, in table order. A symbol with rows lacking a
    /// description contributes `None` once.
    pub fn descriptions(&self, symbol: &str) -> Vec<Option<&str>> {
        let mut out: Vec<Option<&str>> = Vec::new();
        for &i in self.by_symbol.get(symbol).into_iter().flatten() {
            let d = self.rows[i].description.as_deref().filter(|d| !d.is_empty());
            if !out.contains(&d) {
                out.push(d);
            }
        }
        out
    }
}

/// A table row that can be joined with gene annotations by its gene symbol.
pub trait Annotate: Clone {
    fn gene(&self) -> &str;
    fn set_description(&mut self, description: Option<String>);
}

/// Left join of `markers` against the distinct `(symbol, description)` pairs of the annotation
/// table. A marker whose symbol has several distinct descriptions is repeated once per
/// description; markers without a match get no description.
pub fn annotate_markers<T: Annotate>(markers: Vec<T>, annotations: &GeneAnnotations) -> Vec<T> {
    let mut out = Vec::with_capacity(markers.len());
    for mut m in markers {
        let descriptions = annotations.descriptions(m.gene());
        match descriptions.as_slice() {
            [] => {
                m.set_description(None);
                out.push(m);
            }
            [single] => {
                m.set_description(single.map(str::to_string));
                out.push(m);
            }
            many => {
                for d in many {
                    let mut row = m.clone();
                    row.set_description(d.map(str::to_string));
                    out.push(row);
                }
            }
        }
    }
    out
}
