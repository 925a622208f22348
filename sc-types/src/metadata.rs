use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cell-cycle phase assigned from S and G2/M module scores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Phase {
    #[default]
    G1,
    S,
    G2M,
    Undecided,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::G1 => "G1",
            Phase::S => "S",
            Phase::G2M => "G2M",
            Phase::Undecided => "Undecided",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = Error;
    fn from_str(s: &str) -> Result<Phase, Error> {
        Ok(match s {
            "G1" => Phase::G1,
            "S" => Phase::S,
            "G2M" | "G2/M" => Phase::G2M,
            "Undecided" => Phase::Undecided,
            _ => bail!("unknown cell-cycle phase: {}", s),
        })
    }
}

/// Quartile class of the mitochondrial ratio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum MitoClass {
    #[default]
    Low,
    Medium,
    High,
    VeryHigh,
}

impl fmt::Display for MitoClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MitoClass::Low => "Low",
            MitoClass::Medium => "Medium",
            MitoClass::High => "High",
            MitoClass::VeryHigh => "Very High",
        };
        f.write_str(s)
    }
}

/// One row of the per-cell metadata table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct CellRecord {
    pub barcode: String,
    pub sample: String,
    pub n_umi: u64,
    pub n_gene: usize,
    /// novelty score: log10(n_gene) / log10(n_umi)
    pub log10_genes_per_umi: f64,
    pub mito_ratio: f64,
    pub mito_fr: Option<MitoClass>,
    pub s_score: Option<f64>,
    pub g2m_score: Option<f64>,
    pub phase: Option<Phase>,
    pub cluster: Option<usize>,
    pub cell_type: Option<String>,
}

impl CellRecord {
    pub fn new(barcode: impl Into<String>, sample: impl Into<String>) -> CellRecord {
        CellRecord {
            barcode: barcode.into(),
            sample: sample.into(),
            ..Default::default()
        }
    }
}
