//! # scflow: two-condition single cell RNA-seq analysis in Rust

/// Gene annotation table and symbol joins
pub mod annotation;

/// Cell-cycle module scores and phase calls
pub mod cell_cycle;

/// Louvain clustering of the SNN graph and per-cluster tables
pub mod clustering;

/// Pipeline settings
pub mod config;

/// Dimensionality reduction methods
pub mod dim_red;

/// The analysis object and its persistence
pub mod experiment;

/// Anchor-based integration across samples
pub mod integration;

/// Conserved and pairwise cluster markers
pub mod markers;

/// Sample merging
pub mod merge;

/// MTX loading routine
pub mod mtx;

/// Nearest-neighbor graphs
pub mod nn;

/// Count matrix normalization methods
pub mod normalization;

/// CSV tables behind the plots
pub mod output;

/// Stage-by-stage driver
pub mod pipeline;

/// Per-cell QC metrics and filters
pub mod qc;

/// Regularized negative binomial normalization
pub mod sctransform;

/// Medians, quantiles and other summary statistics
pub mod stats;

pub use experiment::Experiment;
pub use pipeline::Pipeline;
