#![deny(warnings)]

pub mod curve_fit;
pub mod dist;
pub mod embedding;
pub mod fuzzy;
pub mod knn;
pub mod optimize;
pub mod umap;

pub use crate::dist::Metric;
pub use crate::umap::Umap;

pub type Q = f64;
