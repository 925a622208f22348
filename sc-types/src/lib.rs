//! Shared data types for single-cell count data: feature-barcode matrices,
//! per-cell metadata and label groupings.

pub mod label_class;
pub mod matrix;
pub mod metadata;
pub mod sparse;

pub use label_class::LabelClass;
pub use matrix::FeatureBarcodeMatrix;
pub use metadata::{CellRecord, MitoClass, Phase};
