//! Flow classification
//!
//! Aligns the extractor's flow table with the feature schema and scores the
//! aligned flows with every registered classifier.

mod align;
mod ensemble;
mod inference;

pub use align::{write_filtered, SchemaAligner, DEFAULT_ADDRESS_COLUMN};
pub use ensemble::{EnsemblePredictor, PredictorConfig, DEFAULT_MAX_ROWS};
pub use inference::OnnxClassifier;

use crate::error::ScoreError;
use crate::models::FeatureMatrix;

/// Trait for classifier implementations
///
/// A classifier maps every row of an already scaled matrix to one class id.
/// Implementations must not keep per-call mutable state; the same instance is
/// scored from several worker threads.
pub trait Classifier: Send + Sync {
    /// Score every row of `matrix`, returning one class id per row
    fn score(&self, matrix: &FeatureMatrix) -> Result<Vec<i64>, ScoreError>;
}
