//! ONNX classifier inference using tract
//!
//! Classifiers exported from the training pipeline are loaded with tract-onnx
//! and fed one flow at a time. Label tensors are used as-is; probability
//! tensors are reduced to a class id.

use super::Classifier;
use crate::error::ScoreError;
use crate::models::FeatureMatrix;
use crate::observability::SentinelMetrics;
use anyhow::{Context, Result};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, warn};

/// Maximum inference latency per row before warning
const MAX_INFERENCE_MS: u128 = 5;

/// Probability threshold for single-output binary models
const BINARY_THRESHOLD: f32 = 0.5;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// ONNX-based classifier using tract for lightweight inference
pub struct OnnxClassifier {
    name: String,
    model: TractModel,
    num_features: usize,
    metrics: SentinelMetrics,
}

impl OnnxClassifier {
    /// Create a classifier from ONNX model bytes
    pub fn from_bytes(name: &str, model_bytes: &[u8], num_features: usize) -> Result<Self> {
        let model = Self::load_model(model_bytes, num_features)?;
        Ok(Self {
            name: name.to_string(),
            model,
            num_features,
            metrics: SentinelMetrics::new(),
        })
    }

    /// Load and optimize an ONNX model from bytes
    fn load_model(model_bytes: &[u8], num_features: usize) -> Result<TractModel> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(model_bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, num_features]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        Ok(model)
    }

    fn score_row(&self, row: Vec<f32>) -> Result<i64> {
        let start = Instant::now();

        let input: Tensor =
            tract_ndarray::Array2::from_shape_vec((1, self.num_features), row)?.into();
        let result = self.model.run(tvec!(input.into()))?;
        let output = result.first().context("No output from model")?;

        let elapsed = start.elapsed();

        if elapsed.as_millis() > MAX_INFERENCE_MS {
            self.metrics.inc_slow_inference(&self.name);
            warn!(
                model = %self.name,
                elapsed_ms = elapsed.as_millis(),
                "Inference exceeded {}ms target",
                MAX_INFERENCE_MS
            );
        } else {
            debug!(model = %self.name, elapsed_us = elapsed.as_micros(), "Inference completed");
        }

        class_from_output(output)
    }
}

impl Classifier for OnnxClassifier {
    fn score(&self, matrix: &FeatureMatrix) -> Result<Vec<i64>, ScoreError> {
        if matrix.ncols() != self.num_features {
            return Err(ScoreError::Inference(anyhow::anyhow!(
                "matrix has {} columns, model expects {}",
                matrix.ncols(),
                self.num_features
            )));
        }

        matrix
            .rows()
            .into_iter()
            .map(|row| self.score_row(row.to_vec()).map_err(ScoreError::from))
            .collect()
    }
}

/// Reduce the first model output for a single row to a class id
fn class_from_output(output: &Tensor) -> Result<i64> {
    match output.datum_type() {
        DatumType::I64 => first_value(output.to_array_view::<i64>()?.iter().copied()),
        DatumType::I32 => first_value(output.to_array_view::<i32>()?.iter().map(|&v| v as i64)),
        DatumType::F32 => {
            let values: Vec<f32> = output.to_array_view::<f32>()?.iter().copied().collect();
            class_from_scores(&values)
        }
        DatumType::F64 => {
            let values: Vec<f32> = output
                .to_array_view::<f64>()?
                .iter()
                .map(|&v| v as f32)
                .collect();
            class_from_scores(&values)
        }
        other => anyhow::bail!("Unsupported classifier output type {:?}", other),
    }
}

fn first_value(mut values: impl Iterator<Item = i64>) -> Result<i64> {
    values.next().context("Model output is empty")
}

/// Class id from per-class scores, or from one positive-class probability
fn class_from_scores(values: &[f32]) -> Result<i64> {
    match values {
        [] => anyhow::bail!("Model output is empty"),
        [probability] => Ok(i64::from(*probability >= BINARY_THRESHOLD)),
        scores => {
            let (idx, _) = scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .context("Model output is empty")?;
            Ok(idx as i64)
        }
    }
}
