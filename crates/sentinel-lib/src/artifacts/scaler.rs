//! Feature scaling replayed from training
//!
//! The scaler parameters are exported by the training pipeline as JSON:
//!
//! ```json
//! {"kind": "standard", "mean": [0.5, 12.0], "scale": [0.1, 3.2]}
//! {"kind": "min_max", "min": [-0.2, 0.0], "scale": [0.01, 0.5]}
//! {"kind": "identity"}
//! ```

use crate::error::PredictionError;
use crate::models::FeatureMatrix;
use serde::{Deserialize, Serialize};

/// Stateless numeric transform applied before scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scaler {
    /// `(x - mean) / scale`
    Standard { mean: Vec<f32>, scale: Vec<f32> },
    /// `x * scale + min`
    MinMax { min: Vec<f32>, scale: Vec<f32> },
    /// Pass-through, for models trained on raw features
    Identity,
}

impl Scaler {
    /// Number of features the scaler was fit on, `None` for identity
    pub fn width(&self) -> Option<usize> {
        match self {
            Scaler::Standard { mean, .. } => Some(mean.len()),
            Scaler::MinMax { min, .. } => Some(min.len()),
            Scaler::Identity => None,
        }
    }

    /// Check internal consistency and replace zero standard deviations
    ///
    /// Constant features are exported with a zero scale; dividing by it would
    /// turn every value into NaN, so they are scaled by 1.0 instead.
    pub(crate) fn normalized(self) -> Result<Self, (usize, usize)> {
        match self {
            Scaler::Standard { mean, scale } => {
                if mean.len() != scale.len() {
                    return Err((mean.len(), scale.len()));
                }
                let scale = scale
                    .into_iter()
                    .map(|s| if s == 0.0 || !s.is_finite() { 1.0 } else { s })
                    .collect();
                Ok(Scaler::Standard { mean, scale })
            }
            Scaler::MinMax { min, scale } => {
                if min.len() != scale.len() {
                    return Err((min.len(), scale.len()));
                }
                Ok(Scaler::MinMax { min, scale })
            }
            Scaler::Identity => Ok(Scaler::Identity),
        }
    }

    /// Scale every row of the matrix
    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix, PredictionError> {
        if let Some(expected) = self.width() {
            if matrix.ncols() != expected {
                return Err(PredictionError::ScalingFailed {
                    expected,
                    actual: matrix.ncols(),
                });
            }
        }

        let mut scaled = matrix.clone();
        match self {
            Scaler::Standard { mean, scale } => {
                for mut row in scaled.rows_mut() {
                    for (j, value) in row.iter_mut().enumerate() {
                        *value = (*value - mean[j]) / scale[j];
                    }
                }
            }
            Scaler::MinMax { min, scale } => {
                for mut row in scaled.rows_mut() {
                    for (j, value) in row.iter_mut().enumerate() {
                        *value = *value * scale[j] + min[j];
                    }
                }
            }
            Scaler::Identity => {}
        }

        Ok(scaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tract_onnx::prelude::tract_ndarray::array;

    #[test]
    fn test_standard_scaler() {
        let scaler = Scaler::Standard {
            mean: vec![1.0, 10.0],
            scale: vec![2.0, 5.0],
        };
        let scaled = scaler.transform(&array![[3.0, 20.0], [1.0, 0.0]]).unwrap();
        assert_eq!(scaled, array![[1.0, 2.0], [0.0, -2.0]]);
    }

    #[test]
    fn test_min_max_scaler() {
        let scaler = Scaler::MinMax {
            min: vec![0.0, -1.0],
            scale: vec![0.5, 0.25],
        };
        let scaled = scaler.transform(&array![[4.0, 10.0]]).unwrap();
        assert_eq!(scaled, array![[2.0, 1.5]]);
    }

    #[test]
    fn test_shape_mismatch_fails() {
        let scaler = Scaler::Standard {
            mean: vec![0.0; 3],
            scale: vec![1.0; 3],
        };
        let err = scaler.transform(&array![[1.0, 2.0]]).unwrap_err();
        assert!(matches!(
            err,
            PredictionError::ScalingFailed {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_zero_scale_normalized() {
        let scaler = Scaler::Standard {
            mean: vec![5.0, 0.0],
            scale: vec![0.0, 2.0],
        }
        .normalized()
        .unwrap();
        let scaled = scaler.transform(&array![[5.0, 4.0]]).unwrap();
        assert_eq!(scaled, array![[0.0, 2.0]]);
    }

    #[test]
    fn test_mismatched_parameters_rejected() {
        let scaler = Scaler::MinMax {
            min: vec![0.0; 2],
            scale: vec![1.0; 3],
        };
        assert_eq!(scaler.normalized(), Err((2, 3)));
    }

    #[test]
    fn test_deserialize_tagged() {
        let scaler: Scaler =
            serde_json::from_str(r#"{"kind":"standard","mean":[0.0],"scale":[1.0]}"#).unwrap();
        assert_eq!(scaler.width(), Some(1));

        let identity: Scaler = serde_json::from_str(r#"{"kind":"identity"}"#).unwrap();
        assert_eq!(identity, Scaler::Identity);
    }
}
