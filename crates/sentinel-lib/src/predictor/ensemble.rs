//! Ensemble scoring
//!
//! Scales the aligned flows once, keeps the first `max_rows` of them and
//! scores that bounded matrix with every registered classifier. Classifiers
//! run concurrently on the blocking pool, gated by a semaphore; one failing
//! classifier never hides the verdicts of the others.

use crate::artifacts::ArtifactSet;
use crate::error::{PredictionError, ScoreError};
use crate::models::{AlignedFlows, FeatureMatrix, PredictionResult};
use crate::observability::SentinelMetrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tract_onnx::prelude::tract_ndarray::s;
use tracing::{debug, warn};

/// Default number of flows scored per cycle
pub const DEFAULT_MAX_ROWS: usize = 5;

/// Configuration for the ensemble predictor
#[derive(Debug, Clone)]
pub struct PredictorConfig {
    /// Flows scored per cycle; later rows are ignored
    pub max_rows: usize,
    /// Concurrent classifier tasks, 0 for one per classifier
    pub max_workers: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            max_workers: 0,
        }
    }
}

/// Scores aligned flows with every loaded classifier
pub struct EnsemblePredictor {
    artifacts: Arc<ArtifactSet>,
    config: PredictorConfig,
    metrics: SentinelMetrics,
}

impl EnsemblePredictor {
    pub fn new(artifacts: Arc<ArtifactSet>, config: PredictorConfig) -> Self {
        Self {
            artifacts,
            config,
            metrics: SentinelMetrics::new(),
        }
    }

    pub fn artifacts(&self) -> &Arc<ArtifactSet> {
        &self.artifacts
    }

    fn worker_count(&self) -> usize {
        let classifiers = self.artifacts.classifiers().len();
        match self.config.max_workers {
            0 => classifiers,
            n => n.min(classifiers),
        }
        .max(1)
    }

    /// Score the aligned flows
    ///
    /// Results are ordered by row, then by classifier registration order,
    /// independent of which classifier finishes first.
    pub async fn predict(
        &self,
        flows: &AlignedFlows,
    ) -> Result<Vec<PredictionResult>, PredictionError> {
        let start = Instant::now();

        let scaled = self.artifacts.scaler().transform(&flows.matrix)?;

        let rows = self.config.max_rows.min(flows.rows());
        if rows < flows.rows() {
            debug!(
                total = flows.rows(),
                scored = rows,
                "Truncating flows to the per-cycle scoring bound"
            );
        }
        let bounded = Arc::new(scaled.slice(s![..rows, ..]).to_owned());
        let addresses = &flows.addresses[..rows];

        let class_ids = self.score_all(bounded).await;

        let classifiers = self.artifacts.classifiers();
        let mut labels: Vec<Option<Vec<String>>> = Vec::with_capacity(classifiers.len());

        for (entry, outcome) in classifiers.iter().zip(class_ids) {
            let decoded = outcome.and_then(|ids| {
                if ids.len() != rows {
                    return Err(ScoreError::RowCount {
                        expected: rows,
                        actual: ids.len(),
                    });
                }
                self.artifacts.labels().decode_all(&ids)
            });

            match decoded {
                Ok(decoded) => labels.push(Some(decoded)),
                Err(e) => {
                    let err = PredictionError::ClassifierFailed {
                        model: entry.name.clone(),
                        reason: e.to_string(),
                    };
                    warn!(model = %entry.name, error = %err, "Skipping classifier for this cycle");
                    self.metrics.inc_classifier_failure(&entry.name);
                    labels.push(None);
                }
            }
        }

        if labels.iter().all(Option::is_none) {
            return Err(PredictionError::NoClassifierSucceeded);
        }

        let mut results = Vec::with_capacity(rows * classifiers.len());
        for (row, address) in addresses.iter().enumerate() {
            for (entry, decoded) in classifiers.iter().zip(&labels) {
                if let Some(decoded) = decoded {
                    results.push(PredictionResult {
                        source_address: address.clone(),
                        label: decoded[row].clone(),
                        model: Some(entry.name.clone()),
                    });
                }
            }
        }

        debug!(
            rows,
            results = results.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Ensemble scoring complete"
        );

        Ok(results)
    }

    /// Run every classifier over the same matrix on a bounded worker pool
    ///
    /// Returns one outcome per classifier, in registration order. The pool is
    /// drained before returning.
    async fn score_all(&self, matrix: Arc<FeatureMatrix>) -> Vec<Result<Vec<i64>, ScoreError>> {
        let classifiers = self.artifacts.classifiers();
        let permits = Arc::new(Semaphore::new(self.worker_count()));
        let mut tasks = JoinSet::new();

        for (idx, entry) in classifiers.iter().enumerate() {
            let classifier = entry.classifier.clone();
            let matrix = matrix.clone();
            let permits = permits.clone();

            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        tokio::task::spawn_blocking(move || classifier.score(&matrix))
                            .await
                            .unwrap_or_else(|e| {
                                Err(ScoreError::Inference(anyhow::anyhow!(
                                    "classifier task failed: {}",
                                    e
                                )))
                            })
                    }
                    Err(e) => Err(ScoreError::Inference(anyhow::anyhow!(
                        "worker pool closed: {}",
                        e
                    ))),
                };
                (idx, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<Vec<i64>, ScoreError>>> =
            (0..classifiers.len()).map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => warn!(error = %e, "Classifier worker aborted"),
            }
        }

        outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| {
                    Err(ScoreError::Inference(anyhow::anyhow!(
                        "classifier produced no outcome"
                    )))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{LabelDecoder, RegisteredClassifier, Scaler};
    use crate::models::FeatureSchema;
    use crate::predictor::Classifier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Predicts class 1 for rows whose first feature is positive
    struct ThresholdClassifier;

    impl Classifier for ThresholdClassifier {
        fn score(&self, matrix: &FeatureMatrix) -> Result<Vec<i64>, ScoreError> {
            Ok(matrix
                .rows()
                .into_iter()
                .map(|row| i64::from(row[0] > 0.0))
                .collect())
        }
    }

    struct ConstantClassifier(i64);

    impl Classifier for ConstantClassifier {
        fn score(&self, matrix: &FeatureMatrix) -> Result<Vec<i64>, ScoreError> {
            Ok(vec![self.0; matrix.nrows()])
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn score(&self, _matrix: &FeatureMatrix) -> Result<Vec<i64>, ScoreError> {
            Err(ScoreError::Inference(anyhow::anyhow!("model exploded")))
        }
    }

    struct ShortClassifier;

    impl Classifier for ShortClassifier {
        fn score(&self, _matrix: &FeatureMatrix) -> Result<Vec<i64>, ScoreError> {
            Ok(vec![0])
        }
    }

    /// Tracks how many instances score at the same time
    struct SlowClassifier {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Classifier for SlowClassifier {
        fn score(&self, matrix: &FeatureMatrix) -> Result<Vec<i64>, ScoreError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![0; matrix.nrows()])
        }
    }

    fn shared(classifier: impl Classifier + 'static) -> Arc<dyn Classifier> {
        Arc::new(classifier)
    }

    fn artifacts(width: usize, classifiers: Vec<(&str, Arc<dyn Classifier>)>) -> Arc<ArtifactSet> {
        let schema = FeatureSchema::new((0..width).map(|i| format!("f{}", i))).unwrap();
        let registered = classifiers
            .into_iter()
            .map(|(name, classifier)| RegisteredClassifier {
                name: name.to_string(),
                classifier,
            })
            .collect();
        Arc::new(
            ArtifactSet::new(
                schema,
                Scaler::Identity,
                LabelDecoder::new(["Benign", "DDoS"]),
                registered,
            )
            .unwrap(),
        )
    }

    fn flows(rows: usize, width: usize) -> AlignedFlows {
        AlignedFlows {
            matrix: FeatureMatrix::from_shape_fn((rows, width), |(r, _)| {
                if r % 2 == 0 {
                    1.0
                } else {
                    -1.0
                }
            }),
            addresses: (0..rows).map(|r| format!("10.0.0.{}", r)).collect(),
        }
    }

    #[tokio::test]
    async fn test_results_bounded_by_rows_times_classifiers() {
        let classifiers: Vec<(&str, Arc<dyn Classifier>)> = ["m1", "m2", "m3", "m4", "m5", "m6"]
            .into_iter()
            .map(|name| (name, Arc::new(ThresholdClassifier) as Arc<dyn Classifier>))
            .collect();
        let predictor = EnsemblePredictor::new(
            artifacts(3, classifiers),
            PredictorConfig {
                max_rows: 5,
                max_workers: 0,
            },
        );

        let results = predictor.predict(&flows(100, 3)).await.unwrap();
        assert_eq!(results.len(), 30);
        assert!(results
            .iter()
            .all(|r| ["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]
                .contains(&r.source_address.as_str())));
    }

    #[tokio::test]
    async fn test_fewer_rows_than_bound() {
        let predictor = EnsemblePredictor::new(
            artifacts(2, vec![("rf", shared(ThresholdClassifier))]),
            PredictorConfig::default(),
        );
        let results = predictor.predict(&flows(2, 2)).await.unwrap();
        assert_eq!(
            results,
            vec![
                PredictionResult {
                    source_address: "10.0.0.0".into(),
                    label: "DDoS".into(),
                    model: Some("rf".into()),
                },
                PredictionResult {
                    source_address: "10.0.0.1".into(),
                    label: "Benign".into(),
                    model: Some("rf".into()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_classifier_does_not_suppress_others() {
        let predictor = EnsemblePredictor::new(
            artifacts(
                2,
                vec![
                    ("first", shared(ConstantClassifier(0))),
                    ("broken", shared(FailingClassifier)),
                    ("last", shared(ConstantClassifier(1))),
                ],
            ),
            PredictorConfig::default(),
        );

        let results = predictor.predict(&flows(3, 2)).await.unwrap();
        assert_eq!(results.len(), 6);
        assert!(results
            .iter()
            .all(|r| r.model.as_deref() != Some("broken")));
    }

    #[tokio::test]
    async fn test_row_major_then_registration_order() {
        let predictor = EnsemblePredictor::new(
            artifacts(
                1,
                vec![
                    ("a", shared(ConstantClassifier(0))),
                    ("b", shared(ConstantClassifier(1))),
                ],
            ),
            PredictorConfig::default(),
        );

        let results = predictor.predict(&flows(2, 1)).await.unwrap();
        let order: Vec<(&str, &str)> = results
            .iter()
            .map(|r| (r.source_address.as_str(), r.model.as_deref().unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("10.0.0.0", "a"),
                ("10.0.0.0", "b"),
                ("10.0.0.1", "a"),
                ("10.0.0.1", "b"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_class_and_short_output_skipped() {
        let predictor = EnsemblePredictor::new(
            artifacts(
                1,
                vec![
                    ("unknown", shared(ConstantClassifier(9))),
                    ("short", shared(ShortClassifier)),
                    ("ok", shared(ConstantClassifier(0))),
                ],
            ),
            PredictorConfig::default(),
        );

        let results = predictor.predict(&flows(3, 1)).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.model.as_deref() == Some("ok")));
    }

    #[tokio::test]
    async fn test_all_classifiers_failing() {
        let predictor = EnsemblePredictor::new(
            artifacts(
                1,
                vec![
                    ("x", shared(FailingClassifier)),
                    ("y", shared(FailingClassifier)),
                ],
            ),
            PredictorConfig::default(),
        );

        let err = predictor.predict(&flows(1, 1)).await.unwrap_err();
        assert!(matches!(err, PredictionError::NoClassifierSucceeded));
    }

    #[tokio::test]
    async fn test_scaling_shape_mismatch() {
        let schema = FeatureSchema::new(["a", "b", "c"]).unwrap();
        let artifacts = ArtifactSet::new(
            schema,
            Scaler::Standard {
                mean: vec![0.0; 3],
                scale: vec![1.0; 3],
            },
            LabelDecoder::new(["Benign"]),
            vec![RegisteredClassifier {
                name: "rf".into(),
                classifier: Arc::new(ConstantClassifier(0)),
            }],
        )
        .unwrap();
        let predictor = EnsemblePredictor::new(Arc::new(artifacts), PredictorConfig::default());

        let err = predictor.predict(&flows(2, 2)).await.unwrap_err();
        assert!(matches!(
            err,
            PredictionError::ScalingFailed {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let classifiers: Vec<(&str, Arc<dyn Classifier>)> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|name| {
                let classifier: Arc<dyn Classifier> = Arc::new(SlowClassifier {
                    active: active.clone(),
                    peak: peak.clone(),
                });
                (name, classifier)
            })
            .collect();

        let predictor = EnsemblePredictor::new(
            artifacts(1, classifiers),
            PredictorConfig {
                max_rows: 5,
                max_workers: 2,
            },
        );

        let results = predictor.predict(&flows(1, 1)).await.unwrap();
        assert_eq!(results.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_count_defaults_to_classifier_count() {
        let predictor = EnsemblePredictor::new(
            artifacts(
                1,
                vec![
                    ("a", shared(ConstantClassifier(0))),
                    ("b", shared(ConstantClassifier(0))),
                    ("c", shared(ConstantClassifier(0))),
                ],
            ),
            PredictorConfig::default(),
        );
        assert_eq!(predictor.worker_count(), 3);
    }
}
