//! Persisted model artifacts
//!
//! Loaded once at startup from the artifact directory and shared read-only by
//! every cycle. The directory is described by `manifest.json`, which lists the
//! classifiers explicitly; nothing is discovered by scanning the directory.

mod labels;
mod scaler;

pub use labels::LabelDecoder;
pub use scaler::Scaler;

use crate::error::ArtifactLoadError;
use crate::models::FeatureSchema;
use crate::predictor::{Classifier, OnnxClassifier};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the manifest file inside the artifact directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Artifact directory manifest
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_schema_file")]
    pub schema: PathBuf,
    #[serde(default = "default_scaler_file")]
    pub scaler: PathBuf,
    #[serde(default = "default_label_encoder_file")]
    pub label_encoder: PathBuf,
    pub classifiers: Vec<ClassifierEntry>,
}

/// One registered classifier
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierEntry {
    pub name: String,
    pub path: PathBuf,
    /// Hex-encoded SHA-256 of the model file
    #[serde(default)]
    pub sha256: Option<String>,
}

fn default_schema_file() -> PathBuf {
    PathBuf::from("feature_columns.json")
}

fn default_scaler_file() -> PathBuf {
    PathBuf::from("scaler.json")
}

fn default_label_encoder_file() -> PathBuf {
    PathBuf::from("label_encoder.json")
}

/// A classifier together with the name it was registered under
#[derive(Clone)]
pub struct RegisteredClassifier {
    pub name: String,
    pub classifier: Arc<dyn Classifier>,
}

impl std::fmt::Debug for RegisteredClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredClassifier")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Everything the predictor needs, immutable after load
#[derive(Debug)]
pub struct ArtifactSet {
    schema: FeatureSchema,
    scaler: Scaler,
    labels: LabelDecoder,
    classifiers: Vec<RegisteredClassifier>,
}

impl ArtifactSet {
    /// Assemble an artifact set, validating that the parts agree
    pub fn new(
        schema: FeatureSchema,
        scaler: Scaler,
        labels: LabelDecoder,
        classifiers: Vec<RegisteredClassifier>,
    ) -> Result<Self, ArtifactLoadError> {
        let scaler = scaler
            .normalized()
            .map_err(|(left, right)| ArtifactLoadError::InconsistentScaler(left, right))?;

        if let Some(width) = scaler.width() {
            if width != schema.len() {
                return Err(ArtifactLoadError::ScalerWidth {
                    expected: schema.len(),
                    actual: width,
                });
            }
        }

        if labels.is_empty() {
            return Err(ArtifactLoadError::EmptyLabelEncoder);
        }

        if classifiers.is_empty() {
            return Err(ArtifactLoadError::NoClassifiers);
        }

        let mut names = HashSet::with_capacity(classifiers.len());
        for entry in &classifiers {
            if !names.insert(entry.name.as_str()) {
                return Err(ArtifactLoadError::DuplicateClassifier(entry.name.clone()));
            }
        }

        Ok(Self {
            schema,
            scaler,
            labels,
            classifiers,
        })
    }

    /// Load every artifact from `dir`, building classifiers with tract
    pub fn load(dir: &Path) -> Result<Self, ArtifactLoadError> {
        Self::load_with(dir, |entry, bytes, width| {
            let classifier = OnnxClassifier::from_bytes(&entry.name, bytes, width)?;
            Ok(Arc::new(classifier) as Arc<dyn Classifier>)
        })
    }

    /// Load every artifact from `dir` with a custom classifier loader
    ///
    /// The loader receives the manifest entry, the verified model bytes and the
    /// schema width.
    pub fn load_with<F>(dir: &Path, mut load_classifier: F) -> Result<Self, ArtifactLoadError>
    where
        F: FnMut(&ClassifierEntry, &[u8], usize) -> anyhow::Result<Arc<dyn Classifier>>,
    {
        let manifest: Manifest = read_json(&dir.join(MANIFEST_FILE))?;
        let schema: FeatureSchema = read_json(&dir.join(&manifest.schema))?;
        let scaler: Scaler = read_json(&dir.join(&manifest.scaler))?;
        let labels: LabelDecoder = read_json(&dir.join(&manifest.label_encoder))?;

        info!(
            features = schema.len(),
            classes = labels.classes().len(),
            "Loaded feature schema, scaler and label encoder"
        );

        let mut classifiers = Vec::with_capacity(manifest.classifiers.len());
        for entry in &manifest.classifiers {
            let path = dir.join(&entry.path);
            let bytes = fs::read(&path).map_err(|source| ArtifactLoadError::Io {
                path: path.clone(),
                source,
            })?;

            if let Some(expected) = &entry.sha256 {
                let actual = compute_checksum(&bytes);
                if !actual.eq_ignore_ascii_case(expected.trim()) {
                    return Err(ArtifactLoadError::ChecksumMismatch {
                        name: entry.name.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }
                debug!(model = %entry.name, checksum = %actual, "Model checksum validated");
            }

            let classifier = load_classifier(entry, &bytes, schema.len()).map_err(|source| {
                ArtifactLoadError::Model {
                    name: entry.name.clone(),
                    source,
                }
            })?;

            info!(model = %entry.name, size = bytes.len(), "Loaded classifier");
            classifiers.push(RegisteredClassifier {
                name: entry.name.clone(),
                classifier,
            });
        }

        Self::new(schema, scaler, labels, classifiers)
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    pub fn labels(&self) -> &LabelDecoder {
        &self.labels
    }

    /// Classifiers in registration order
    pub fn classifiers(&self) -> &[RegisteredClassifier] {
        &self.classifiers
    }

    pub fn classifier_names(&self) -> Vec<&str> {
        self.classifiers.iter().map(|c| c.name.as_str()).collect()
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactLoadError> {
    let content = fs::read(path).map_err(|source| ArtifactLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&content).map_err(|source| ArtifactLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Compute the hex-encoded SHA-256 of a model file
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
