//! Core data models for the detection pipeline

use crate::error::ArtifactLoadError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use tract_onnx::prelude::tract_ndarray::Array2;

/// Numeric feature matrix, one row per flow
pub type FeatureMatrix = Array2<f32>;

/// Ordered list of the feature columns the models were trained on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureSchema {
    columns: Vec<String>,
}

impl FeatureSchema {
    /// Build a schema, rejecting empty or duplicated column lists
    pub fn new<I, S>(columns: I) -> Result<Self, ArtifactLoadError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns
            .into_iter()
            .map(|c| c.into().trim().to_string())
            .collect();

        if columns.is_empty() {
            return Err(ArtifactLoadError::EmptySchema);
        }

        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(ArtifactLoadError::DuplicateColumn(column.clone()));
            }
        }

        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<'de> Deserialize<'de> for FeatureSchema {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let columns = Vec::<String>::deserialize(deserializer)?;
        FeatureSchema::new(columns).map_err(serde::de::Error::custom)
    }
}

/// Raw tabular output of the flow extractor
///
/// `rows[0]` is the extractor's metadata row and carries no flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl FlowTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Index of a column, comparing names without surrounding whitespace
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.headers.iter().position(|h| h.trim() == name)
    }
}

/// Flow matrix aligned to the feature schema
///
/// `matrix.nrows() == addresses.len()` and `matrix.ncols()` equals the schema
/// width.
#[derive(Debug, Clone)]
pub struct AlignedFlows {
    pub matrix: FeatureMatrix,
    pub addresses: Vec<String>,
}

impl AlignedFlows {
    pub fn rows(&self) -> usize {
        self.addresses.len()
    }
}

/// One classifier verdict for one flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionResult {
    #[serde(rename = "Attacker_ip")]
    pub source_address: String,
    #[serde(rename = "Message")]
    pub label: String,
    #[serde(rename = "Model", default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Packets persisted by one capture window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBuffer {
    pub path: PathBuf,
    pub packet_count: u64,
}

/// Position of the cycle controller in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Capturing,
    Extracting,
    Aligning,
    Predicting,
    Emitting,
    Aborted,
    Stopped,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::Capturing => "capturing",
            CycleState::Extracting => "extracting",
            CycleState::Aligning => "aligning",
            CycleState::Predicting => "predicting",
            CycleState::Emitting => "emitting",
            CycleState::Aborted => "aborted",
            CycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
