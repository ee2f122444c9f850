//! Error types for each pipeline stage
//!
//! Every stage returns its own error enum. The cycle controller wraps them in
//! [`CycleError`], logs the stage and reason, and backs off. Only
//! [`ArtifactLoadError`] is fatal, and it can only occur before the loop starts.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure while loading the persisted model artifacts at startup
#[derive(Debug, Error)]
pub enum ArtifactLoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("feature schema is empty")]
    EmptySchema,

    #[error("feature schema lists column '{0}' more than once")]
    DuplicateColumn(String),

    #[error("scaler expects {actual} features but the schema has {expected}")]
    ScalerWidth { expected: usize, actual: usize },

    #[error("scaler parameter vectors differ in length ({0} vs {1})")]
    InconsistentScaler(usize, usize),

    #[error("label encoder has no classes")]
    EmptyLabelEncoder,

    #[error("manifest declares no classifiers")]
    NoClassifiers,

    #[error("classifier '{0}' is declared more than once")]
    DuplicateClassifier(String),

    #[error("checksum mismatch for classifier '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("failed to load classifier '{name}': {source}")]
    Model {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Failure of the capture window
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No packets were observed during the window
    #[error("no packets captured")]
    Empty,

    #[error("failed to start capture command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("capture device error: {0}")]
    Device(String),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of the external flow extractor
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to start extractor {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("extractor exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),

    #[error("extractor output {} not found", .0.display())]
    MissingOutput(PathBuf),

    #[error("failed to read extractor output {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("extractor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractionError {
    /// Short diagnostic reason, used as a log and metric label
    pub fn reason(&self) -> &'static str {
        match self {
            ExtractionError::Spawn { .. } => "spawn",
            ExtractionError::NonZeroExit { .. } => "exit_status",
            ExtractionError::Timeout(_) => "timeout",
            ExtractionError::MissingOutput(_) => "missing_output",
            ExtractionError::Read { .. } => "unreadable_output",
            ExtractionError::Io(_) => "io",
        }
    }
}

/// Failure to reconcile the flow table with the feature schema
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlignmentError {
    /// No usable flow rows remained
    #[error("flow table has no usable rows")]
    Empty,

    #[error("flow table has no '{0}' column")]
    MissingAddressColumn(String),
}

/// Failure inside the ensemble predictor
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("scaling failed: matrix has {actual} columns, scaler expects {expected}")]
    ScalingFailed { expected: usize, actual: usize },

    #[error("classifier '{model}' failed: {reason}")]
    ClassifierFailed { model: String, reason: String },

    #[error("no classifier produced a prediction")]
    NoClassifierSucceeded,
}

/// Failure of a single classifier invocation
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("inference failed: {0}")]
    Inference(#[from] anyhow::Error),

    #[error("classifier returned {actual} class ids for {expected} rows")]
    RowCount { expected: usize, actual: usize },

    #[error("class id {0} is not known to the label encoder")]
    UnknownClass(i64),
}

/// Failure to write the cycle's record to the sink
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to serialize results: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write results: {0}")]
    Io(#[from] std::io::Error),
}

/// Any recoverable failure that aborts a single cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Alignment(#[from] AlignmentError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error(transparent)]
    Emit(#[from] EmitError),
}

impl CycleError {
    /// Name of the stage that failed
    pub fn stage(&self) -> &'static str {
        match self {
            CycleError::Capture(_) => "capture",
            CycleError::Extraction(_) => "extraction",
            CycleError::Alignment(_) => "alignment",
            CycleError::Prediction(_) => "prediction",
            CycleError::Emit(_) => "emit",
        }
    }
}
