//! Library for the flow sentinel network intrusion detector
//!
//! This crate provides the core functionality for:
//! - Windowed packet capture
//! - Flow feature extraction through an external extractor
//! - Schema alignment and ensemble classification of flows
//! - Per-cycle verdict emission
//! - Health checks and observability

pub mod artifacts;
pub mod capture;
pub mod cycle;
pub mod emitter;
pub mod error;
pub mod extraction;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;

pub use artifacts::ArtifactSet;
pub use error::{
    AlignmentError, ArtifactLoadError, CaptureError, CycleError, EmitError, ExtractionError,
    PredictionError,
};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthReport, ReadinessReport,
};
pub use models::*;
pub use observability::{SentinelMetrics, StructuredLogger};
