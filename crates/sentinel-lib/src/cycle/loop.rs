//! Detection loop
//!
//! Drives capture, extraction, alignment, prediction and emission one cycle
//! at a time until a stop is requested. A failing stage aborts only the
//! current cycle: nothing is emitted for it, and the loop backs off before
//! trying again.

use super::ShutdownSignal;
use crate::capture::{remove_stale, PacketCapture};
use crate::emitter::ResultSink;
use crate::error::CycleError;
use crate::extraction::FlowExtraction;
use crate::health::{Component, HealthRegistry};
use crate::models::CycleState;
use crate::observability::{SentinelMetrics, StructuredLogger};
use crate::predictor::{write_filtered, EnsemblePredictor, SchemaAligner};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the detection loop
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Interface to capture from (default: eth0)
    pub interface: String,
    /// Length of each capture window (default: 5 seconds)
    pub capture_window: Duration,
    /// Where the capture window is persisted
    pub capture_path: PathBuf,
    /// Directory handed to the extractor for its CSV output
    pub output_dir: PathBuf,
    /// Upper bound on one extractor run (default: 30 seconds)
    pub extractor_timeout: Duration,
    /// Diagnostic copy of the aligned flows, `None` to skip writing it
    pub filtered_output: Option<PathBuf>,
    /// Pause after an aborted cycle (default: 1 second)
    pub retry_backoff: Duration,
    /// Pause after a successful cycle (default: 1 second)
    pub idle_pause: Duration,
    /// Stop after this many cycles, `None` to run until stopped
    pub max_cycles: Option<u64>,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            capture_window: Duration::from_secs(5),
            capture_path: PathBuf::from("/tmp/buffer.pcap"),
            output_dir: PathBuf::from("/app/service/csv"),
            extractor_timeout: Duration::from_secs(30),
            filtered_output: Some(PathBuf::from("/app/service/csv/flows_filtered.csv")),
            retry_backoff: Duration::from_secs(1),
            idle_pause: Duration::from_secs(1),
            max_cycles: None,
        }
    }
}

/// Counters returned when the loop terminates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub emitted: u64,
    pub aborted: u64,
    pub final_state: CycleState,
}

impl LoopStats {
    fn new() -> Self {
        Self {
            cycles: 0,
            emitted: 0,
            aborted: 0,
            final_state: CycleState::Idle,
        }
    }
}

/// How a cycle that did not fail ended
#[derive(Debug)]
pub(super) enum CycleOutcome {
    Emitted {
        packets: u64,
        flows: usize,
        predictions: usize,
    },
    Stopped,
}

/// The outer detection loop; exclusively owns all per-cycle state
pub struct DetectionLoop {
    capture: Arc<dyn PacketCapture>,
    extractor: Arc<dyn FlowExtraction>,
    aligner: SchemaAligner,
    predictor: EnsemblePredictor,
    sink: Box<dyn ResultSink>,
    config: CycleConfig,
    health: HealthRegistry,
    metrics: SentinelMetrics,
    logger: StructuredLogger,
    state: CycleState,
}

impl DetectionLoop {
    /// Run cycles until a stop is requested or `max_cycles` is reached
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> LoopStats {
        info!(
            interface = %self.config.interface,
            window_secs = self.config.capture_window.as_secs_f64(),
            classifiers = self.predictor.artifacts().classifiers().len(),
            "Starting detection loop"
        );

        self.health.register_pipeline().await;
        self.health.set_running(true).await;

        let mut stats = LoopStats::new();

        loop {
            if shutdown.is_requested() {
                break;
            }
            if self.config.max_cycles.is_some_and(|max| stats.cycles >= max) {
                info!(cycles = stats.cycles, "Cycle limit reached");
                break;
            }

            stats.cycles += 1;
            let cycle = stats.cycles;
            let start = Instant::now();

            match self.run_cycle(&shutdown).await {
                Ok(CycleOutcome::Emitted {
                    packets,
                    flows,
                    predictions,
                }) => {
                    let elapsed = start.elapsed();
                    stats.emitted += 1;
                    self.health.record_emit().await;
                    self.metrics.inc_cycles("emitted");
                    self.metrics.observe_cycle_duration(elapsed);
                    self.logger
                        .log_cycle_completed(cycle, packets, flows, predictions, elapsed);

                    self.transition(CycleState::Idle);
                    if shutdown.sleep(self.config.idle_pause).await {
                        break;
                    }
                }
                Ok(CycleOutcome::Stopped) => break,
                Err(e) => {
                    stats.aborted += 1;
                    self.transition(CycleState::Aborted);
                    self.record_failure(cycle, &e).await;
                    self.metrics.observe_cycle_duration(start.elapsed());

                    if shutdown.sleep(self.config.retry_backoff).await {
                        break;
                    }
                    self.transition(CycleState::Idle);
                }
            }
        }

        self.transition(CycleState::Stopped);
        self.health.set_running(false).await;
        stats.final_state = self.state;

        info!(
            cycles = stats.cycles,
            emitted = stats.emitted,
            aborted = stats.aborted,
            "Detection loop stopped"
        );

        stats
    }

    /// One capture to emit pass
    ///
    /// The stop request is checked on entry to every stage; once it is set
    /// no further stage runs and nothing is emitted.
    pub(super) async fn run_cycle(
        &mut self,
        shutdown: &ShutdownSignal,
    ) -> Result<CycleOutcome, CycleError> {
        if !self.enter(CycleState::Capturing, shutdown) {
            return Ok(CycleOutcome::Stopped);
        }
        self.remove_previous_files().await;

        let stage_start = Instant::now();
        let buffer = self
            .capture
            .capture(self.config.capture_window, &self.config.interface)
            .await?;
        self.finish_stage("capture", Component::Capture, stage_start).await;

        if !self.enter(CycleState::Extracting, shutdown) {
            return Ok(CycleOutcome::Stopped);
        }
        let stage_start = Instant::now();
        let table = self
            .extractor
            .extract(&buffer, &self.config.output_dir, self.config.extractor_timeout)
            .await?;
        self.finish_stage("extraction", Component::Extractor, stage_start)
            .await;

        if !self.enter(CycleState::Aligning, shutdown) {
            return Ok(CycleOutcome::Stopped);
        }
        let stage_start = Instant::now();
        let schema = self.predictor.artifacts().schema();
        let flows = self.aligner.align(&table, schema)?;
        self.metrics.set_flows_aligned(flows.rows());

        if let Some(path) = &self.config.filtered_output {
            if let Err(e) = write_filtered(path, &flows, schema, self.aligner.address_column()) {
                warn!(path = %path.display(), error = %e, "Failed to write filtered flows");
            }
        }
        self.metrics
            .observe_stage_duration("alignment", stage_start.elapsed());

        if !self.enter(CycleState::Predicting, shutdown) {
            return Ok(CycleOutcome::Stopped);
        }
        let stage_start = Instant::now();
        let results = self.predictor.predict(&flows).await?;
        self.finish_stage("prediction", Component::Predictor, stage_start)
            .await;

        if !self.enter(CycleState::Emitting, shutdown) {
            return Ok(CycleOutcome::Stopped);
        }
        let stage_start = Instant::now();
        self.sink.emit(&results)?;
        for result in &results {
            self.metrics.inc_prediction(&result.label);
        }
        self.finish_stage("emit", Component::Emitter, stage_start).await;

        Ok(CycleOutcome::Emitted {
            packets: buffer.packet_count,
            flows: flows.rows(),
            predictions: results.len(),
        })
    }

    /// Move to `next` unless a stop was requested, in which case stop
    fn enter(&mut self, next: CycleState, shutdown: &ShutdownSignal) -> bool {
        if shutdown.is_requested() {
            debug!(state = %self.state, "Stop observed between stages");
            self.transition(CycleState::Stopped);
            return false;
        }
        self.transition(next);
        true
    }

    fn transition(&mut self, next: CycleState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Cycle state transition");
            self.state = next;
        }
    }

    async fn finish_stage(&self, stage: &str, component: Component, start: Instant) {
        self.metrics.observe_stage_duration(stage, start.elapsed());
        self.health.record_success(component).await;
    }

    async fn record_failure(&self, cycle: u64, error: &CycleError) {
        let stage = error.stage();
        self.metrics.inc_cycles("aborted");
        self.metrics.inc_stage_error(stage);

        let reason = match error {
            CycleError::Extraction(e) => format!("{} ({})", e, e.reason()),
            other => other.to_string(),
        };
        self.logger.log_cycle_aborted(cycle, stage, &reason);

        let component = match error {
            CycleError::Capture(_) => Component::Capture,
            CycleError::Extraction(_) => Component::Extractor,
            CycleError::Alignment(_) | CycleError::Prediction(_) => Component::Predictor,
            CycleError::Emit(_) => Component::Emitter,
        };
        self.health.record_failure(component, reason).await;
    }

    /// Delete the capture, raw CSV and filtered CSV of the previous cycle
    async fn remove_previous_files(&self) {
        let raw_output = self
            .extractor
            .output_path(&self.config.capture_path, &self.config.output_dir);

        let paths = [
            Some(&self.config.capture_path),
            Some(&raw_output),
            self.config.filtered_output.as_ref(),
        ];

        for path in paths.into_iter().flatten() {
            match remove_stale(path).await {
                Ok(true) => debug!(path = %path.display(), "Removed previous cycle file"),
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove previous cycle file"),
            }
        }
    }
}

/// Builder for creating the detection loop
pub struct DetectionLoopBuilder {
    capture: Option<Arc<dyn PacketCapture>>,
    extractor: Option<Arc<dyn FlowExtraction>>,
    predictor: Option<EnsemblePredictor>,
    sink: Option<Box<dyn ResultSink>>,
    aligner: SchemaAligner,
    health: HealthRegistry,
    logger: StructuredLogger,
    config: CycleConfig,
}

impl DetectionLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            capture: None,
            extractor: None,
            predictor: None,
            sink: None,
            aligner: SchemaAligner::default(),
            health: HealthRegistry::new(),
            logger: StructuredLogger::new("unknown"),
            config: CycleConfig::default(),
        }
    }

    pub fn capture(mut self, capture: Arc<dyn PacketCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn FlowExtraction>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn predictor(mut self, predictor: EnsemblePredictor) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn sink(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn aligner(mut self, aligner: SchemaAligner) -> Self {
        self.aligner = aligner;
        self
    }

    /// Share a health registry, e.g. with the HTTP server
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(mut self, config: CycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the detection loop
    pub fn build(self) -> Result<DetectionLoop> {
        let capture = self
            .capture
            .ok_or_else(|| anyhow::anyhow!("Capture backend is required"))?;
        let extractor = self
            .extractor
            .ok_or_else(|| anyhow::anyhow!("Flow extractor is required"))?;
        let predictor = self
            .predictor
            .ok_or_else(|| anyhow::anyhow!("Predictor is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Result sink is required"))?;

        Ok(DetectionLoop {
            capture,
            extractor,
            aligner: self.aligner,
            predictor,
            sink,
            config: self.config,
            health: self.health,
            metrics: SentinelMetrics::new(),
            logger: self.logger,
            state: CycleState::Idle,
        })
    }
}

impl Default for DetectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
