//! Flow Sentinel - windowed network intrusion detector
//!
//! Captures traffic in short windows, turns each window into flow records
//! with an external extractor, scores the flows with an ensemble of
//! classifiers and prints one JSON line of verdicts per cycle on stdout.

use anyhow::{Context, Result};
use flow_sentinel::{api, config::SentinelConfig};
use sentinel_lib::{
    artifacts::ArtifactSet,
    capture::create_capture,
    cycle::{shutdown_channel, DetectionLoopBuilder, ShutdownHandle},
    emitter::JsonLinesEmitter,
    extraction::FlowExtractor,
    health::HealthRegistry,
    observability::{SentinelMetrics, StructuredLogger},
    predictor::{EnsemblePredictor, SchemaAligner},
};
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SENTINEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries verdicts only, so logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let config = SentinelConfig::load()?;
    info!(
        interface = %config.interface,
        artifact_dir = %config.artifact_dir.display(),
        "Sentinel configured"
    );

    let artifacts = ArtifactSet::load(&config.artifact_dir).with_context(|| {
        format!(
            "Failed to load model artifacts from {}",
            config.artifact_dir.display()
        )
    })?;
    let artifacts = Arc::new(artifacts);

    let metrics = SentinelMetrics::new();
    metrics.set_classifiers_loaded(artifacts.classifiers().len());

    let logger = StructuredLogger::new(&config.sensor_name);
    logger.log_startup(
        SENTINEL_VERSION,
        &config.interface,
        &artifacts.classifier_names(),
    );

    let capture = create_capture(&config.capture_settings())
        .context("Failed to set up packet capture")?;
    let extractor = FlowExtractor::new(config.extractor_path.clone())
        .with_output_name(config.raw_output_name.clone());
    let predictor = EnsemblePredictor::new(artifacts, config.predictor_config());

    let health = HealthRegistry::new();
    let detection = DetectionLoopBuilder::new()
        .capture(capture)
        .extractor(Arc::new(extractor))
        .predictor(predictor)
        .sink(Box::new(JsonLinesEmitter::stdout()))
        .aligner(SchemaAligner::new(&config.address_column))
        .health(health.clone())
        .logger(logger.clone())
        .config(config.cycle_config())
        .build()?;

    let (shutdown, shutdown_signal) = shutdown_channel();
    let sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(forward_signals(shutdown.clone(), sigint, sigterm));

    let api_handle = config.api_enabled.then(|| {
        let state = Arc::new(api::AppState::new(health.clone(), metrics.clone()));
        tokio::spawn(api::serve(config.api_port, state, shutdown.signal()))
    });

    let stats = detection.run(shutdown_signal).await;

    let reason = if shutdown.is_requested() {
        "stop requested"
    } else {
        "cycle limit reached"
    };
    logger.log_shutdown(reason, stats.cycles);

    if let Some(handle) = api_handle {
        shutdown.request("detection loop finished");
        match handle.await {
            Ok(Err(e)) => warn!(error = %e, "Health and metrics endpoint failed"),
            Err(e) => warn!(error = %e, "Health and metrics endpoint task panicked"),
            Ok(Ok(())) => {}
        }
    }

    Ok(())
}

/// Turn SIGINT and SIGTERM into stop requests
async fn forward_signals(shutdown: ShutdownHandle, mut sigint: Signal, mut sigterm: Signal) {
    loop {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        shutdown.request(name);
    }
}
