//! Sentinel configuration

use anyhow::{bail, Context, Result};
use sentinel_lib::capture::{CaptureBackend, CaptureSettings};
use sentinel_lib::cycle::CycleConfig;
use sentinel_lib::predictor::{PredictorConfig, DEFAULT_ADDRESS_COLUMN, DEFAULT_MAX_ROWS};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "SENTINEL_CONFIG";

const ENV_PREFIX: &str = "SENTINEL";

/// Sentinel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    /// Network interface to capture from
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Capture window length in seconds
    #[serde(default = "default_capture_window")]
    pub capture_window_secs: u64,

    #[serde(default = "default_capture_backend")]
    pub capture_backend: CaptureBackend,

    /// Capture command line for the command backend
    #[serde(default = "default_capture_command")]
    pub capture_command: String,

    #[serde(default = "default_capture_path")]
    pub capture_path: PathBuf,

    /// Flow extractor executable (CICFlowMeter)
    #[serde(default = "default_extractor_path")]
    pub extractor_path: PathBuf,

    #[serde(default = "default_extractor_timeout")]
    pub extractor_timeout_secs: u64,

    /// Directory the extractor writes its CSV into
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Raw extractor CSV name, derived from the capture file when unset
    #[serde(default)]
    pub raw_output_name: Option<String>,

    #[serde(default = "default_filtered_output_name")]
    pub filtered_output_name: String,

    /// Write the aligned flows next to the raw CSV
    #[serde(default = "default_true")]
    pub write_filtered: bool,

    /// Directory holding manifest.json and the model artifacts
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    #[serde(default = "default_address_column")]
    pub address_column: String,

    /// Flows scored per cycle
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Concurrent classifier workers, 0 for one per classifier
    #[serde(default)]
    pub max_workers: usize,

    #[serde(default = "default_pause_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_pause_ms")]
    pub idle_pause_ms: u64,

    /// Stop after this many cycles
    #[serde(default)]
    pub max_cycles: Option<u64>,

    /// Name attached to every lifecycle log event
    #[serde(default = "default_sensor_name")]
    pub sensor_name: String,

    /// Serve health and metrics over HTTP
    #[serde(default)]
    pub api_enabled: bool,

    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_capture_window() -> u64 {
    5
}

fn default_capture_backend() -> CaptureBackend {
    CaptureBackend::Command
}

fn default_capture_command() -> String {
    "tcpdump".to_string()
}

fn default_capture_path() -> PathBuf {
    PathBuf::from("/tmp/buffer.pcap")
}

fn default_extractor_path() -> PathBuf {
    PathBuf::from("/app/service/CICFlowMeter-4.0/bin/CICFlowMeter")
}

fn default_extractor_timeout() -> u64 {
    30
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/app/service/csv")
}

fn default_filtered_output_name() -> String {
    "flows_filtered.csv".to_string()
}

fn default_true() -> bool {
    true
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("/app/service/saved_models")
}

fn default_address_column() -> String {
    DEFAULT_ADDRESS_COLUMN.to_string()
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}

fn default_pause_ms() -> u64 {
    1000
}

fn default_sensor_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl SentinelConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file, None)
    }

    /// Load from `file` and an environment map (the process environment
    /// when `None`); environment values win
    pub fn load_from(file: Option<PathBuf>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = &file {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            bail!("interface must not be empty");
        }
        if self.capture_window_secs == 0 {
            bail!("capture_window_secs must be greater than zero");
        }
        if self.extractor_timeout_secs == 0 {
            bail!("extractor_timeout_secs must be greater than zero");
        }
        if self.max_rows == 0 {
            bail!("max_rows must be greater than zero");
        }
        if self.address_column.trim().is_empty() {
            bail!("address_column must not be empty");
        }
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            backend: self.capture_backend,
            command: self.capture_command.clone(),
            path: self.capture_path.clone(),
        }
    }

    pub fn predictor_config(&self) -> PredictorConfig {
        PredictorConfig {
            max_rows: self.max_rows,
            max_workers: self.max_workers,
        }
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            interface: self.interface.clone(),
            capture_window: Duration::from_secs(self.capture_window_secs),
            capture_path: self.capture_path.clone(),
            output_dir: self.output_dir.clone(),
            extractor_timeout: Duration::from_secs(self.extractor_timeout_secs),
            filtered_output: self
                .write_filtered
                .then(|| self.output_dir.join(&self.filtered_output_name)),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            idle_pause: Duration::from_millis(self.idle_pause_ms),
            max_cycles: self.max_cycles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::assert_err;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = SentinelConfig::load_from(None, env(&[])).unwrap();

        assert_eq!(config.interface, "eth0");
        assert_eq!(config.capture_window_secs, 5);
        assert_eq!(config.capture_backend, CaptureBackend::Command);
        assert_eq!(config.capture_path, PathBuf::from("/tmp/buffer.pcap"));
        assert_eq!(config.extractor_timeout_secs, 30);
        assert_eq!(config.max_rows, 5);
        assert_eq!(config.max_workers, 0);
        assert_eq!(config.address_column, "Src IP");
        assert!(config.write_filtered);
        assert!(!config.api_enabled);
        assert_eq!(config.raw_output_name, None);
        assert_eq!(config.max_cycles, None);
    }

    #[test]
    fn test_environment_overrides() {
        let config = SentinelConfig::load_from(
            None,
            env(&[
                ("SENTINEL_INTERFACE", "ens5"),
                ("SENTINEL_CAPTURE_WINDOW_SECS", "10"),
                ("SENTINEL_MAX_ROWS", "20"),
                ("SENTINEL_API_ENABLED", "true"),
                ("SENTINEL_CAPTURE_COMMAND", "sudo tcpdump"),
            ]),
        )
        .unwrap();

        assert_eq!(config.interface, "ens5");
        assert_eq!(config.capture_window_secs, 10);
        assert_eq!(config.max_rows, 20);
        assert!(config.api_enabled);
        assert_eq!(config.capture_command, "sudo tcpdump");
    }

    #[test]
    fn test_file_then_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "interface = \"wlan0\"\nmax_workers = 2\nartifact_dir = \"/models\""
        )
        .unwrap();

        let config = SentinelConfig::load_from(
            Some(file.path().to_path_buf()),
            env(&[("SENTINEL_MAX_WORKERS", "4")]),
        )
        .unwrap();

        assert_eq!(config.interface, "wlan0");
        assert_eq!(config.artifact_dir, PathBuf::from("/models"));
        assert_eq!(config.max_workers, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_err!(SentinelConfig::load_from(
            None,
            env(&[("SENTINEL_CAPTURE_WINDOW_SECS", "0")])
        ));
        assert_err!(SentinelConfig::load_from(None, env(&[("SENTINEL_MAX_ROWS", "0")])));
        assert_err!(SentinelConfig::load_from(
            None,
            env(&[("SENTINEL_API_PORT", "not-a-port")])
        ));
        assert_err!(SentinelConfig::load_from(
            Some(PathBuf::from("/nonexistent/sentinel.toml")),
            env(&[])
        ));
    }

    #[test]
    fn test_cycle_config_mapping() {
        let config = SentinelConfig::load_from(
            None,
            env(&[
                ("SENTINEL_OUTPUT_DIR", "/data/csv"),
                ("SENTINEL_RETRY_BACKOFF_MS", "250"),
            ]),
        )
        .unwrap();

        let cycle = config.cycle_config();
        assert_eq!(cycle.capture_window, Duration::from_secs(5));
        assert_eq!(cycle.retry_backoff, Duration::from_millis(250));
        assert_eq!(
            cycle.filtered_output,
            Some(PathBuf::from("/data/csv/flows_filtered.csv"))
        );

        let config =
            SentinelConfig::load_from(None, env(&[("SENTINEL_WRITE_FILTERED", "false")])).unwrap();
        assert_eq!(config.cycle_config().filtered_output, None);
    }
}
