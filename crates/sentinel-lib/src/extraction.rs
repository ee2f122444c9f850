//! Flow feature extraction
//!
//! Runs the external flow extractor (CICFlowMeter) over a capture file and
//! reads the per-flow CSV it writes. The extractor is an opaque child
//! process: it gets the capture path and an output directory, and is killed
//! if it outlives its timeout.

use crate::error::ExtractionError;
use crate::models::{CaptureBuffer, FlowTable};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

pub use async_trait::async_trait;

/// Suffix the extractor appends to the capture file stem
pub const RAW_OUTPUT_SUFFIX: &str = "_ISCX.csv";

/// Extractor stderr kept in errors, in bytes
const STDERR_TAIL_BYTES: usize = 1024;

/// Trait for flow extraction implementations
#[async_trait]
pub trait FlowExtraction: Send + Sync {
    /// Turn `buffer` into a flow table, writing intermediate files under
    /// `output_dir`
    async fn extract(
        &self,
        buffer: &CaptureBuffer,
        output_dir: &Path,
        timeout: Duration,
    ) -> Result<FlowTable, ExtractionError>;

    /// Path of the raw CSV produced for `capture_path`
    fn output_path(&self, capture_path: &Path, output_dir: &Path) -> PathBuf;
}

/// Invokes an external extractor as `<program> <capture> <output dir>`
#[derive(Debug, Clone)]
pub struct FlowExtractor {
    program: PathBuf,
    leading_args: Vec<String>,
    output_name: Option<String>,
}

impl FlowExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            output_name: None,
        }
    }

    /// Arguments placed before the capture path
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Read the raw CSV from `name` instead of `<capture stem>_ISCX.csv`
    pub fn with_output_name(mut self, name: Option<String>) -> Self {
        self.output_name = name;
        self
    }
}

#[async_trait]
impl FlowExtraction for FlowExtractor {
    async fn extract(
        &self,
        buffer: &CaptureBuffer,
        output_dir: &Path,
        timeout: Duration,
    ) -> Result<FlowTable, ExtractionError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let output = self.output_path(&buffer.path, output_dir);
        let start = Instant::now();

        let child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(&buffer.path)
            .arg(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExtractionError::Spawn {
                path: self.program.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it
        let finished = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ExtractionError::Timeout(timeout))??;

        if !finished.status.success() {
            return Err(ExtractionError::NonZeroExit {
                code: finished.status.code(),
                stderr: stderr_tail(&finished.stderr),
            });
        }

        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(ExtractionError::MissingOutput(output));
        }

        let table = read_flow_table(&output).await?;

        info!(
            packets = buffer.packet_count,
            rows = table.rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Flow extraction complete"
        );

        Ok(table)
    }

    fn output_path(&self, capture_path: &Path, output_dir: &Path) -> PathBuf {
        match &self.output_name {
            Some(name) => output_dir.join(name),
            None => {
                let stem = capture_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "capture".to_string());
                output_dir.join(format!("{}{}", stem, RAW_OUTPUT_SUFFIX))
            }
        }
    }
}

/// Last part of the extractor's stderr, lossily decoded
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut cut = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text[cut..].to_string()
}

/// Read an extractor CSV into a flow table
///
/// Rows may have a different number of cells than the header.
pub async fn read_flow_table(path: &Path) -> Result<FlowTable, ExtractionError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_flow_table_blocking(&owned))
        .await
        .map_err(|e| ExtractionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn read_flow_table_blocking(path: &Path) -> Result<FlowTable, ExtractionError> {
    let read_error = |source| ExtractionError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(read_error)?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(read_error)?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(read_error)?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    debug!(path = %path.display(), rows = rows.len(), "Read flow table");
    Ok(FlowTable::new(headers, rows))
}
