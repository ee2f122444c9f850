//! Result emission
//!
//! Each successful cycle produces exactly one line on the sink: a JSON array
//! of verdicts, flushed immediately so a downstream reader sees it at once.

use crate::error::EmitError;
use crate::models::PredictionResult;
use std::io::{self, Write};

/// Destination for per-cycle verdict batches
pub trait ResultSink: Send + Sync {
    fn emit(&mut self, results: &[PredictionResult]) -> Result<(), EmitError>;
}

/// Writes each batch as one newline-terminated JSON array
pub struct JsonLinesEmitter<W: Write> {
    writer: W,
}

impl JsonLinesEmitter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> JsonLinesEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send + Sync> ResultSink for JsonLinesEmitter<W> {
    fn emit(&mut self, results: &[PredictionResult]) -> Result<(), EmitError> {
        // Serialize fully first so a failure never leaves half a line behind
        let mut line = serde_json::to_vec(results)?;
        line.push(b'\n');

        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }
}
