//! Schema alignment
//!
//! Reconciles the extractor's flow table with the feature schema the models
//! were trained on. The extractor and the training pipeline evolve
//! independently, so the table may lack schema columns or carry extra ones;
//! the aligned matrix always has exactly the schema's columns, in order.

use crate::error::AlignmentError;
use crate::models::{AlignedFlows, FeatureMatrix, FeatureSchema, FlowTable};
use std::path::Path;
use tracing::debug;

/// Column holding the flow's source address in CICFlowMeter output
pub const DEFAULT_ADDRESS_COLUMN: &str = "Src IP";

/// Aligns flow tables to a feature schema
#[derive(Debug, Clone)]
pub struct SchemaAligner {
    address_column: String,
}

impl Default for SchemaAligner {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS_COLUMN)
    }
}

impl SchemaAligner {
    pub fn new(address_column: impl Into<String>) -> Self {
        Self {
            address_column: address_column.into(),
        }
    }

    pub fn address_column(&self) -> &str {
        &self.address_column
    }

    /// Align `table` to `schema`
    ///
    /// Row 0 is extractor metadata and is skipped. Cells that do not parse as a
    /// finite number are missing; rows with nothing but missing cells are
    /// dropped along with their address. Schema columns absent from the table,
    /// and missing cells in kept rows, become zero.
    pub fn align(
        &self,
        table: &FlowTable,
        schema: &FeatureSchema,
    ) -> Result<AlignedFlows, AlignmentError> {
        if table.rows.len() <= 1 {
            return Err(AlignmentError::Empty);
        }

        let address_idx = table
            .column_index(&self.address_column)
            .ok_or_else(|| AlignmentError::MissingAddressColumn(self.address_column.clone()))?;

        // Schema position -> table column, first match wins
        let source_columns: Vec<Option<usize>> = schema
            .columns()
            .iter()
            .map(|name| {
                table
                    .headers
                    .iter()
                    .enumerate()
                    .position(|(idx, header)| idx != address_idx && header.trim() == name.as_str())
            })
            .collect();

        let missing = source_columns.iter().filter(|c| c.is_none()).count();
        if missing > 0 {
            debug!(missing, "Schema columns absent from flow table, filling with zero");
        }

        let mut addresses = Vec::with_capacity(table.rows.len() - 1);
        let mut values = Vec::with_capacity((table.rows.len() - 1) * schema.len());
        let mut dropped = 0usize;

        for row in table.rows.iter().skip(1) {
            let cells: Vec<Option<f32>> = (0..table.headers.len())
                .map(|idx| {
                    if idx == address_idx {
                        None
                    } else {
                        row.get(idx).and_then(|cell| parse_cell(cell))
                    }
                })
                .collect();

            if cells.iter().all(Option::is_none) {
                dropped += 1;
                continue;
            }

            addresses.push(
                row.get(address_idx)
                    .map(|a| a.trim().to_string())
                    .unwrap_or_default(),
            );
            values.extend(
                source_columns
                    .iter()
                    .map(|src| src.and_then(|idx| cells[idx]).unwrap_or(0.0)),
            );
        }

        if dropped > 0 {
            debug!(dropped, "Dropped flow rows without numeric values");
        }

        if addresses.is_empty() {
            return Err(AlignmentError::Empty);
        }

        let matrix = FeatureMatrix::from_shape_vec((addresses.len(), schema.len()), values)
            .map_err(|_| AlignmentError::Empty)?;

        Ok(AlignedFlows { matrix, addresses })
    }
}

/// Coerce one cell to a finite number
///
/// Finite values beyond the `f32` range saturate at `f32::MIN`/`f32::MAX`.
fn parse_cell(cell: &str) -> Option<f32> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    cell.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(f32::MIN as f64, f32::MAX as f64) as f32)
}

/// Write the aligned flows as CSV: address column, then the schema columns
pub fn write_filtered(
    path: &Path,
    flows: &AlignedFlows,
    schema: &FeatureSchema,
    address_column: &str,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;

    writer.write_record(
        std::iter::once(address_column).chain(schema.columns().iter().map(String::as_str)),
    )?;

    for (address, row) in flows.addresses.iter().zip(flows.matrix.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(address.clone());
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}
