//! Decoders that turn exported workout histories into raw batches.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, Trim};
use thiserror::Error;
use workout_core::{RawBatch, RawRow, Scalar};

pub const CRATE_NAME: &str = "workout-adapters";

pub const NA_TOKENS: [&str; 12] = [
    "", "NA", "N/A", "n/a", "NaN", "nan", "-nan", "null", "NULL", "None", "#N/A", "<NA>",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
}

pub fn parse_export_csv(bytes: &[u8]) -> Result<RawBatch, AdapterError> {
    parse_export_reader(bytes)
}

pub fn parse_export_reader<R: Read>(reader: R) -> Result<RawBatch, AdapterError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::Headers)
        .from_reader(reader);

    let columns: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    if columns.iter().all(String::is_empty) {
        return Err(AdapterError::Message("export has no header row".to_string()));
    }

    let records = rdr.records().collect::<Result<Vec<StringRecord>, _>>()?;
    let numeric: Vec<bool> = (0..columns.len())
        .map(|idx| column_is_numeric(&records, idx))
        .collect();

    let rows = records
        .iter()
        .map(|record| {
            let cells = columns
                .iter()
                .enumerate()
                .map(|(idx, column)| (column.clone(), infer_cell(record.get(idx), numeric[idx])))
                .collect();
            RawRow::from_cells(cells)
        })
        .collect();

    Ok(RawBatch::new(columns, rows))
}

pub fn load_export_file(path: impl AsRef<Path>) -> Result<RawBatch> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_export_csv(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn is_na(field: &str) -> bool {
    NA_TOKENS.contains(&field)
}

fn parse_number(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok()
}

fn column_is_numeric(records: &[StringRecord], idx: usize) -> bool {
    records
        .iter()
        .filter_map(|record| record.get(idx))
        .filter(|field| !is_na(field))
        .all(|field| parse_number(field).is_some())
}

fn infer_cell(field: Option<&str>, numeric: bool) -> Scalar {
    match field {
        None => Scalar::Absent,
        Some(field) if is_na(field) => Scalar::Absent,
        Some(field) if numeric => parse_number(field).map_or(Scalar::Absent, Scalar::Number),
        Some(field) => Scalar::Text(field.to_string()),
    }
}
