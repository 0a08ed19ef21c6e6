//! CSV record source.
//!
//! Reads a header row, locates the required columns by name and yields
//! validated [`TransferRecord`]s in file order. Column order is free and
//! extra columns are ignored. Quoted fields may contain commas, quotes and
//! line breaks. Blank lines and a leading UTF-8 byte order mark are skipped.
//!
//! Any missing column, missing field or unusable value aborts the load:
//! detection never runs on a partially valid ledger.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{debug, info};

use crate::error::DataError;
use crate::types::TransferRecord;

/// Accepted header names for the transaction id column, in priority order.
const TX_ID_COLUMNS: [&str; 3] = ["transaction_hash", "tx_hash", "tx_id"];

/// Column positions resolved from the header row.
#[derive(Debug, Clone, Copy)]
struct Columns {
    from: usize,
    to: usize,
    value: usize,
    tx_id: usize,
    timestamp: usize,
}

impl Columns {
    fn from_header(header: &StringRecord) -> Result<Self, DataError> {
        let names: Vec<&str> = header
            .iter()
            .map(|name| name.trim_start_matches('\u{feff}').trim())
            .collect();
        let find = |column: &'static str| {
            names
                .iter()
                .position(|&name| name == column)
                .ok_or(DataError::MissingColumn { column })
        };

        let from = find("from_address")?;
        let to = find("to_address")?;
        let value = find("value")?;
        let tx_id = TX_ID_COLUMNS
            .iter()
            .find_map(|&candidate| names.iter().position(|&name| name == candidate))
            .ok_or(DataError::MissingColumn {
                column: "transaction_hash",
            })?;

        Ok(Self {
            from,
            to,
            value,
            tx_id,
            timestamp: find("timestamp")?,
        })
    }
}

/// Load transfer records from a CSV file.
///
/// # Errors
/// Returns [`DataError::Io`] if the file cannot be opened, or the first
/// parse or validation error encountered.
pub fn load_csv(path: &Path) -> Result<Vec<TransferRecord>, DataError> {
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let records = parse_records(file, &path.display().to_string())?;
    info!(path = %path.display(), records = records.len(), "loaded transfer records");
    Ok(records)
}

/// Parse transfer records from any CSV source.
///
/// `source` names the input in errors.
///
/// # Errors
/// Returns [`DataError`] on malformed CSV, or on the first missing column,
/// missing field, non-numeric, negative or non-finite value.
pub fn parse_records<R: Read>(reader: R, source: &str) -> Result<Vec<TransferRecord>, DataError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);
    let csv_err = |source_err| DataError::Csv {
        path: source.to_string(),
        source: source_err,
    };

    let columns = Columns::from_header(reader.headers().map_err(csv_err)?)?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        if row.iter().all(str::is_empty) {
            continue;
        }

        let record = parse_row(&row, columns, records.len())?;
        record.validate(records.len())?;
        records.push(record);
    }

    debug!(source, records = records.len(), "parsed transfer records");
    Ok(records)
}

fn parse_row(row: &StringRecord, columns: Columns, record: usize) -> Result<TransferRecord, DataError> {
    let cell = |position: usize, field: &'static str| {
        row.get(position)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or(DataError::MissingField { record, field })
    };

    let from_address = cell(columns.from, "from_address")?;
    let to_address = cell(columns.to, "to_address")?;
    let raw_value = cell(columns.value, "value")?;
    let tx_id = cell(columns.tx_id, "tx_id")?;
    let timestamp = cell(columns.timestamp, "timestamp")?;

    let value = raw_value
        .parse::<f64>()
        .map_err(|_| DataError::InvalidValue {
            record,
            raw: raw_value.clone(),
        })?;

    Ok(TransferRecord {
        from_address,
        to_address,
        value,
        tx_id,
        timestamp,
    })
}
