//! Input validation errors.
//!
//! Every variant is fatal: a run aborts before graph construction.

use thiserror::Error;

/// Malformed or missing transfer data.
#[derive(Debug, Error)]
pub enum DataError {
    /// A record source or list file could not be read or written.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The record source is not well-formed CSV.
    #[error("malformed CSV in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// A required column is absent from the CSV header.
    #[error("record source is missing required column `{column}`")]
    MissingColumn { column: &'static str },

    /// A required field is empty.
    #[error("record {record}: required field `{field}` is missing")]
    MissingField { record: usize, field: &'static str },

    /// The value field is not a number.
    #[error("record {record}: value `{raw}` is not numeric")]
    InvalidValue { record: usize, raw: String },

    /// The value field is negative.
    #[error("record {record}: value {value} is negative")]
    NegativeValue { record: usize, value: f64 },

    /// The value field is NaN or infinite.
    #[error("record {record}: value is not finite")]
    NonFiniteValue { record: usize },
}
