//! Error type of the detection library.
//!
//! Only fatal conditions live here. Search caps are reported through
//! [`crate::budget::BudgetExceeded`] diagnostics instead.

use thiserror::Error;
use wash_data::DataError;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Malformed input records; raised before graph construction.
    #[error(transparent)]
    Data(#[from] DataError),

    /// Invalid run configuration; raised before any detector runs.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;
