//! wash-data crate
//!
//! Transfer record types, the CSV record source, the blacklist list file
//! and the SQLite audit ledger.

pub mod blacklist_file;
pub mod error;
pub mod loader;
pub mod store;
pub mod types;

pub use error::DataError;
pub use types::{EvidenceTx, TransferRecord};
