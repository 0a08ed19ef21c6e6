//! wash-analysis crate
//!
//! Flow graph construction, cycle and neighborhood wash-trade detection,
//! blacklist aggregation and the end-to-end detection pipeline.

pub mod blacklist;
pub mod budget;
pub mod config;
pub mod cycle_detector;
pub mod error;
pub mod finding;
pub mod flow_graph;
pub mod neighbor_detector;
pub mod pipeline;

pub use error::{AnalysisError, Result};
