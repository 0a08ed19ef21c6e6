//! Shared test helpers and utilities.
//!
//! Factory functions for transfer records and small canonical graphs.

#![allow(dead_code)]

use wash_analysis::budget::CancellationToken;
use wash_analysis::config::DetectionConfig;
use wash_analysis::pipeline::{run_detection, DetectionReport};
use wash_data::store::LedgerStore;
use wash_data::TransferRecord;

/// Creates an in-memory SQLite ledger with all migrations applied.
///
/// # Panics
/// Panics if the in-memory database cannot be created (should never happen).
pub fn test_ledger() -> LedgerStore {
    LedgerStore::new(":memory:").expect("in-memory ledger should always open")
}

/// Creates a transfer record with a fixed timestamp.
pub fn rec(from: &str, to: &str, value: f64, tx: &str) -> TransferRecord {
    TransferRecord::new(from, to, value, tx, "1700000000")
}

/// A → B → C → A, 100 each.
pub fn triangle() -> Vec<TransferRecord> {
    vec![
        rec("A", "B", 100.0, "t1"),
        rec("B", "C", 100.0, "t2"),
        rec("C", "A", 100.0, "t3"),
    ]
}

/// `center` sends 1.0 to each of `leaves` distinct addresses.
pub fn star(center: &str, leaves: usize) -> Vec<TransferRecord> {
    (0..leaves)
        .map(|i| rec(center, &format!("{center}-leaf{i}"), 1.0, &format!("{center}-t{i}")))
        .collect()
}

/// Deterministic pseudo-random transfer set over `addresses` addresses.
///
/// Linear congruential generator so every run sees the same records.
pub fn scattered(addresses: u64, count: usize, seed: u64) -> Vec<TransferRecord> {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        state >> 33
    };
    (0..count)
        .map(|i| {
            let from = next() % addresses;
            let mut to = next() % addresses;
            if to == from {
                to = (to + 1) % addresses;
            }
            let value = (next() % 1000) as f64 / 10.0;
            rec(
                &format!("0x{from:04x}"),
                &format!("0x{to:04x}"),
                value,
                &format!("0x{i:08x}"),
            )
        })
        .collect()
}

/// Default configuration with a custom key-node degree.
pub fn config_with_min_degree(min_degree: usize) -> DetectionConfig {
    DetectionConfig {
        min_degree_for_key_node: min_degree,
        ..DetectionConfig::default()
    }
}

/// Runs the full pipeline with a fresh cancellation token.
///
/// # Panics
/// Panics if detection fails.
pub fn detect(records: Vec<TransferRecord>, config: &DetectionConfig) -> DetectionReport {
    run_detection(records, config, &CancellationToken::new(), 1).expect("detection should succeed")
}
