//! End-to-end detection pass.
//!
//! 1. Validate the run configuration
//! 2. Build the flow graph (sequential or sharded)
//! 3. Run the enabled detectors side by side on the rayon pool
//! 4. Fold every finding into the blacklist
//!
//! Each detector gets its own step budget; the deadline and the
//! cancellation token are shared.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};
use wash_data::store::{FindingRow, RunRow};
use wash_data::TransferRecord;

use crate::blacklist::Blacklist;
use crate::budget::{BudgetTally, CancellationToken, SearchBudget};
use crate::config::DetectionConfig;
use crate::cycle_detector::{CycleDetection, CycleDetector};
use crate::error::Result;
use crate::finding::WashTradeFinding;
use crate::flow_graph::FlowGraph;
use crate::neighbor_detector::{NeighborDetection, NeighborDetector};

/// Counters describing one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunDiagnostics {
    pub records: usize,
    pub nodes: usize,
    pub edges: usize,
    pub cycles_enumerated: usize,
    pub unique_cycles: usize,
    pub expansions: usize,
    pub pairs_checked: usize,
    /// Caps hit by both detectors combined.
    pub budget_events: BudgetTally,
    /// Whether any detector stopped before finishing.
    pub truncated: bool,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub cycle_findings: Vec<WashTradeFinding>,
    pub pair_findings: Vec<WashTradeFinding>,
    pub blacklist: Blacklist,
    pub diagnostics: RunDiagnostics,
}

impl DetectionReport {
    /// Blacklisted addresses, sorted.
    pub fn addresses(&self) -> BTreeSet<String> {
        self.blacklist.addresses()
    }

    pub fn findings(&self) -> impl Iterator<Item = &WashTradeFinding> + '_ {
        self.cycle_findings.iter().chain(self.pair_findings.iter())
    }

    /// Rows for [`wash_data::store::LedgerStore::insert_findings`].
    pub fn finding_rows(&self) -> Vec<FindingRow> {
        self.findings()
            .map(|finding| FindingRow {
                kind: finding.kind.as_str().to_string(),
                nodes: finding.nodes.clone(),
                rate: finding.rate,
                tx_count: finding.transactions.len() as u64,
                volume: finding.volume(),
            })
            .collect()
    }

    /// Row for [`wash_data::store::LedgerStore::insert_run`].
    pub fn run_row(&self, config: &DetectionConfig) -> RunRow {
        RunRow {
            record_count: self.diagnostics.records as u64,
            threshold: config.suspicion_threshold,
            truncated: self.diagnostics.truncated,
        }
    }
}

/// Build the graph from `records` and run detection on it.
///
/// `shards > 1` builds the graph with [`FlowGraph::build_sharded`]; the
/// result is identical either way.
///
/// # Errors
/// Returns [`crate::AnalysisError`] if the configuration is invalid or a
/// record is malformed. Search caps never fail the run.
#[tracing::instrument(skip_all, fields(records = records.len(), shards = shards))]
pub fn run_detection(
    records: Vec<TransferRecord>,
    config: &DetectionConfig,
    token: &CancellationToken,
    shards: usize,
) -> Result<DetectionReport> {
    config.validate()?;
    let graph = if shards > 1 {
        FlowGraph::build_sharded(records, shards)?
    } else {
        FlowGraph::build(records)?
    };
    detect(&graph, config, token)
}

/// Run the enabled detectors over an already built graph.
///
/// # Errors
/// Returns [`crate::AnalysisError::Config`] if the configuration is invalid.
#[tracing::instrument(skip_all, fields(nodes = graph.node_count(), algorithm = ?config.algorithm))]
pub fn detect(graph: &FlowGraph, config: &DetectionConfig, token: &CancellationToken) -> Result<DetectionReport> {
    config.validate()?;

    let budget = || SearchBudget::new(config.max_search_steps, config.timeout(), token.clone());
    let cycle_budget = budget();
    let neighbor_budget = budget();

    let run_cycles = || {
        config
            .algorithm
            .runs_cycle()
            .then(|| CycleDetector::from_config(graph, config).detect(&cycle_budget))
    };
    let run_neighbors = || {
        config
            .algorithm
            .runs_neighbor()
            .then(|| NeighborDetector::from_config(graph, config).detect(&neighbor_budget))
    };
    let (cycles, neighbors): (Option<CycleDetection>, Option<NeighborDetection>) =
        rayon::join(run_cycles, run_neighbors);

    let mut diagnostics = RunDiagnostics {
        records: graph.records().len(),
        nodes: graph.node_count(),
        edges: graph.edge_count(),
        ..RunDiagnostics::default()
    };

    let cycle_findings = match cycles {
        Some(detection) => {
            diagnostics.cycles_enumerated = detection.cycles_enumerated;
            diagnostics.unique_cycles = detection.unique_cycles;
            diagnostics.budget_events.merge(&detection.budget);
            detection.findings
        }
        None => Vec::new(),
    };
    let pair_findings = match neighbors {
        Some(detection) => {
            diagnostics.expansions = detection.expansions;
            diagnostics.pairs_checked = detection.pairs_checked;
            diagnostics.budget_events.merge(&detection.budget);
            detection.findings
        }
        None => Vec::new(),
    };
    diagnostics.truncated = diagnostics.budget_events.truncated();

    let mut blacklist = Blacklist::new();
    blacklist.add_findings(&cycle_findings);
    blacklist.add_findings(&pair_findings);

    if diagnostics.truncated {
        warn!("detection truncated; blacklist reflects partial results");
    }
    info!(
        cycle_findings = cycle_findings.len(),
        pair_findings = pair_findings.len(),
        blacklisted = blacklist.len(),
        "detection run completed"
    );

    Ok(DetectionReport {
        cycle_findings,
        pair_findings,
        blacklist,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Algorithm;
    use crate::error::AnalysisError;

    fn rec(from: &str, to: &str, value: f64, tx: &str) -> TransferRecord {
        TransferRecord::new(from, to, value, tx, "1700000000")
    }

    fn triangle() -> Vec<TransferRecord> {
        vec![
            rec("A", "B", 100.0, "t1"),
            rec("B", "C", 100.0, "t2"),
            rec("C", "A", 100.0, "t3"),
        ]
    }

    fn config(algorithm: Algorithm) -> DetectionConfig {
        DetectionConfig {
            min_degree_for_key_node: 2,
            algorithm,
            ..DetectionConfig::default()
        }
    }

    #[test]
    fn triangle_blacklists_all_three() {
        let report = run_detection(triangle(), &config(Algorithm::Both), &CancellationToken::new(), 1)
            .expect("detection should succeed");

        assert_eq!(report.cycle_findings.len(), 1);
        assert_eq!(report.cycle_findings[0].rate, 1.0);
        let addresses: Vec<_> = report.addresses().into_iter().collect();
        assert_eq!(addresses, vec!["A", "B", "C"]);
        assert_eq!(report.diagnostics.records, 3);
        assert_eq!(report.diagnostics.nodes, 3);
        assert!(!report.diagnostics.truncated);
    }

    #[test]
    fn algorithm_selects_detectors() {
        let token = CancellationToken::new();
        let cycles_only = run_detection(triangle(), &config(Algorithm::Cycle), &token, 1)
            .expect("detection should succeed");
        assert_eq!(cycles_only.diagnostics.expansions, 0);
        assert!(cycles_only.pair_findings.is_empty());

        let pairs_only = run_detection(triangle(), &config(Algorithm::Neighbor), &token, 1)
            .expect("detection should succeed");
        assert!(pairs_only.cycle_findings.is_empty());
        assert_eq!(pairs_only.diagnostics.cycles_enumerated, 0);
        assert!(pairs_only.diagnostics.expansions > 0);
    }

    #[test]
    fn sharded_build_gives_same_report() {
        let token = CancellationToken::new();
        let sequential = run_detection(triangle(), &config(Algorithm::Both), &token, 1)
            .expect("detection should succeed");
        let sharded = run_detection(triangle(), &config(Algorithm::Both), &token, 3)
            .expect("detection should succeed");
        assert_eq!(sequential.addresses(), sharded.addresses());
        assert_eq!(sequential.cycle_findings, sharded.cycle_findings);
        assert_eq!(sequential.diagnostics, sharded.diagnostics);
    }

    #[test]
    fn invalid_config_is_rejected_before_detection() {
        let bad = DetectionConfig {
            suspicion_threshold: 1.5,
            ..DetectionConfig::default()
        };
        let err = run_detection(triangle(), &bad, &CancellationToken::new(), 1)
            .expect_err("threshold above 1 must be rejected");
        assert!(matches!(err, AnalysisError::Config(_)));
    }

    #[test]
    fn malformed_record_is_a_data_error() {
        let records = vec![rec("A", "B", -1.0, "t1")];
        let err = run_detection(records, &DetectionConfig::default(), &CancellationToken::new(), 1)
            .expect_err("negative value must be rejected");
        assert!(matches!(err, AnalysisError::Data(_)));
    }

    #[test]
    fn cancelled_run_is_truncated_not_failed() {
        let token = CancellationToken::new();
        token.cancel();
        let report = run_detection(triangle(), &config(Algorithm::Both), &token, 1)
            .expect("cancellation is not an error");
        assert!(report.diagnostics.truncated);
        assert!(report.blacklist.is_empty());
    }

    #[test]
    fn rows_for_the_ledger() {
        let cfg = config(Algorithm::Cycle);
        let report = run_detection(triangle(), &cfg, &CancellationToken::new(), 1)
            .expect("detection should succeed");
        let rows = report.finding_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "cycle");
        assert_eq!(rows[0].tx_count, 3);
        assert_eq!(rows[0].volume, 300.0);

        let run = report.run_row(&cfg);
        assert_eq!(run.record_count, 3);
        assert!(!run.truncated);
    }
}
