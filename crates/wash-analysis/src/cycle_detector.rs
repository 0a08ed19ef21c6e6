//! Cycle-based wash-trade detection.
//!
//! Enumerates small closed loops of addresses and scores each one:
//! 1. Compute the undirected neighbor map once (see [`FlowGraph::neighbor_map`])
//! 2. From every candidate start node, run a depth-bounded stack DFS
//! 3. Record every path that closes back on its start with 3+ nodes
//! 4. Deduplicate cycles by node set, keeping the first-seen ordering
//! 5. Gather evidence from each adjacent pair of the cycle (wrap-around),
//!    each unordered pair at most once
//! 6. Suspicion rate ≥ threshold → cycle finding
//!
//! Loops are followed over the **undirected** neighbor relation: A→B, C→B,
//! C→A is a candidate loop just like A→B→C→A. The suspicion rate, not the
//! edge directions, decides whether the loop looks like self-trading.
//!
//! ## Cost
//!
//! Enumeration is exponential in depth × average degree. The depth cap, the
//! top-degree candidate filter and the [`SearchBudget`] are the only guards
//! on adversarial graphs. When the budget stops the search, the cycles found
//! so far are still deduplicated and scored.

use std::cmp::Reverse;
use std::collections::HashSet;

use petgraph::graph::NodeIndex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use wash_data::TransferRecord;

use crate::budget::{BudgetExceeded, BudgetTally, SearchBudget};
use crate::config::DetectionConfig;
use crate::finding::{PatternKind, WashTradeFinding};
use crate::flow_graph::{FlowGraph, NeighborMap};

/// Result of one cycle detection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleDetection {
    /// Cycles that passed the suspicion threshold.
    pub findings: Vec<WashTradeFinding>,
    /// Closed paths recorded before deduplication.
    pub cycles_enumerated: usize,
    /// Distinct node sets among them.
    pub unique_cycles: usize,
    /// Caps hit during the search.
    pub budget: BudgetTally,
}

impl CycleDetection {
    pub fn truncated(&self) -> bool {
        self.budget.truncated()
    }
}

/// Closed paths found from one start node.
#[derive(Debug, Default)]
struct StartSearch {
    cycles: Vec<Vec<NodeIndex>>,
    tally: BudgetTally,
}

/// Depth-bounded cycle enumerator over a read-only [`FlowGraph`].
pub struct CycleDetector<'g> {
    graph: &'g FlowGraph,
    threshold: f64,
    max_depth: usize,
    max_candidates: Option<usize>,
    parallel: bool,
}

impl<'g> CycleDetector<'g> {
    pub fn new(graph: &'g FlowGraph, threshold: f64) -> Self {
        let defaults = DetectionConfig::default();
        Self {
            graph,
            threshold,
            max_depth: defaults.max_cycle_depth,
            max_candidates: defaults.max_candidate_nodes,
            parallel: defaults.parallel,
        }
    }

    /// Detector configured from a validated run configuration.
    pub fn from_config(graph: &'g FlowGraph, config: &DetectionConfig) -> Self {
        Self {
            graph,
            threshold: config.suspicion_threshold,
            max_depth: config.max_cycle_depth,
            max_candidates: config.max_candidate_nodes,
            parallel: config.parallel,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_candidates(mut self, max_candidates: Option<usize>) -> Self {
        self.max_candidates = max_candidates;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Enumerate, deduplicate and score cycles.
    #[tracing::instrument(skip_all, fields(threshold = self.threshold, max_depth = self.max_depth))]
    pub fn detect(&self, budget: &SearchBudget) -> CycleDetection {
        let neighbor_map = self.graph.neighbor_map();
        let starts = self.candidate_starts();

        let searches: Vec<StartSearch> = if self.parallel {
            starts
                .par_iter()
                .map(|&start| enumerate_from(start, &neighbor_map, self.max_depth, budget))
                .collect()
        } else {
            let mut searches = Vec::with_capacity(starts.len());
            for &start in &starts {
                let search = enumerate_from(start, &neighbor_map, self.max_depth, budget);
                let stopped = search.tally.truncated();
                searches.push(search);
                if stopped {
                    break;
                }
            }
            searches
        };

        let mut detection = CycleDetection::default();
        let mut seen: HashSet<Vec<NodeIndex>> = HashSet::new();
        let mut unique: Vec<Vec<NodeIndex>> = Vec::new();

        for search in searches {
            detection.budget.merge(&search.tally);
            detection.cycles_enumerated += search.cycles.len();
            for cycle in search.cycles {
                if seen.insert(canonical_key(&cycle)) {
                    unique.push(cycle);
                }
            }
        }
        detection.unique_cycles = unique.len();

        detection.findings = unique
            .iter()
            .filter_map(|cycle| self.score(cycle))
            .collect();

        if let Some(reason) = detection.budget.stopped {
            warn!(?reason, "cycle search stopped early; reporting partial results");
        }
        info!(
            start_nodes = starts.len(),
            cycles_enumerated = detection.cycles_enumerated,
            unique_cycles = detection.unique_cycles,
            findings = detection.findings.len(),
            depth_capped = detection.budget.depth_cap,
            "cycle detection completed"
        );
        detection
    }

    /// Start nodes for the search: every node, or the `max_candidates`
    /// highest-degree nodes when the graph is larger. Ties keep enumeration
    /// order.
    fn candidate_starts(&self) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self.graph.nodes().collect();
        if let Some(cap) = self.max_candidates {
            if nodes.len() > cap {
                nodes.sort_by_key(|&n| Reverse(self.graph.degree(n)));
                nodes.truncate(cap);
                debug!(cap, "restricted cycle search to top-degree start nodes");
            }
        }
        nodes
    }

    /// Union of transactions over each adjacent pair of the cycle, counting
    /// every unordered pair once.
    fn evidence(&self, cycle: &[NodeIndex]) -> Vec<&'g TransferRecord> {
        let mut pairs: HashSet<(NodeIndex, NodeIndex)> = HashSet::new();
        let mut transactions = Vec::new();
        for (i, &a) in cycle.iter().enumerate() {
            let b = cycle[(i + 1) % cycle.len()];
            if pairs.insert(unordered(a, b)) {
                transactions.extend(self.graph.transactions_between(a, b));
            }
        }
        transactions
    }

    fn score(&self, cycle: &[NodeIndex]) -> Option<WashTradeFinding> {
        let transactions = self.evidence(cycle);
        if transactions.is_empty() {
            return None;
        }
        if !self.graph.is_wash_trade(cycle, &transactions, self.threshold) {
            return None;
        }
        let rate = self.graph.suspicion_rate(cycle, &transactions);
        Some(WashTradeFinding::from_graph(
            PatternKind::Cycle,
            self.graph,
            cycle,
            &transactions,
            rate,
        ))
    }
}

/// Iterative DFS from `start`. Stack frames carry the path and its node set.
///
/// Paths never grow past `max_depth` nodes; a frame whose tail could have
/// been extended further counts one depth-cap event.
fn enumerate_from(
    start: NodeIndex,
    neighbor_map: &NeighborMap,
    max_depth: usize,
    budget: &SearchBudget,
) -> StartSearch {
    let mut search = StartSearch::default();
    let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, HashSet<NodeIndex>)> =
        vec![(start, vec![start], HashSet::from([start]))];

    while let Some((node, path, on_path)) = stack.pop() {
        if let Err(reason) = budget.tick() {
            search.tally.record(reason);
            break;
        }

        let can_extend = path.len() < max_depth;
        let mut capped = false;

        // Reverse so the first neighbor is popped first.
        for &neighbor in neighbor_map[node.index()].iter().rev() {
            if neighbor == start {
                if path.len() > 2 {
                    search.cycles.push(path.clone());
                }
                continue;
            }
            if on_path.contains(&neighbor) {
                continue;
            }
            if !can_extend {
                capped = true;
                continue;
            }

            let mut next_path = path.clone();
            next_path.push(neighbor);
            let mut next_on_path = on_path.clone();
            next_on_path.insert(neighbor);
            stack.push((neighbor, next_path, next_on_path));
        }

        if capped {
            search.tally.record(BudgetExceeded::DepthCap);
        }
    }

    search
}

fn canonical_key(cycle: &[NodeIndex]) -> Vec<NodeIndex> {
    let mut key = cycle.to_vec();
    key.sort_unstable();
    key
}

fn unordered(a: NodeIndex, b: NodeIndex) -> (NodeIndex, NodeIndex) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CancellationToken;

    fn rec(from: &str, to: &str, value: f64, tx: &str) -> TransferRecord {
        TransferRecord::new(from, to, value, tx, "1700000000")
    }

    fn graph(records: Vec<TransferRecord>) -> FlowGraph {
        FlowGraph::build(records).expect("valid records")
    }

    fn key_set(detection: &CycleDetection) -> HashSet<Vec<String>> {
        detection
            .findings
            .iter()
            .map(WashTradeFinding::canonical_key)
            .collect()
    }

    /// A→B→C→A, 10 each.
    fn triangle() -> FlowGraph {
        graph(vec![
            rec("A", "B", 10.0, "t1"),
            rec("B", "C", 10.0, "t2"),
            rec("C", "A", 10.0, "t3"),
        ])
    }

    #[test]
    fn closed_triangle_detected_once() {
        let g = triangle();
        let detection = CycleDetector::new(&g, 0.8).detect(&SearchBudget::unlimited());

        assert_eq!(detection.unique_cycles, 1);
        assert!(detection.cycles_enumerated >= 2, "each start finds both directions");
        assert_eq!(detection.findings.len(), 1);

        let finding = &detection.findings[0];
        assert_eq!(finding.kind, PatternKind::Cycle);
        assert_eq!(finding.canonical_key(), vec!["A", "B", "C"]);
        assert_eq!(finding.rate, 1.0);
        assert_eq!(finding.transactions.len(), 3);
        assert_eq!(finding.volume(), 30.0);
        assert!(!detection.truncated());
    }

    #[test]
    fn first_seen_ordering_is_kept() {
        let g = triangle();
        let detection = CycleDetector::new(&g, 0.8).detect(&SearchBudget::unlimited());
        // Start A; neighbors of A are [B, C]; B is explored first and closes via C.
        assert_eq!(detection.findings[0].nodes, vec!["A", "B", "C"]);
    }

    #[test]
    fn chain_has_no_cycle() {
        let g = graph(vec![rec("A", "B", 5.0, "t1"), rec("B", "C", 5.0, "t2")]);
        let detection = CycleDetector::new(&g, 0.0).detect(&SearchBudget::unlimited());
        assert_eq!(detection.unique_cycles, 0);
        assert!(detection.findings.is_empty());
    }

    #[test]
    fn two_node_round_trip_is_not_a_cycle() {
        let g = graph(vec![rec("A", "B", 5.0, "t1"), rec("B", "A", 5.0, "t2")]);
        let detection = CycleDetector::new(&g, 0.0).detect(&SearchBudget::unlimited());
        assert_eq!(detection.cycles_enumerated, 0);
    }

    #[test]
    fn leaking_cycle_fails_threshold() {
        // A→B→C→A plus a large outflow from C to an external sink.
        let g = graph(vec![
            rec("A", "B", 10.0, "t1"),
            rec("B", "C", 10.0, "t2"),
            rec("C", "A", 1.0, "t3"),
            rec("C", "X", 9.0, "t4"),
        ]);
        let detection = CycleDetector::new(&g, 0.8).detect(&SearchBudget::unlimited());
        assert_eq!(detection.unique_cycles, 1);
        assert!(detection.findings.is_empty());
    }

    #[test]
    fn square_needs_depth_four() {
        let records = vec![
            rec("A", "B", 3.0, "t1"),
            rec("B", "C", 3.0, "t2"),
            rec("C", "D", 3.0, "t3"),
            rec("D", "A", 3.0, "t4"),
        ];
        let g = graph(records);

        let shallow = CycleDetector::new(&g, 0.8)
            .with_max_depth(3)
            .detect(&SearchBudget::unlimited());
        assert!(shallow.findings.is_empty());
        assert!(shallow.budget.depth_cap > 0);
        assert!(!shallow.truncated(), "depth cap is not a truncation");

        let deep = CycleDetector::new(&g, 0.8)
            .with_max_depth(4)
            .detect(&SearchBudget::unlimited());
        assert_eq!(deep.findings.len(), 1);
        assert_eq!(deep.findings[0].canonical_key(), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn evidence_counts_each_pair_once() {
        // Two-way flow on A–B must not be double counted around the loop.
        let g = graph(vec![
            rec("A", "B", 4.0, "t1"),
            rec("B", "A", 4.0, "t2"),
            rec("B", "C", 4.0, "t3"),
            rec("C", "A", 4.0, "t4"),
        ]);
        let detection = CycleDetector::new(&g, 0.0).detect(&SearchBudget::unlimited());
        let finding = &detection.findings[0];
        let mut ids: Vec<&str> = finding.transactions.iter().map(|t| t.tx_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["t1", "t2", "t3", "t4"]);
    }

    #[test]
    fn dedup_is_idempotent_across_runs() {
        let g = graph(vec![
            rec("A", "B", 1.0, "t1"),
            rec("B", "C", 1.0, "t2"),
            rec("C", "A", 1.0, "t3"),
            rec("C", "D", 1.0, "t4"),
            rec("D", "A", 1.0, "t5"),
            rec("B", "D", 1.0, "t6"),
        ]);
        let detector = CycleDetector::new(&g, -10.0);
        let first = detector.detect(&SearchBudget::unlimited());
        let second = detector.detect(&SearchBudget::unlimited());
        assert_eq!(first.unique_cycles, second.unique_cycles);
        assert_eq!(key_set(&first), key_set(&second));
        assert_eq!(key_set(&first).len(), first.findings.len());
    }

    #[test]
    fn parallel_matches_sequential() {
        let mut records = Vec::new();
        for i in 0..12u32 {
            records.push(rec(&format!("n{}", i % 6), &format!("n{}", (i + 1) % 6), 1.0, &format!("a{i}")));
            records.push(rec(&format!("n{}", i % 6), &format!("n{}", (i + 3) % 6), 1.0, &format!("b{i}")));
        }
        let g = graph(records);
        let sequential = CycleDetector::new(&g, -10.0).detect(&SearchBudget::unlimited());
        let parallel = CycleDetector::new(&g, -10.0)
            .with_parallel(true)
            .detect(&SearchBudget::unlimited());
        assert_eq!(sequential.cycles_enumerated, parallel.cycles_enumerated);
        assert_eq!(sequential.findings, parallel.findings);
    }

    #[test]
    fn candidate_filter_keeps_highest_degree() {
        // Hub H has degree 4; everything else has degree ≤ 2.
        let g = graph(vec![
            rec("A", "B", 1.0, "t1"),
            rec("H", "A", 1.0, "t2"),
            rec("B", "H", 1.0, "t3"),
            rec("H", "C", 1.0, "t4"),
            rec("D", "H", 1.0, "t5"),
        ]);
        let detector = CycleDetector::new(&g, 0.0).with_max_candidates(Some(1));
        let starts = detector.candidate_starts();
        assert_eq!(starts, vec![g.node_index("H").expect("hub")]);

        // Triangle A-B-H is still reachable from H.
        let detection = detector.detect(&SearchBudget::unlimited());
        assert_eq!(detection.unique_cycles, 1);
    }

    #[test]
    fn candidate_filter_ties_keep_enumeration_order() {
        let g = triangle();
        let starts = CycleDetector::new(&g, 0.8)
            .with_max_candidates(Some(2))
            .candidate_starts();
        assert_eq!(
            starts,
            vec![g.node_index("A").expect("A"), g.node_index("B").expect("B")]
        );
    }

    #[test]
    fn step_budget_returns_partial_results() {
        let g = triangle();
        // Start A: pop [A], pop [A,B], pop [A,B,C] closes the loop; then stop.
        let budget = SearchBudget::new(Some(3), None, CancellationToken::new());
        let detection = CycleDetector::new(&g, 0.8).detect(&budget);
        assert!(detection.truncated());
        assert_eq!(detection.budget.stopped, Some(BudgetExceeded::SearchSteps));
        assert_eq!(detection.findings.len(), 1);
    }

    #[test]
    fn cancelled_run_is_truncated_not_failed() {
        let g = triangle();
        let token = CancellationToken::new();
        token.cancel();
        let detection = CycleDetector::new(&g, 0.8).detect(&SearchBudget::new(None, None, token));
        assert!(detection.truncated());
        assert_eq!(detection.budget.stopped, Some(BudgetExceeded::Cancelled));
        assert!(detection.findings.is_empty());
    }

    #[test]
    fn raising_threshold_never_adds_findings() {
        let g = graph(vec![
            rec("A", "B", 10.0, "t1"),
            rec("B", "C", 10.0, "t2"),
            rec("C", "A", 7.0, "t3"),
            rec("C", "D", 1.0, "t4"),
            rec("D", "A", 1.0, "t5"),
        ]);
        let mut previous = usize::MAX;
        for threshold in [0.0, 0.2, 0.4, 0.6, 0.8, 1.0] {
            let found = CycleDetector::new(&g, threshold)
                .detect(&SearchBudget::unlimited())
                .findings
                .len();
            assert!(found <= previous, "threshold {threshold} added findings");
            previous = found;
        }
    }
}
