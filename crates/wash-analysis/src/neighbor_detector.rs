//! Neighborhood-based wash-trade detection.
//!
//! Seeds a breadth-first expansion from every key node (total degree ≥
//! `min_degree_for_key_node`) and checks each newly reached pair
//! `(current, neighbor)` for self-trading, without requiring a full cycle.
//!
//! Visitation is shared across the whole run through a [`VisitContext`]: an
//! address is expanded from at most once, and an address reached by an
//! earlier expansion never becomes a later root. Clusters reachable only
//! from a later seed can therefore be missed; that is the accepted price of
//! bounding the run to one pass over each address.

use std::collections::{HashSet, VecDeque};

use dashmap::DashSet;
use petgraph::graph::NodeIndex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::budget::{BudgetExceeded, BudgetTally, SearchBudget};
use crate::config::DetectionConfig;
use crate::finding::{PatternKind, WashTradeFinding};
use crate::flow_graph::FlowGraph;

/// Run-wide visited set.
///
/// The only shared mutable state of a detection run. [`claim`] is an atomic
/// insert, so expansions on different threads can share one context and each
/// node is still claimed by exactly one of them.
///
/// [`claim`]: VisitContext::claim
#[derive(Debug, Default)]
pub struct VisitContext {
    visited: DashSet<NodeIndex>,
}

impl VisitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `node` visited. Returns false if it already was.
    pub fn claim(&self, node: NodeIndex) -> bool {
        self.visited.insert(node)
    }

    pub fn is_visited(&self, node: NodeIndex) -> bool {
        self.visited.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
    }
}

/// Result of one neighborhood detection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NeighborDetection {
    /// Pairs that passed the suspicion threshold.
    pub findings: Vec<WashTradeFinding>,
    /// Number of expansions started.
    pub expansions: usize,
    /// Distinct pairs evaluated.
    pub pairs_checked: usize,
    /// Nodes marked by each expansion, in expansion order.
    pub expansion_sizes: Vec<usize>,
    /// Caps hit during the search.
    pub budget: BudgetTally,
}

impl NeighborDetection {
    pub fn truncated(&self) -> bool {
        self.budget.truncated()
    }
}

/// Bounded breadth-first expansion around high-degree nodes.
pub struct NeighborDetector<'g> {
    graph: &'g FlowGraph,
    threshold: f64,
    min_degree: usize,
    max_visits: usize,
}

impl<'g> NeighborDetector<'g> {
    pub fn new(graph: &'g FlowGraph, threshold: f64, min_degree: usize) -> Self {
        Self {
            graph,
            threshold,
            min_degree,
            max_visits: DetectionConfig::default().max_neighborhood_visits,
        }
    }

    pub fn from_config(graph: &'g FlowGraph, config: &DetectionConfig) -> Self {
        Self {
            graph,
            threshold: config.suspicion_threshold,
            min_degree: config.min_degree_for_key_node,
            max_visits: config.max_neighborhood_visits,
        }
    }

    pub fn with_max_visits(mut self, max_visits: usize) -> Self {
        self.max_visits = max_visits.max(1);
        self
    }

    /// Run with a fresh visited set.
    pub fn detect(&self, budget: &SearchBudget) -> NeighborDetection {
        self.detect_with_context(&VisitContext::new(), budget)
    }

    /// Run against a caller-supplied visited set.
    #[tracing::instrument(skip_all, fields(threshold = self.threshold, min_degree = self.min_degree))]
    pub fn detect_with_context(&self, ctx: &VisitContext, budget: &SearchBudget) -> NeighborDetection {
        let key_nodes = self.graph.key_nodes(self.min_degree);
        let mut detection = NeighborDetection::default();

        for &start in &key_nodes {
            if !ctx.claim(start) {
                continue;
            }
            detection.expansions += 1;
            self.expand_from(start, ctx, budget, &mut detection);
            if detection.truncated() {
                break;
            }
        }

        if let Some(reason) = detection.budget.stopped {
            warn!(?reason, "neighborhood search stopped early; reporting partial results");
        }
        info!(
            key_nodes = key_nodes.len(),
            expansions = detection.expansions,
            pairs_checked = detection.pairs_checked,
            findings = detection.findings.len(),
            visit_capped = detection.budget.visit_budget,
            "neighborhood detection completed"
        );
        detection
    }

    /// BFS from an already-claimed `start`, marking at most `max_visits`
    /// nodes including `start`.
    fn expand_from(
        &self,
        start: NodeIndex,
        ctx: &VisitContext,
        budget: &SearchBudget,
        detection: &mut NeighborDetection,
    ) {
        let mut queue = VecDeque::from([start]);
        let mut marked = 1usize;
        let mut checked: HashSet<(NodeIndex, NodeIndex)> = HashSet::new();
        let mut capped = false;

        'expand: while let Some(current) = queue.pop_front() {
            if let Err(reason) = budget.tick() {
                detection.budget.record(reason);
                break;
            }

            for neighbor in self.graph.neighbors(current) {
                if ctx.is_visited(neighbor) {
                    continue;
                }
                // Capped only once an unvisited neighbor is turned away.
                if marked >= self.max_visits {
                    capped = true;
                    break 'expand;
                }
                if !ctx.claim(neighbor) {
                    continue;
                }
                marked += 1;
                queue.push_back(neighbor);
                self.check_pair(current, neighbor, &mut checked, detection);
            }
        }

        if capped {
            detection.budget.record(BudgetExceeded::VisitBudget);
            debug!(
                start = self.graph.address(start),
                marked, "neighborhood expansion hit visit budget"
            );
        }
        detection.expansion_sizes.push(marked);
    }

    fn check_pair(
        &self,
        a: NodeIndex,
        b: NodeIndex,
        checked: &mut HashSet<(NodeIndex, NodeIndex)>,
        detection: &mut NeighborDetection,
    ) {
        let key = if a <= b { (a, b) } else { (b, a) };
        if !checked.insert(key) {
            return;
        }
        detection.pairs_checked += 1;

        let transactions = self.graph.transactions_between(a, b);
        if transactions.is_empty() {
            return;
        }
        let nodes = [a, b];
        if self.graph.is_wash_trade(&nodes, &transactions, self.threshold) {
            let rate = self.graph.suspicion_rate(&nodes, &transactions);
            detection.findings.push(WashTradeFinding::from_graph(
                PatternKind::Pair,
                self.graph,
                &nodes,
                &transactions,
                rate,
            ));
        }
    }
}
