//! Detector output.

use petgraph::graph::NodeIndex;
use serde::Serialize;
use wash_data::TransferRecord;

use crate::flow_graph::FlowGraph;

/// Which detector produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// A closed loop of three or more addresses.
    Cycle,
    /// Two adjacent addresses found by neighborhood expansion.
    Pair,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cycle => "cycle",
            Self::Pair => "pair",
        }
    }
}

/// A group of addresses whose mutual flow passed the suspicion threshold.
///
/// Owns copies of its addresses and evidence so it outlives the graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WashTradeFinding {
    pub kind: PatternKind,
    /// Cycle order for cycles; the checked pair for pairs.
    pub nodes: Vec<String>,
    /// Evidence transactions.
    pub transactions: Vec<TransferRecord>,
    /// Suspicion rate of `nodes` over `transactions`.
    pub rate: f64,
}

impl WashTradeFinding {
    pub(crate) fn from_graph(
        kind: PatternKind,
        graph: &FlowGraph,
        nodes: &[NodeIndex],
        transactions: &[&TransferRecord],
        rate: f64,
    ) -> Self {
        Self {
            kind,
            nodes: nodes.iter().map(|&n| graph.address(n).to_string()).collect(),
            transactions: transactions.iter().map(|&tx| tx.clone()).collect(),
            rate,
        }
    }

    /// Total evidence value.
    pub fn volume(&self) -> f64 {
        self.transactions.iter().map(|tx| tx.value).sum()
    }

    /// Order-independent identity: the node set, sorted.
    pub fn canonical_key(&self) -> Vec<String> {
        let mut key = self.nodes.clone();
        key.sort();
        key
    }
}
