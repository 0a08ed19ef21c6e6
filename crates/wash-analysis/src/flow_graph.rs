//! Value-flow graph construction from transfer records.
//!
//! Builds a directed graph where nodes are addresses and each edge
//! aggregates every record sharing the same `(from, to)` pair: the summed
//! value and the contributing record indices in input order. A→B and B→A
//! are distinct edges; the undirected relationship between two addresses is
//! the union of both.
//!
//! Each address also carries its **net drift** (received minus sent),
//! accumulated once per record at build time. The graph is read-only after
//! construction, so both detectors can borrow it concurrently.
//!
//! ## Suspicion rate
//!
//! For a node group and its evidence transactions:
//!
//! ```text
//! rate = 1 - Σ|net_drift(n)| / Σ value(tx)
//! ```
//!
//! Value that circulates inside the group leaves drift near zero (rate → 1);
//! value that genuinely leaves the group shows up as drift (rate → 0 or
//! below). The rate is not clamped. Zero evidence value yields 0.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;
use wash_data::{DataError, TransferRecord};

/// Undirected neighbor lists for every node, indexed by `NodeIndex::index()`.
pub type NeighborMap = Vec<Vec<NodeIndex>>;

/// Aggregate of all records on one directed `(from, to)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowEdge {
    /// Sum of record values on this pair.
    pub total_weight: f64,
    /// Indices into [`FlowGraph::records`], in input order.
    pub transactions: Vec<usize>,
}

/// Summary counts for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub records: usize,
    pub total_volume: f64,
    pub max_degree: usize,
}

/// Directed, address-indexed value-flow graph.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    graph: DiGraph<String, FlowEdge>,
    addr_to_ix: HashMap<String, NodeIndex>,
    /// Received minus sent, indexed by `NodeIndex::index()`.
    net_drift: Vec<f64>,
    records: Vec<TransferRecord>,
}

impl FlowGraph {
    /// Build the graph with a single pass over `records` in input order.
    ///
    /// # Errors
    /// Returns [`DataError`] for the first record with a missing field or
    /// a negative/non-finite value. No graph is produced in that case.
    pub fn build(records: Vec<TransferRecord>) -> Result<Self, DataError> {
        validate_all(&records)?;

        let mut graph = DiGraph::new();
        let mut addr_to_ix = HashMap::new();
        let mut net_drift = Vec::new();
        let mut edge_ix = HashMap::new();

        for (i, record) in records.iter().enumerate() {
            let from_ix = intern(&mut graph, &mut addr_to_ix, &mut net_drift, &record.from_address);
            let to_ix = intern(&mut graph, &mut addr_to_ix, &mut net_drift, &record.to_address);

            let edge = *edge_ix
                .entry((from_ix, to_ix))
                .or_insert_with(|| graph.add_edge(from_ix, to_ix, FlowEdge::default()));
            let weight = &mut graph[edge];
            weight.total_weight += record.value;
            weight.transactions.push(i);

            net_drift[from_ix.index()] -= record.value;
            net_drift[to_ix.index()] += record.value;
        }

        let built = Self {
            graph,
            addr_to_ix,
            net_drift,
            records,
        };
        info!(
            nodes = built.node_count(),
            edges = built.edge_count(),
            records = built.records.len(),
            "flow graph built"
        );
        Ok(built)
    }

    /// Build the graph by grouping records into edges on `shards` parallel
    /// shards, then merging.
    ///
    /// The merge restores per-edge input order with a stable sort on record
    /// index, inserts nodes and edges in first-appearance order and replays
    /// value sums in input order, so the result is identical to [`build`]
    /// regardless of shard boundaries.
    ///
    /// [`build`]: FlowGraph::build
    ///
    /// # Errors
    /// Same as [`FlowGraph::build`].
    pub fn build_sharded(records: Vec<TransferRecord>, shards: usize) -> Result<Self, DataError> {
        validate_all(&records)?;

        let shard_len = records.len().div_ceil(shards.max(1)).max(1);
        let grouped: HashMap<(&str, &str), Vec<usize>> = records
            .par_chunks(shard_len)
            .enumerate()
            .map(|(shard, chunk)| {
                let offset = shard * shard_len;
                let mut local: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
                for (j, record) in chunk.iter().enumerate() {
                    local
                        .entry((record.from_address.as_str(), record.to_address.as_str()))
                        .or_default()
                        .push(offset + j);
                }
                local
            })
            .reduce(HashMap::new, |mut acc, part| {
                for (pair, mut indices) in part {
                    acc.entry(pair).or_default().append(&mut indices);
                }
                acc
            });

        let mut groups: Vec<((&str, &str), Vec<usize>)> = grouped
            .into_iter()
            .map(|(pair, mut indices)| {
                indices.sort();
                (pair, indices)
            })
            .collect();
        groups.sort_by_key(|(_, indices)| indices[0]);

        let mut graph = DiGraph::new();
        let mut addr_to_ix = HashMap::new();
        let mut net_drift = Vec::new();

        for ((from, to), indices) in groups {
            let from_ix = intern(&mut graph, &mut addr_to_ix, &mut net_drift, from);
            let to_ix = intern(&mut graph, &mut addr_to_ix, &mut net_drift, to);
            let total_weight = indices.iter().fold(0.0, |acc, &i| acc + records[i].value);
            graph.add_edge(
                from_ix,
                to_ix,
                FlowEdge {
                    total_weight,
                    transactions: indices,
                },
            );
        }

        for record in &records {
            net_drift[addr_to_ix[&record.from_address].index()] -= record.value;
            net_drift[addr_to_ix[&record.to_address].index()] += record.value;
        }

        let built = Self {
            graph,
            addr_to_ix,
            net_drift,
            records,
        };
        info!(
            nodes = built.node_count(),
            edges = built.edge_count(),
            records = built.records.len(),
            shards,
            "flow graph built from shards"
        );
        Ok(built)
    }

    /// The underlying petgraph graph.
    pub fn graph(&self) -> &DiGraph<String, FlowEdge> {
        &self.graph
    }

    /// Number of distinct addresses.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of distinct directed `from → to` edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All input records, in input order.
    pub fn records(&self) -> &[TransferRecord] {
        &self.records
    }

    /// Input record at `index`.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn record(&self, index: usize) -> &TransferRecord {
        &self.records[index]
    }

    /// Nodes in enumeration (first-appearance) order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Node for `address`, if it appears in any record.
    pub fn node_index(&self, address: &str) -> Option<NodeIndex> {
        self.addr_to_ix.get(address).copied()
    }

    /// Address interned at `node`.
    pub fn address(&self, node: NodeIndex) -> &str {
        &self.graph[node]
    }

    /// Net drift of a node: received minus sent.
    pub fn drift(&self, node: NodeIndex) -> f64 {
        self.net_drift[node.index()]
    }

    /// Net drift by address; 0 for addresses not in the graph.
    pub fn net_drift(&self, address: &str) -> f64 {
        self.node_index(address).map_or(0.0, |ix| self.drift(ix))
    }

    /// In-degree plus out-degree, counting distinct directed edges.
    pub fn degree(&self, node: NodeIndex) -> usize {
        self.graph.edges_directed(node, Direction::Incoming).count()
            + self.graph.edges_directed(node, Direction::Outgoing).count()
    }

    /// Nodes whose total degree meets `min_total_degree`, in enumeration order.
    pub fn key_nodes(&self, min_total_degree: usize) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|&node| self.degree(node) >= min_total_degree)
            .collect()
    }

    /// Undirected neighbors (predecessors ∪ successors), deduplicated and
    /// sorted by node index. A self-transfer does not make a node its own
    /// neighbor.
    pub fn neighbors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_undirected(node)
            .filter(|&n| n != node)
            .collect();
        neighbors.sort_unstable();
        neighbors.dedup();
        neighbors
    }

    /// Neighbor lists for every node. Compute once per detection run.
    pub fn neighbor_map(&self) -> NeighborMap {
        self.nodes().map(|node| self.neighbors(node)).collect()
    }

    /// Aggregate edge `from → to`, if any record flowed that way.
    pub fn edge(&self, from: NodeIndex, to: NodeIndex) -> Option<&FlowEdge> {
        self.graph.find_edge(from, to).map(|e| &self.graph[e])
    }

    /// Records on `a → b` followed by records on `b → a`.
    pub fn transactions_between(&self, a: NodeIndex, b: NodeIndex) -> Vec<&TransferRecord> {
        let mut txs = Vec::new();
        if let Some(edge) = self.edge(a, b) {
            txs.extend(edge.transactions.iter().map(|&i| &self.records[i]));
        }
        if a != b {
            if let Some(edge) = self.edge(b, a) {
                txs.extend(edge.transactions.iter().map(|&i| &self.records[i]));
            }
        }
        txs
    }

    /// `1 - Σ|drift| / Σvalue`, or 0 when the evidence carries no value.
    pub fn suspicion_rate(&self, nodes: &[NodeIndex], transactions: &[&TransferRecord]) -> f64 {
        let total_value: f64 = transactions.iter().map(|tx| tx.value).sum();
        if total_value == 0.0 {
            return 0.0;
        }
        let drift: f64 = nodes.iter().map(|&n| self.drift(n).abs()).sum();
        1.0 - drift / total_value
    }

    /// Whether the group's suspicion rate reaches `threshold`.
    ///
    /// Always false when the evidence carries no value.
    pub fn is_wash_trade(
        &self,
        nodes: &[NodeIndex],
        transactions: &[&TransferRecord],
        threshold: f64,
    ) -> bool {
        let total_value: f64 = transactions.iter().map(|tx| tx.value).sum();
        total_value != 0.0 && self.suspicion_rate(nodes, transactions) >= threshold
    }

    /// Size and volume summary of the graph.
    pub fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: self.node_count(),
            edges: self.edge_count(),
            records: self.records.len(),
            total_volume: self.records.iter().map(|r| r.value).sum(),
            max_degree: self.nodes().map(|n| self.degree(n)).max().unwrap_or(0),
        }
    }
}

fn validate_all(records: &[TransferRecord]) -> Result<(), DataError> {
    records
        .iter()
        .enumerate()
        .try_for_each(|(i, record)| record.validate(i))
}

fn intern(
    graph: &mut DiGraph<String, FlowEdge>,
    addr_to_ix: &mut HashMap<String, NodeIndex>,
    net_drift: &mut Vec<f64>,
    address: &str,
) -> NodeIndex {
    if let Some(&ix) = addr_to_ix.get(address) {
        return ix;
    }
    let ix = graph.add_node(address.to_string());
    addr_to_ix.insert(address.to_string(), ix);
    net_drift.push(0.0);
    ix
}
