//! Per-address aggregation of detector findings.
//!
//! Findings from both detectors are folded into one ledger keyed by address.
//! Evidence is deduplicated per address by `{tx_id, value}`, so a transfer
//! reported by several findings, or fed twice in the input, counts once.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use wash_data::store::BlacklistRow;
use wash_data::EvidenceTx;

use crate::finding::WashTradeFinding;

/// Accumulated suspicion for one address.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BlacklistEntry {
    /// Distinct evidence transactions recorded.
    pub occurrence_count: u64,
    /// Sum of the distinct evidence values.
    pub accumulated_volume: f64,
    /// Evidence in first-seen order.
    pub evidence: Vec<EvidenceTx>,
    #[serde(skip)]
    seen: HashSet<(String, u64)>,
}

impl BlacklistEntry {
    /// Record `tx` unless it is already present. Returns true if it was new.
    fn record(&mut self, tx: EvidenceTx) -> bool {
        if !self.seen.insert(tx.key()) {
            return false;
        }
        self.occurrence_count += 1;
        self.accumulated_volume += tx.value;
        self.evidence.push(tx);
        true
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Blacklist {
    entries: BTreeMap<String, BlacklistEntry>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one finding into every address it names.
    pub fn add_finding(&mut self, finding: &WashTradeFinding) {
        for address in &finding.nodes {
            let entry = self.entries.entry(address.clone()).or_default();
            for tx in &finding.transactions {
                entry.record(tx.evidence());
            }
        }
    }

    pub fn add_findings<'a>(&mut self, findings: impl IntoIterator<Item = &'a WashTradeFinding>) {
        for finding in findings {
            self.add_finding(finding);
        }
    }

    /// Blacklisted addresses, sorted.
    pub fn addresses(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &BlacklistEntry)> + '_ {
        self.entries.iter().map(|(address, entry)| (address.as_str(), entry))
    }

    pub fn entry(&self, address: &str) -> Option<&BlacklistEntry> {
        self.entries.get(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union of this run's addresses with a previously persisted list.
    pub fn merge_known(&self, known: &BTreeSet<String>) -> BTreeSet<String> {
        let mut merged = known.clone();
        merged.extend(self.entries.keys().cloned());
        merged
    }

    /// Ledger rows, sorted by address.
    pub fn to_rows(&self) -> Vec<BlacklistRow> {
        self.entries
            .iter()
            .map(|(address, entry)| BlacklistRow {
                address: address.clone(),
                occurrence_count: entry.occurrence_count,
                accumulated_volume: entry.accumulated_volume,
                evidence: entry.evidence.clone(),
            })
            .collect()
    }
}
