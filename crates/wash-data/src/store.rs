//! SQLite audit ledger for detection runs.
//!
//! Keeps every run, the findings it produced and the per-address blacklist
//! evidence so that an address can be traced back to the transactions that
//! put it on the list. Uses WAL mode and prepared statements inside a
//! transaction for batch inserts.

use eyre::Result;
use rusqlite::{Connection, OptionalExtension};
use std::cell::RefCell;

use crate::types::EvidenceTx;

/// Summary of one detection run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunRow {
    /// Number of transfer records fed into the run.
    pub record_count: u64,
    /// Suspicion threshold in effect.
    pub threshold: f64,
    /// Whether a search budget cut the run short.
    pub truncated: bool,
}

/// One stored finding.
#[derive(Clone, Debug, PartialEq)]
pub struct FindingRow {
    /// `cycle` or `pair`.
    pub kind: String,
    /// Addresses in the finding, in detection order.
    pub nodes: Vec<String>,
    /// Suspicion rate.
    pub rate: f64,
    /// Number of evidence transactions.
    pub tx_count: u64,
    /// Total evidence value.
    pub volume: f64,
}

/// One stored blacklist entry.
#[derive(Clone, Debug, PartialEq)]
pub struct BlacklistRow {
    /// Blacklisted address.
    pub address: String,
    /// Number of distinct evidence transactions.
    pub occurrence_count: u64,
    /// Sum of distinct evidence values.
    pub accumulated_volume: f64,
    /// Evidence transactions.
    pub evidence: Vec<EvidenceTx>,
}

pub struct LedgerStore {
    conn: RefCell<Connection>,
}

impl LedgerStore {
    /// Creates or opens a SQLite ledger with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: RefCell::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.borrow_mut().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS detection_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT,
                record_count INTEGER,
                threshold REAL,
                truncated INTEGER
            );

            CREATE TABLE IF NOT EXISTS findings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER REFERENCES detection_runs(id),
                kind TEXT,
                nodes TEXT,
                rate REAL,
                tx_count INTEGER,
                volume REAL
            );

            CREATE TABLE IF NOT EXISTS blacklist_entries (
                run_id INTEGER REFERENCES detection_runs(id),
                address TEXT,
                occurrence_count INTEGER,
                accumulated_volume REAL,
                evidence TEXT,
                PRIMARY KEY (run_id, address)
            );
            ",
        )?;
        Ok(())
    }

    /// Record a new run and return its id.
    ///
    /// # Errors
    /// Returns error if the insert fails.
    pub fn insert_run(&self, run: &RunRow) -> Result<i64> {
        let conn = self.conn.borrow_mut();
        conn.execute(
            "INSERT INTO detection_runs (started_at, record_count, threshold, truncated)
             VALUES (?, ?, ?, ?)",
            rusqlite::params![
                chrono::Utc::now().to_rfc3339(),
                run.record_count,
                run.threshold,
                run.truncated,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Batch insert findings for a run.
    ///
    /// # Errors
    /// Returns error if database insert fails.
    pub fn insert_findings(&self, run_id: i64, findings: &[FindingRow]) -> Result<usize> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO findings (run_id, kind, nodes, rate, tx_count, volume)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for f in findings {
                stmt.execute(rusqlite::params![
                    run_id,
                    f.kind,
                    f.nodes.join("->"),
                    f.rate,
                    f.tx_count,
                    f.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(findings.len())
    }

    /// Batch insert blacklist entries for a run. Evidence is stored as JSON.
    ///
    /// # Errors
    /// Returns error if serialization or the insert fails.
    pub fn insert_blacklist(&self, run_id: i64, entries: &[BlacklistRow]) -> Result<usize> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO blacklist_entries (
                    run_id, address, occurrence_count, accumulated_volume, evidence
                ) VALUES (?, ?, ?, ?, ?)",
            )?;
            for e in entries {
                let evidence = serde_json::to_string(&e.evidence)?;
                stmt.execute(rusqlite::params![
                    run_id,
                    e.address,
                    e.occurrence_count,
                    e.accumulated_volume,
                    evidence,
                ])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    /// Blacklist entries of a run, sorted by address.
    ///
    /// # Errors
    /// Returns error if the query or evidence decoding fails.
    pub fn blacklist_for_run(&self, run_id: i64) -> Result<Vec<BlacklistRow>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "SELECT address, occurrence_count, accumulated_volume, evidence
             FROM blacklist_entries WHERE run_id = ? ORDER BY address",
        )?;
        let raw = stmt
            .query_map(rusqlite::params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(
                |(address, occurrence_count, accumulated_volume, evidence)| -> Result<BlacklistRow> {
                    Ok(BlacklistRow {
                        address,
                        occurrence_count,
                        accumulated_volume,
                        evidence: serde_json::from_str(&evidence)?,
                    })
                },
            )
            .collect()
    }

    /// Findings of a run in insertion order.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn findings_for_run(&self, run_id: i64) -> Result<Vec<FindingRow>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "SELECT kind, nodes, rate, tx_count, volume
             FROM findings WHERE run_id = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![run_id], |row| {
                let nodes: String = row.get(1)?;
                Ok(FindingRow {
                    kind: row.get(0)?,
                    nodes: nodes.split("->").map(str::to_string).collect(),
                    rate: row.get(2)?,
                    tx_count: row.get(3)?,
                    volume: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Id of the most recent run, if any.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn latest_run_id(&self) -> Result<Option<i64>> {
        let conn = self.conn.borrow();
        let id = conn
            .query_row("SELECT MAX(id) FROM detection_runs", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(id)
    }
}
