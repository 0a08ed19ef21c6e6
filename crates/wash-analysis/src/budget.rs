//! Cost controls for the graph searches.
//!
//! Both detectors are best-effort under bounded cost. A [`SearchBudget`]
//! combines a step cap, a wall-clock deadline and a shared
//! [`CancellationToken`]. Exhausting any of them stops the search; whatever
//! was discovered up to that point is still scored and reported.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// A search cap that was hit. Diagnostic only, never a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetExceeded {
    /// A DFS branch reached `max_cycle_depth` and was not extended.
    DepthCap,
    /// A neighborhood expansion marked `max_neighborhood_visits` nodes.
    VisitBudget,
    /// `max_search_steps` was consumed.
    SearchSteps,
    /// The run deadline passed.
    Deadline,
    /// The run was cancelled externally.
    Cancelled,
}

impl BudgetExceeded {
    /// Whether this condition aborts the whole search rather than one branch.
    pub fn stops_search(self) -> bool {
        matches!(self, Self::SearchSteps | Self::Deadline | Self::Cancelled)
    }
}

/// Per-detector record of which caps were hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BudgetTally {
    /// Branches not extended because of the depth cap.
    pub depth_cap: u64,
    /// Expansions that ran out of visit budget.
    pub visit_budget: u64,
    /// The condition that stopped the whole search, if any.
    pub stopped: Option<BudgetExceeded>,
}

impl BudgetTally {
    pub fn record(&mut self, event: BudgetExceeded) {
        match event {
            BudgetExceeded::DepthCap => self.depth_cap += 1,
            BudgetExceeded::VisitBudget => self.visit_budget += 1,
            stop => {
                self.stopped.get_or_insert(stop);
            }
        }
    }

    pub fn merge(&mut self, other: &BudgetTally) {
        self.depth_cap += other.depth_cap;
        self.visit_budget += other.visit_budget;
        if let Some(stop) = other.stopped {
            self.stopped.get_or_insert(stop);
        }
    }

    /// Whether results are partial.
    pub fn truncated(&self) -> bool {
        self.stopped.is_some()
    }
}

/// Cloneable cancellation flag shared between a driver and running searches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Step, time and cancellation limits for one search.
///
/// Steps are counted atomically so one budget can be shared by searches
/// running on several threads.
#[derive(Debug)]
pub struct SearchBudget {
    max_steps: Option<u64>,
    steps: AtomicU64,
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl SearchBudget {
    pub fn new(max_steps: Option<u64>, timeout: Option<Duration>, token: CancellationToken) -> Self {
        Self {
            max_steps,
            steps: AtomicU64::new(0),
            deadline: timeout.map(|t| Instant::now() + t),
            token,
        }
    }

    /// No step cap, no deadline, never cancelled.
    pub fn unlimited() -> Self {
        Self::new(None, None, CancellationToken::new())
    }

    /// Consume one step. Returns the stop reason once any limit is hit.
    pub fn tick(&self) -> Result<(), BudgetExceeded> {
        if self.token.is_cancelled() {
            return Err(BudgetExceeded::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(BudgetExceeded::Deadline);
            }
        }
        let used = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        match self.max_steps {
            Some(max) if used > max => Err(BudgetExceeded::SearchSteps),
            _ => Ok(()),
        }
    }

    pub fn steps_used(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }
}
