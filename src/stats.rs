use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::heuristic::Heuristic;
use crate::transaction::Status;

/// Counters maintained by a domain.
#[derive(Debug, Default)]
pub struct TransactionStats {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    heuristic: AtomicU64,
    timed_out: AtomicU64,
    total_micros: AtomicU64,
}

impl TransactionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_begin(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(
        &self,
        status: Status,
        heuristic: Heuristic,
        timed_out: bool,
        duration: Duration,
    ) {
        match status {
            Status::Committed => self.committed.fetch_add(1, Ordering::Relaxed),
            _ => self.rolled_back.fetch_add(1, Ordering::Relaxed),
        };
        let heuristic = match (status, heuristic) {
            (_, Heuristic::Commit | Heuristic::ReadOnly) => false,
            // Rolled back after the commit decision.
            (Status::Committed, Heuristic::Rollback) => true,
            (_, Heuristic::Rollback) => false,
            _ => true,
        };
        if heuristic {
            self.heuristic.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            heuristic: self.heuristic.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransactionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub heuristic: u64,
    pub timed_out: u64,
    pub total_micros: u64,
}

impl StatsSnapshot {
    pub fn completed(&self) -> u64 {
        self.committed + self.rolled_back
    }

    /// Transactions begun and not completed yet.
    pub fn active(&self) -> u64 {
        self.begun.saturating_sub(self.completed())
    }

    /// Mean duration of completed transactions.
    pub fn average_duration(&self) -> Duration {
        match self.completed() {
            0 => Duration::ZERO,
            completed => Duration::from_micros(self.total_micros / completed),
        }
    }
}
