//! Reconciliation of per-resource votes into one transaction outcome.
//!
//! Every resource call made while driving a transaction yields a
//! [`ResourceOutcome`]. Outcomes are turned into raw [`HeuristicFlags`] and
//! accumulated over a phase; the accumulator is normalized into a single
//! [`Heuristic`] once the phase is over.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::resource::{XaError, xa};

/// Raw outcome flags accumulated while a phase is driven.
///
/// The empty set means "read only": nothing voted and nothing changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeuristicFlags(u16);

impl HeuristicFlags {
    pub const READ_ONLY: Self = Self(0);
    pub const COMMIT: Self = Self(1 << 0);
    pub const ROLLBACK: Self = Self(1 << 1);
    pub const MIXED: Self = Self(1 << 2);
    pub const HAZARD: Self = Self(1 << 3);
    pub const OTHER: Self = Self(1 << 4);
    pub const UNKNOWN: Self = Self(1 << 5);
    pub const TX_COMMITTED: Self = Self(1 << 6);
    pub const TX_ROLLEDBACK: Self = Self(1 << 7);

    const ALL: u16 = (1 << 8) - 1;

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Builds flags from raw bits, dropping any unknown bit.
    pub fn from_bits_truncate(bits: u16) -> Self {
        Self(bits & Self::ALL)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.0 == 0
    }

    /// Merges `other` into the accumulator.
    pub fn accumulate(&mut self, other: impl Into<HeuristicFlags>) {
        self.0 |= other.into().0;
    }

    /// Whether a phase should keep driving the remaining resources.
    ///
    /// Iteration continues only while the accumulator is exactly read-only
    /// or exactly commit.
    pub fn may_continue(&self) -> bool {
        *self == Self::READ_ONLY || *self == Self::COMMIT
    }

    /// Collapses the accumulator into one canonical outcome.
    ///
    /// Precedence: hazard, mixed, other, unknown, then any commit flag seen
    /// together with any rollback flag is mixed, then the remaining flag.
    pub fn normalize(&self) -> Heuristic {
        if self.intersects(Self::HAZARD) {
            return Heuristic::Hazard;
        }
        if self.intersects(Self::MIXED) {
            return Heuristic::Mixed;
        }
        if self.intersects(Self::OTHER) {
            return Heuristic::Other;
        }
        if self.intersects(Self::UNKNOWN) {
            return Heuristic::Unknown;
        }
        let committed = self.intersects(Self::COMMIT | Self::TX_COMMITTED);
        let rolled_back = self.intersects(Self::ROLLBACK | Self::TX_ROLLEDBACK);
        match (committed, rolled_back) {
            (true, true) => Heuristic::Mixed,
            (true, false) => Heuristic::Commit,
            (false, true) => Heuristic::Rollback,
            (false, false) => Heuristic::ReadOnly,
        }
    }
}

impl BitOr for HeuristicFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for HeuristicFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<Heuristic> for HeuristicFlags {
    fn from(heuristic: Heuristic) -> Self {
        heuristic.flags()
    }
}

/// Canonical outcome of a transaction or of one of its phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Heuristic {
    ReadOnly,
    Commit,
    Rollback,
    Mixed,
    Hazard,
    Other,
    Unknown,
}

impl Heuristic {
    pub const ALL: [Heuristic; 7] = [
        Heuristic::ReadOnly,
        Heuristic::Commit,
        Heuristic::Rollback,
        Heuristic::Mixed,
        Heuristic::Hazard,
        Heuristic::Other,
        Heuristic::Unknown,
    ];

    pub fn flags(&self) -> HeuristicFlags {
        match self {
            Heuristic::ReadOnly => HeuristicFlags::READ_ONLY,
            Heuristic::Commit => HeuristicFlags::COMMIT,
            Heuristic::Rollback => HeuristicFlags::ROLLBACK,
            Heuristic::Mixed => HeuristicFlags::MIXED,
            Heuristic::Hazard => HeuristicFlags::HAZARD,
            Heuristic::Other => HeuristicFlags::OTHER,
            Heuristic::Unknown => HeuristicFlags::UNKNOWN,
        }
    }
}

impl fmt::Display for Heuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Heuristic::ReadOnly => "read-only",
            Heuristic::Commit => "commit",
            Heuristic::Rollback => "rollback",
            Heuristic::Mixed => "mixed",
            Heuristic::Hazard => "hazard",
            Heuristic::Other => "other",
            Heuristic::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Which pass of the protocol produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Commit,
    Rollback,
}

/// Result of a single call into a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOutcome {
    ReadOnly,
    Commit,
    Rollback,
    Heuristic(Heuristic),
    SystemError(String),
}

impl ResourceOutcome {
    /// Classifies an XA return or error code.
    pub fn from_xa_code(code: i32) -> Self {
        match code {
            xa::XA_OK => ResourceOutcome::Commit,
            xa::XA_RDONLY => ResourceOutcome::ReadOnly,
            xa::XA_HEURCOM => ResourceOutcome::Heuristic(Heuristic::Commit),
            xa::XA_HEURRB => ResourceOutcome::Heuristic(Heuristic::Rollback),
            xa::XA_HEURMIX => ResourceOutcome::Heuristic(Heuristic::Mixed),
            xa::XA_HEURHAZ => ResourceOutcome::Heuristic(Heuristic::Hazard),
            xa::XA_RBBASE..=xa::XA_RBEND => ResourceOutcome::Rollback,
            other => ResourceOutcome::SystemError(format!("unexpected XA code {}", other)),
        }
    }

    /// Classifies an error raised by an XA resource.
    pub fn from_xa_error(error: &XaError) -> Self {
        match Self::from_xa_code(error.code) {
            ResourceOutcome::SystemError(_) | ResourceOutcome::Commit => {
                ResourceOutcome::SystemError(error.to_string())
            }
            outcome => outcome,
        }
    }

    /// Flags this outcome contributes to the accumulator of `phase`.
    pub fn flags(&self, phase: Phase) -> HeuristicFlags {
        match (self, phase) {
            (ResourceOutcome::ReadOnly, _) => HeuristicFlags::READ_ONLY,
            (ResourceOutcome::SystemError(_), _) => HeuristicFlags::UNKNOWN,
            (ResourceOutcome::Commit, Phase::Prepare) => HeuristicFlags::COMMIT,
            (ResourceOutcome::Rollback, Phase::Prepare) => HeuristicFlags::ROLLBACK,
            (ResourceOutcome::Commit, _)
            | (ResourceOutcome::Heuristic(Heuristic::Commit), Phase::Commit | Phase::Rollback) => {
                HeuristicFlags::TX_COMMITTED
            }
            (ResourceOutcome::Rollback, _)
            | (ResourceOutcome::Heuristic(Heuristic::Rollback), Phase::Commit | Phase::Rollback) => {
                HeuristicFlags::TX_ROLLEDBACK
            }
            (ResourceOutcome::Heuristic(heuristic), _) => heuristic.flags(),
        }
    }

    pub fn is_system_error(&self) -> bool {
        matches!(self, ResourceOutcome::SystemError(_))
    }
}
