//! Priority lanes.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A named priority class of jobs.
///
/// Declaration order is priority order (highest first); `Ord` follows it, so
/// `Lane::Interactive < Lane::Batch`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// A user is waiting on the answer (RAG queries).
    Interactive,
    /// Approval-triggered work such as model training.
    Approval,
    /// Document ingest and conversion.
    Ingest,
    /// Bulk exports and backfills.
    Batch,
}

impl Lane {
    /// All lanes, highest priority first.
    pub const ALL: [Lane; 4] = [Lane::Interactive, Lane::Approval, Lane::Ingest, Lane::Batch];

    /// Lanes that receive guaranteed fairness slots.
    pub const LOWER: [Lane; 3] = [Lane::Approval, Lane::Ingest, Lane::Batch];

    /// Zero-based priority rank (0 is highest).
    pub const fn rank(self) -> usize {
        match self {
            Lane::Interactive => 0,
            Lane::Approval => 1,
            Lane::Ingest => 2,
            Lane::Batch => 3,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Lane::Interactive => "interactive",
            Lane::Approval => "approval",
            Lane::Ingest => "ingest",
            Lane::Batch => "batch",
        }
    }
}

impl core::fmt::Display for Lane {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(Lane::Interactive),
            "approval" => Ok(Lane::Approval),
            "ingest" => Ok(Lane::Ingest),
            "batch" => Ok(Lane::Batch),
            other => Err(DomainError::validation(format!("unknown lane: {other}"))),
        }
    }
}
