//! Job state machine.
//!
//! ```text
//! pending    -> processing   dispatcher claims, sets lease
//! processing -> completed    handler success
//! processing -> failed       handler error, or lease reclaim with attempts exhausted
//! processing -> pending      lease reclaim, attempts remaining
//! failed     -> retrying     backoff scheduled
//! retrying   -> pending      backoff elapsed
//! failed     -> dead_letter  attempts exhausted or terminal error class
//! pending    -> canceled     producer cancellation while unclaimed
//! processing -> canceled     handler honored the cancellation signal
//! ```
//!
//! `completed`, `dead_letter` and `canceled` are terminal: no outgoing edges.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    DeadLetter,
    Canceled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Retrying,
        JobState::DeadLetter,
        JobState::Canceled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::DeadLetter | JobState::Canceled
        )
    }

    /// Whether `self -> to` is an edge of the state graph.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Failed, Retrying)
                | (Retrying, Pending)
                | (Failed, DeadLetter)
                | (Pending, Canceled)
                | (Processing, Canceled)
        )
    }

    pub fn check_transition(self, to: JobState) -> Result<(), DomainError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition { from: self, to })
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::DeadLetter => "dead_letter",
            JobState::Canceled => "canceled",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job state: {s}")))
    }
}
