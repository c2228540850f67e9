//! Lifecycle and snapshot types for a call group

use std::fmt;

use serde::{Deserialize, Serialize};

/// Cycle state of a call group
///
/// `Collecting --(capacity | timeout)--> Flushing --(handler done)--> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Accepting arrivals
    Collecting,

    /// Handler is running, arrivals are rejected
    Flushing,

    /// Outcome recorded and delivered
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Collecting => write!(f, "collecting"),
            Phase::Flushing => write!(f, "flushing"),
            Phase::Closed => write!(f, "closed"),
        }
    }
}

/// Which path started the flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushTrigger {
    /// The last unit of capacity was consumed by an arrival
    Capacity,

    /// The watchdog fired before capacity was reached
    Timeout,
}

/// Point-in-time view of a call group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    #[serde(rename = "group-id")]
    pub group_id: String,
    pub capacity: usize,
    pub remaining: usize,
    /// Payloads currently held (zero once the batch was handed to the handler)
    pub collected: usize,
    /// Waiters registered and not yet released
    pub waiters: usize,
    pub phase: Phase,
    pub trigger: Option<FlushTrigger>,
}

impl GroupStatus {
    /// Number of arrivals accepted so far
    pub fn arrivals(&self) -> usize {
        self.capacity - self.remaining
    }
}
