//! CallGroup error types

use std::sync::Arc;

use thiserror::Error;

use super::status::Phase;

/// Errors that can occur while arriving at or flushing a call group
///
/// Cloneable so that one flush outcome can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum CallGroupError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Capacity of {capacity} exceeded, group is {phase}")]
    CapacityExceeded { capacity: usize, phase: Phase },

    #[error("Batch handler failed: {0}")]
    HandlerFailed(Arc<eyre::Report>),

    #[error("Batch handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Call group dropped before delivering an outcome")]
    Abandoned,
}

impl CallGroupError {
    /// Check if this is an over-capacity rejection
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, CallGroupError::CapacityExceeded { .. })
    }

    /// Check if this error came out of the batch handler
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            CallGroupError::HandlerFailed(_) | CallGroupError::HandlerPanicked(_)
        )
    }

    /// Check if two errors are the same propagated handler failure
    ///
    /// Every waiter of one flush gets a clone of the same `Arc`, so pointer
    /// equality identifies the shared failure.
    pub fn same_failure(&self, other: &CallGroupError) -> bool {
        match (self, other) {
            (CallGroupError::HandlerFailed(a), CallGroupError::HandlerFailed(b)) => Arc::ptr_eq(a, b),
            (CallGroupError::HandlerPanicked(a), CallGroupError::HandlerPanicked(b)) => a == b,
            _ => false,
        }
    }
}
