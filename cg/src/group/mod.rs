//! Single-shot batch barrier
//!
//! A call group collects up to `capacity` arrivals and runs one batch
//! handler over their payloads:
//! - **join:** arrive with a payload and wait for the outcome
//! - **leave:** consume a unit of capacity without a payload
//! - **flush:** runs once, on capacity or on timeout, whichever comes first

mod config;
mod core;
mod error;
mod handler;
mod pending;
mod status;

pub use config::CallGroupConfig;
pub use core::CallGroup;
pub use error::CallGroupError;
pub use handler::{BatchHandler, FnHandler};
pub use pending::{Outcome, Pending};
pub use status::{FlushTrigger, GroupStatus, Phase};
