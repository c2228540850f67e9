//! CallGroup - single-shot arrival barrier for batching concurrent callers
//!
//! A [`CallGroup`] gathers the payloads of up to N concurrent callers, runs
//! one shared batch handler over them and hands the handler's outcome back
//! to every caller.
//!
//! # Core Concepts
//!
//! - **Exactly Once**: The handler runs once per group, never per caller
//! - **Capacity or Timeout**: The batch flushes when N arrivals are in or the watchdog fires
//! - **Single Use**: Once flushing, every further arrival is rejected
//! - **Shared Outcome**: Success values and failures reach every waiter alike
//!
//! # Example
//!
//! ```ignore
//! use callgroup::CallGroup;
//! use std::time::Duration;
//!
//! let group = CallGroup::new(2, |batch: Vec<u32>| async move {
//!     Ok::<_, eyre::Report>(batch.iter().sum::<u32>())
//! }, Duration::from_secs(1))?;
//!
//! let first = group.join(1)?;
//! let second = group.join(2)?;
//! assert_eq!(first.await?, 3);
//! assert_eq!(second.await?, 3);
//! ```
//!
//! # Modules
//!
//! - [`group`] - The call group itself
//! - [`config`] - Driver configuration loading
//! - [`cli`] - Command-line interface of the `cg` driver

pub mod cli;
pub mod config;
pub mod group;

pub use config::Config;
pub use group::{
    BatchHandler, CallGroup, CallGroupConfig, CallGroupError, FlushTrigger, FnHandler, GroupStatus, Outcome, Pending,
    Phase,
};
