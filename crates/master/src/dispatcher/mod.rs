//! Worker registry and dispatch loop.
//!
//! Split into focused submodules:
//! - `core`: Dispatcher struct, worker registration and active/passive moves
//! - `dispatch`: offering work to a worker and delivering it
//! - `results`: returned solutions and failure reports
//! - `problems`: the problem table, client notices and teardown
//! - `collector`: feeding the shared queue across problems

mod collector;
mod core;
mod dispatch;
mod problems;
mod results;

pub use self::core::{Departure, Dispatcher, WorkerRecord, WorkerStatus};
