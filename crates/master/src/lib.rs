//! The farmhand master: accepts problems from clients, splits them into
//! partial problems through their drivers, and farms those out to a
//! fluctuating set of workers.
//!
//! - [`queue`]: bounded async FIFO used for every hand-off
//! - [`ledger`]: per-problem partial-problem records and their claims
//! - [`driver`]: one task per problem, generating and folding
//! - [`selection`]: which problem's work is queued next
//! - [`dispatcher`]: worker registry, dispatch loop and problem table
//! - [`liveness`]: periodic worker probes
//! - [`master`]: the public facade

pub mod context;
pub mod dispatcher;
pub mod driver;
pub mod http;
pub mod ledger;
pub mod liveness;
pub mod local;
pub mod master;
pub mod queue;
pub mod selection;
pub mod stats;

pub use dispatcher::{Departure, Dispatcher, WorkerStatus};
pub use master::{Master, Submission};
pub use queue::WorkQueue;
