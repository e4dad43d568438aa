//! Shared vocabulary of the farmhand master: identifiers, opaque payloads,
//! the client-facing [`Problem`] trait, the remote collaborator interfaces,
//! the error taxonomy and configuration.

pub mod config;
pub mod error;
pub mod ids;
pub mod payload;
pub mod problem;
pub mod remote;
pub mod stats;

pub use config::{load_dotenv, MasterConfig};
pub use error::*;
pub use ids::*;
pub use payload::*;
pub use problem::Problem;
pub use remote::*;
pub use stats::{ProblemStatistics, SystemStatistics};
