// clusterops - operations console core
//
// Runs long-running cluster automation jobs in the background, tracks each one
// as a pollable task, and keeps the shared inventory consistent across them.

pub mod api;
pub mod config;
pub mod executor;
pub mod inventory;
pub mod orchestrator;
pub mod output;
pub mod tasks;

pub use config::ConsoleConfig;
pub use inventory::{Host, HostRole, InventorySnapshot};
pub use orchestrator::{OperationRequest, Orchestrator, PollResponse, PollStatus, StartResponse};
pub use output::{OpsError, ValidationError};
pub use tasks::{TaskExecutor, TaskRegistry};

/// Version of the clusterops tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ConsoleConfig;
    pub use crate::inventory::{Host, HostDirectory, HostRole, StaticDirectory};
    pub use crate::orchestrator::{OperationRequest, Orchestrator, PollResponse, PollStatus};
    pub use crate::output::{OpsError, ValidationError};
}
