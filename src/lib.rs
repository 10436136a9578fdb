pub mod backend;
pub mod config;
pub mod core;
pub mod detection;
pub mod diagnostics;
pub mod error;
pub mod execution;
pub mod firmware;
pub mod jobs;
pub mod orchestrator;
pub mod process;
pub mod router;
pub mod server;
pub mod targets;

pub use crate::config::ForgeConfig;
pub use crate::error::{ErrorCode, ForgeError, ForgeResult};
pub use crate::orchestrator::Orchestrator;
pub use crate::router::BackendRouter;
