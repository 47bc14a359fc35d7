pub mod clienv;
pub mod dashboard;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod user_config;

pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
