use std::path::PathBuf;
use thiserror::Error;

/// Invalid or incomplete service declaration; fatal to that service only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("service '{service}': project directory {} does not exist", path.display())]
    ProjectDirMissing { service: String, path: PathBuf },

    #[error("service '{service}': no default command for runtime '{runtime}' and none declared")]
    NoDefaultCommand { service: String, runtime: String },

    #[error("service '{service}': host type '{host}' is not supported by the local runner")]
    UnsupportedHost { service: String, host: String },

    #[error("service '{service}': {detail}")]
    Invalid { service: String, detail: String },
}

impl ConfigError {
    pub fn service(&self) -> &str {
        match self {
            Self::ProjectDirMissing { service, .. }
            | Self::NoDefaultCommand { service, .. }
            | Self::UnsupportedHost { service, .. }
            | Self::Invalid { service, .. } => service,
        }
    }
}

/// The OS refused to start a service process.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("service '{service}': command '{command}' not found")]
    CommandNotFound { service: String, command: String },

    #[error("service '{service}': working directory {} is not usable", path.display())]
    InvalidWorkingDir { service: String, path: PathBuf },

    #[error("service '{service}': failed to spawn '{command}': {source}")]
    Spawn {
        service: String,
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A stop attempt failed for a reason other than the process already being gone.
#[derive(Error, Debug)]
#[error("service '{service}': failed to terminate pid {pid}: {source}")]
pub struct TerminationError {
    pub service: String,
    pub pid: u32,
    #[source]
    pub source: std::io::Error,
}

/// A single failed probe. Counted, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckError {
    #[error("probe timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("process {0} is not running")]
    ProcessGone(u32),

    #[error("no process to probe")]
    NoProcess,
}

/// A monitored process ended abnormally without being asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashExit {
    pub service: String,
    /// `None` when the process was terminated by a signal or the monitor faulted
    pub exit_code: Option<i32>,
    pub reason: String,
}

impl std::fmt::Display for CrashExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "service '{}' crashed with exit code {}", self.service, code),
            None => write!(f, "service '{}' crashed: {}", self.service, self.reason),
        }
    }
}

/// Errors surfaced by the orchestrator API. Only `Manifest` and `Bootstrap`
/// are fatal to a whole run. Per-service failures ([`ConfigError`],
/// [`LaunchError`], [`TerminationError`]) are recorded on the service instead.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("startup failed: {0}")]
    Bootstrap(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("service '{name}' is {state} and cannot be restarted until it exits")]
    NotRestartable { name: String, state: String },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_exit_mentions_exit_code() {
        let crash = CrashExit {
            service: "api".into(),
            exit_code: Some(3),
            reason: "exited".into(),
        };
        assert_eq!(crash.to_string(), "service 'api' crashed with exit code 3");
    }

    #[test]
    fn config_error_reports_service() {
        let err = ConfigError::NoDefaultCommand {
            service: "web".into(),
            runtime: "cobol".into(),
        };
        assert_eq!(err.service(), "web");
        assert!(err.to_string().contains("cobol"));
    }
}
