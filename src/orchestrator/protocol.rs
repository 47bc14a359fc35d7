//! Shared data model for the orchestrator
//!
//! Everything that crosses a component boundary lives here: the resolved
//! [`RuntimeConfig`], the per-process [`ServiceState`], health results and the
//! [`ServiceInfo`] snapshot rows served to dashboard clients. All wire-facing
//! types serialize as camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle state of a single service process.
///
/// States only move forward: `Starting -> Running -> (Stopping ->) Stopped | Crashed`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Process spawned, no readiness signal yet
    Starting,
    /// First output line or first successful health probe observed
    Running,
    /// Stop requested, waiting for the process to exit
    Stopping,
    /// Exited cleanly or was stopped on request
    Stopped,
    /// Exited with a non-zero/abnormal status without being asked to stop
    Crashed,
}

impl ServiceState {
    /// Check if service is in a running state
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// Check if the process has exited and its monitor is done
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Crashed)
    }

    fn rank(&self) -> u8 {
        match self {
            ServiceState::Starting => 0,
            ServiceState::Running => 1,
            ServiceState::Stopping => 2,
            ServiceState::Stopped | ServiceState::Crashed => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the state machine monotonic.
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        next.rank() > self.rank()
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health classification of a service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Check succeeded but slowly, or failed fewer times than the threshold
    Degraded,
    Unhealthy,
    /// No check has completed yet
    Starting,
    /// No meaningful check exists for this service
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Starting => "starting",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a service is probed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    /// GET against `path` on the assigned port
    Http,
    /// Connect-and-close on the assigned port
    Tcp,
    /// OS-level liveness of the tracked pid
    Process,
    /// Checks disabled
    None,
}

impl HealthCheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckKind::Http => "http",
            HealthCheckKind::Tcp => "tcp",
            HealthCheckKind::Process => "process",
            HealthCheckKind::None => "none",
        }
    }
}

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_DEGRADED_LATENCY: Duration = Duration::from_secs(1);

/// Health-check descriptor attached to a [`RuntimeConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub kind: HealthCheckKind,
    /// Request path for HTTP probes
    pub path: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures needed before a service is reported unhealthy
    pub failure_threshold: u32,
    /// Successful probes slower than this are reported degraded
    pub degraded_latency: Duration,
}

impl HealthCheckSpec {
    pub fn new(kind: HealthCheckKind) -> Self {
        Self {
            kind,
            path: None,
            interval: DEFAULT_HEALTH_INTERVAL,
            timeout: DEFAULT_HEALTH_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            degraded_latency: DEFAULT_DEGRADED_LATENCY,
        }
    }

    pub fn http(path: impl Into<String>) -> Self {
        Self::new(HealthCheckKind::Http).path(path)
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn degraded_latency(mut self, latency: Duration) -> Self {
        self.degraded_latency = latency;
        self
    }
}

/// Resolved, executable description of how to launch one service.
///
/// Built once before any process starts and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// 0 means the service has no network port
    pub port: u16,
    pub health_check: HealthCheckSpec,
    /// Final environment for the child process
    pub env: HashMap<String, String>,
    pub language: Option<String>,
    pub framework: Option<String>,
}

impl RuntimeConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            port: 0,
            health_check: HealthCheckSpec::new(HealthCheckKind::Process),
            env: HashMap::new(),
            language: None,
            framework: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = spec;
        self
    }

    /// Local URL for services bound to a port.
    pub fn url(&self) -> Option<String> {
        (self.port > 0).then(|| format!("http://localhost:{}", self.port))
    }

    /// Command line as typed by a human, for display only.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Latest health probe outcome for one service. Only the latest is kept.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub service_name: String,
    pub status: HealthStatus,
    pub check_type: HealthCheckKind,
    pub response_time_nanos: u64,
    pub consecutive_failures: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    /// Placeholder used before the first probe completes.
    pub fn pending(service_name: impl Into<String>, kind: HealthCheckKind) -> Self {
        let status = match kind {
            HealthCheckKind::None => HealthStatus::Unknown,
            _ => HealthStatus::Starting,
        };
        Self {
            service_name: service_name.into(),
            status,
            check_type: kind,
            response_time_nanos: 0,
            consecutive_failures: 0,
            timestamp: Utc::now(),
            error: None,
        }
    }
}

/// Which pipe a log line came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of service output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub service: String,
    pub stream: StreamKind,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogEntry {
    pub fn new(service: impl Into<String>, stream: StreamKind, text: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            stream,
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

/// Snapshot row for one service, as served to the dashboard.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    pub status: ServiceState,
    pub health: HealthStatus,
    /// 0 when the service has no port
    pub port: u16,
    pub url: Option<String>,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Number of manual restarts during this run
    pub restarts: u32,
    pub last_error: Option<String>,
    pub health_check: HealthCheckResult,
}

impl ServiceInfo {
    /// Fields that count as a status transition for change notifications.
    pub fn same_status(&self, other: &ServiceInfo) -> bool {
        self.status == other.status
            && self.pid == other.pid
            && self.restarts == other.restarts
            && self.exit_code == other.exit_code
    }
}
