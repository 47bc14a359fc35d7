//! Process orchestration and lifecycle engine.
//!
//! ```text
//!  ServiceDeclaration ──► RuntimeBuilder ──► RuntimeConfig
//!        (manifest)        (+ env::resolve)        │
//!                                                  ▼
//!                                            Orchestrator
//!                                   ┌──────────────┼──────────────┐
//!                              monitor(a)      monitor(b)     monitor(c)
//!                               │    │
//!                 ProcessExecutor    HealthChecker (per-service timer)
//!                               │
//!                           LogBuffer ──► live log subscribers
//!
//!  Orchestrator::subscribe_changes ──► StatePublisher ──► dashboard clients
//! ```

pub mod builder;
pub mod env;
pub mod events;
pub mod executor;
pub mod health;
pub mod log_buffer;
pub mod protocol;
pub mod services;

pub use builder::{HealthDefaults, PortAllocator, RuntimeBuilder};
pub use events::{StateEvent, StatePublisher, Subscription};
pub use executor::{
    default_terminator, ForceKill, LogStream, ProcessExecutor, ProcessTerminator, ServiceProcess,
    StopOutcome,
};
#[cfg(unix)]
pub use executor::InterruptThenKill;
pub use health::{HealthChecker, HealthReport, HealthTracker, ProbeOutcome};
pub use log_buffer::LogBuffer;
pub use protocol::{
    HealthCheckKind, HealthCheckResult, HealthCheckSpec, HealthStatus, LogEntry, RuntimeConfig,
    ServiceInfo, ServiceState, StreamKind,
};
pub use services::{supervise, Orchestrator, DEFAULT_GRACE_PERIOD};
