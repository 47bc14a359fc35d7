//! Service Orchestrator
//!
//! Owns every service for one run. The registry is fixed when the
//! orchestrator is built; each entry carries its own lock, so an update to one
//! service never waits on another and a snapshot row is always internally
//! consistent.
//!
//! Every launch gets a monitor task that is the sole owner of its
//! `ServiceProcess`. Monitors run under [`supervise`], which turns a panic
//! into a `Crashed` state for that service only. Cancellation flows one way:
//! the global shutdown token is the parent of each service's stop token, so a
//! sibling's exit can never cancel anyone else.

use super::executor::{ProcessExecutor, StopOutcome};
use super::health::{HealthChecker, HealthReport};
use super::log_buffer::LogBuffer;
use super::protocol::{
    HealthCheckResult, HealthStatus, LogEntry, RuntimeConfig, ServiceInfo, ServiceState,
};
use crate::error::{CrashExit, OrchestratorError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Time allowed on top of the grace period for a forced kill to be reaped.
const KILL_SLACK: Duration = Duration::from_secs(2);
/// How long to keep reading buffered output after a process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

struct EntryState {
    info: ServiceInfo,
    /// Bumped on every (re)launch; stale monitors and probes are ignored
    generation: u64,
    stop: Option<CancellationToken>,
}

struct ServiceEntry {
    config: RuntimeConfig,
    state: RwLock<EntryState>,
}

impl ServiceEntry {
    fn new(config: RuntimeConfig) -> Self {
        let info = ServiceInfo {
            name: config.name.clone(),
            status: ServiceState::Stopped,
            health: HealthStatus::Unknown,
            port: config.port,
            url: config.url(),
            pid: None,
            start_time: None,
            exit_code: None,
            restarts: 0,
            last_error: None,
            health_check: HealthCheckResult::pending(&config.name, config.health_check.kind),
        };
        Self {
            config,
            state: RwLock::new(EntryState {
                info,
                generation: 0,
                stop: None,
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, EntryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, EntryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// How a monitor's wait ended.
enum Exit {
    Exited(std::io::Result<std::process::ExitStatus>),
    StopRequested,
}

pub struct Orchestrator {
    entries: HashMap<String, Arc<ServiceEntry>>,
    order: Vec<String>,
    executor: ProcessExecutor,
    health: HealthChecker,
    logs: Arc<LogBuffer>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    grace_period: Duration,
    changes: watch::Sender<u64>,
}

impl Orchestrator {
    /// Build the registry. Names must be unique; a duplicate is a manifest error.
    pub fn new(configs: Vec<RuntimeConfig>, logs: Arc<LogBuffer>) -> Result<Self> {
        Self::with_executor(configs, logs, ProcessExecutor::default())
    }

    pub fn with_executor(
        configs: Vec<RuntimeConfig>,
        logs: Arc<LogBuffer>,
        executor: ProcessExecutor,
    ) -> Result<Self> {
        let mut entries = HashMap::with_capacity(configs.len());
        let mut order = Vec::with_capacity(configs.len());
        for config in configs {
            let name = config.name.clone();
            if entries
                .insert(name.clone(), Arc::new(ServiceEntry::new(config)))
                .is_some()
            {
                return Err(OrchestratorError::Manifest(format!(
                    "duplicate service name '{}'",
                    name
                )));
            }
            order.push(name);
        }

        let (changes, _) = watch::channel(0);
        Ok(Self {
            entries,
            order,
            executor,
            health: HealthChecker::new(),
            logs,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            changes,
        })
    }

    /// Grace period each service gets between interrupt and kill.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn service_names(&self) -> &[String] {
        &self.order
    }

    /// Start every registered service. Returns once all monitors are spawned.
    pub fn launch(self: &Arc<Self>) {
        info!("Launching {} service(s)", self.order.len());
        for name in &self.order {
            if let Some(entry) = self.entries.get(name) {
                self.spawn_monitor(Arc::clone(entry), false);
            }
        }
    }

    /// Consistent per-entry view of every service, in declaration order.
    pub fn snapshot(&self) -> Vec<ServiceInfo> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| entry.read().info.clone())
            .collect()
    }

    pub fn service(&self, name: &str) -> Result<ServiceInfo> {
        self.entry(name).map(|e| e.read().info.clone())
    }

    pub fn health_report(&self) -> HealthReport {
        HealthReport::from_services(&self.snapshot())
    }

    /// Receiver that changes whenever any entry is updated. Keeps only the latest value.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Stop one service and wait for its monitor to record the outcome.
    /// Stopping a service that already exited succeeds.
    pub async fn stop_service(&self, name: &str) -> Result<ServiceInfo> {
        let entry = self.entry(name)?;
        let token = {
            let state = entry.read();
            if state.info.status.is_terminal() {
                return Ok(state.info.clone());
            }
            state.stop.clone()
        };

        info!("Stopping service '{}'", name);
        if let Some(token) = token {
            token.cancel();
        }
        self.wait_for_terminal(&entry).await;
        let info = entry.read().info.clone();
        Ok(info)
    }

    /// Relaunch a service that has reached a terminal state.
    pub fn restart_service(self: &Arc<Self>, name: &str) -> Result<ServiceInfo> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let entry = self.entry(name)?;
        {
            let state = entry.read();
            if !state.info.status.is_terminal() {
                return Err(OrchestratorError::NotRestartable {
                    name: name.to_string(),
                    state: state.info.status.to_string(),
                });
            }
        }

        info!("Restarting service '{}'", name);
        self.spawn_monitor(Arc::clone(&entry), true);
        let info = entry.read().info.clone();
        Ok(info)
    }

    /// Stop every service concurrently and wait for all monitors, bounded by
    /// the grace period plus time to reap forced kills.
    pub async fn shutdown(&self) {
        info!("Shutting down all services");
        self.shutdown.cancel();
        self.tasks.close();

        let limit = self.grace_period + KILL_SLACK;
        if tokio::time::timeout(limit, self.tasks.wait()).await.is_err() {
            warn!("Some services did not finish stopping within {:?}", limit);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn entry(&self, name: &str) -> Result<Arc<ServiceEntry>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownService(name.to_string()))
    }

    async fn wait_for_terminal(&self, entry: &ServiceEntry) {
        let mut rx = self.changes.subscribe();
        loop {
            if entry.read().info.status.is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Apply `f` to the entry under its lock if `generation` is still current.
    fn update<F>(&self, entry: &ServiceEntry, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut ServiceInfo),
    {
        {
            let mut state = entry.write();
            if state.generation != generation {
                return false;
            }
            f(&mut state.info);
        }
        self.notify();
        true
    }

    fn spawn_monitor(self: &Arc<Self>, entry: Arc<ServiceEntry>, restart: bool) {
        let token = self.shutdown.child_token();
        let generation = {
            let mut state = entry.write();
            state.generation += 1;
            state.stop = Some(token.clone());

            let info = &mut state.info;
            info.status = ServiceState::Starting;
            info.health = HealthStatus::Starting;
            info.pid = None;
            info.start_time = None;
            info.exit_code = None;
            info.last_error = None;
            info.health_check =
                HealthCheckResult::pending(&entry.config.name, entry.config.health_check.kind);
            info.health = info.health_check.status;
            if restart {
                info.restarts += 1;
            }
            state.generation
        };
        self.notify();

        let name = entry.config.name.clone();
        let this = Arc::clone(self);
        let monitor_entry = Arc::clone(&entry);
        let monitor_token = token.clone();
        let monitor = async move { this.monitor(monitor_entry, monitor_token, generation).await };

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Some(crash) = supervise(&name, monitor).await {
                // The monitor is gone; make sure its probes go with it.
                token.cancel();
                this.update(&entry, generation, |info| {
                    info.status = ServiceState::Crashed;
                    info.health = HealthStatus::Unhealthy;
                    info.health_check.status = HealthStatus::Unhealthy;
                    info.exit_code = crash.exit_code;
                    info.last_error = Some(crash.reason.clone());
                });
            }
        });
    }

    async fn monitor(self: Arc<Self>, entry: Arc<ServiceEntry>, stop: CancellationToken, generation: u64) {
        let config = &entry.config;
        let name = config.name.as_str();

        let mut proc = match self.executor.start(config) {
            Ok(proc) => proc,
            Err(e) => {
                error!("Failed to start service '{}': {}", name, e);
                self.update(&entry, generation, |info| {
                    info.status = ServiceState::Crashed;
                    info.health = HealthStatus::Unhealthy;
                    info.health_check.status = HealthStatus::Unhealthy;
                    info.last_error = Some(e.to_string());
                });
                return;
            }
        };

        self.update(&entry, generation, |info| {
            info.pid = proc.pid;
            info.start_time = Some(proc.start_time);
        });

        let (mut stdout, mut stderr) = self.executor.stream_output(&mut proc);

        let probes = stop.child_token();
        let health = self.spawn_probes(&entry, generation, proc.pid, probes.clone());

        let mut stdout_open = true;
        let mut stderr_open = true;
        let exit = loop {
            tokio::select! {
                status = proc.wait() => break Exit::Exited(status),
                _ = stop.cancelled() => break Exit::StopRequested,
                line = stdout.next(), if stdout_open => match line {
                    Some(line) => self.on_output(&entry, generation, line),
                    None => stdout_open = false,
                },
                line = stderr.next(), if stderr_open => match line {
                    Some(line) => self.on_output(&entry, generation, line),
                    None => stderr_open = false,
                },
            }
        };

        probes.cancel();
        if let Err(e) = health.await {
            debug!("Health task for '{}' ended abnormally: {}", name, e);
        }

        match exit {
            Exit::StopRequested => {
                self.update(&entry, generation, |info| {
                    if info.status.can_transition_to(ServiceState::Stopping) {
                        info.status = ServiceState::Stopping;
                    }
                });
                let result = self.executor.stop(&mut proc, self.grace_period).await;
                let last_error = match result {
                    Ok(StopOutcome::Forced) => {
                        info!("Service '{}' was force killed", name);
                        None
                    }
                    Ok(outcome) => {
                        debug!("Service '{}' stopped ({:?})", name, outcome);
                        None
                    }
                    Err(e) => {
                        warn!("{}", e);
                        Some(e.to_string())
                    }
                };
                let exit_code = proc.exit_status().and_then(|s| s.code());
                self.update(&entry, generation, |info| {
                    info.status = ServiceState::Stopped;
                    info.health = HealthStatus::Unknown;
                    info.health_check.status = HealthStatus::Unknown;
                    info.exit_code = exit_code;
                    info.last_error = last_error;
                });
            }
            Exit::Exited(status) => {
                let (next, exit_code, reason) = match status {
                    Ok(status) if status.success() => (ServiceState::Stopped, Some(0), None),
                    Ok(status) => (
                        ServiceState::Crashed,
                        status.code(),
                        Some(format!("process exited: {}", status)),
                    ),
                    Err(e) => (
                        ServiceState::Crashed,
                        None,
                        Some(format!("failed to wait for process: {}", e)),
                    ),
                };
                proc.advance(next);

                match &reason {
                    Some(reason) => {
                        let crash = CrashExit {
                            service: name.to_string(),
                            exit_code,
                            reason: reason.clone(),
                        };
                        error!("{}", crash);
                    }
                    None => info!("Service '{}' exited cleanly", name),
                }

                self.update(&entry, generation, |info| {
                    info.status = next;
                    info.health = match next {
                        ServiceState::Crashed => HealthStatus::Unhealthy,
                        _ => HealthStatus::Unknown,
                    };
                    info.health_check.status = info.health;
                    info.exit_code = exit_code;
                    info.last_error = reason;
                });
            }
        }

        // Lines written just before exit are still in the pipes.
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(line) = stdout.next().await {
                self.logs.push(line);
            }
            while let Some(line) = stderr.next().await {
                self.logs.push(line);
            }
        })
        .await;

        {
            let mut state = entry.write();
            if state.generation == generation {
                state.stop = None;
            }
        }
        debug!("Monitor for '{}' finished", name);
    }

    fn on_output(&self, entry: &ServiceEntry, generation: u64, line: LogEntry) {
        self.logs.push(line);
        if entry.read().info.status == ServiceState::Starting {
            self.mark_running(entry, generation, "first output");
        }
    }

    fn mark_running(&self, entry: &ServiceEntry, generation: u64, signal: &str) {
        let mut ready = false;
        self.update(entry, generation, |info| {
            if info.status == ServiceState::Starting {
                info.status = ServiceState::Running;
                ready = true;
            }
        });
        if ready {
            info!("Service '{}' is running ({})", entry.config.name, signal);
        }
    }

    fn spawn_probes(
        self: &Arc<Self>,
        entry: &Arc<ServiceEntry>,
        generation: u64,
        pid: Option<u32>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            let spec = entry.config.health_check.clone();
            let port = entry.config.port;
            let name = entry.config.name.clone();
            let checker = this.health.clone();
            checker
                .run(&name, &spec, port, pid, cancel, |outcome, result| {
                    let up = outcome.is_up();
                    this.update(&entry, generation, |info| {
                        if info.status.is_terminal() {
                            return;
                        }
                        if info.health != result.status {
                            debug!(
                                "Service '{}' health {} -> {}",
                                info.name, info.health, result.status
                            );
                        }
                        info.health = result.status;
                        info.health_check = result;
                    });
                    if up {
                        this.mark_running(&entry, generation, "health check passed");
                    }
                })
                .await;
        })
    }
}

/// Run `task` on its own tokio task and convert a panic into a [`CrashExit`].
pub async fn supervise<F>(service: &str, task: F) -> Option<CrashExit>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(()) => None,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let crash = CrashExit {
                service: service.to_string(),
                exit_code: None,
                reason: format!("monitor panicked: {}", reason),
            };
            error!("{}", crash);
            Some(crash)
        }
        Err(e) => {
            debug!("Monitor for '{}' was cancelled: {}", service, e);
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::orchestrator::env::os_environment;
    use crate::orchestrator::protocol::{HealthCheckKind, HealthCheckSpec};
    use std::time::Instant;

    fn shell(name: &str, script: &str) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::new(name, "sh")
            .args(["-c", script])
            .health_check(HealthCheckSpec::new(HealthCheckKind::Process));
        cfg.env = os_environment();
        cfg
    }

    fn orchestrator(configs: Vec<RuntimeConfig>) -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::new(configs, Arc::new(LogBuffer::default()))
                .unwrap()
                .with_grace_period(Duration::from_millis(500)),
        )
    }

    async fn wait_until<F>(orch: &Orchestrator, mut done: F)
    where
        F: FnMut(&[ServiceInfo]) -> bool,
    {
        let mut rx = orch.subscribe_changes();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if done(&orch.snapshot()) {
                return;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "timed out, last snapshot: {:?}", orch.snapshot());
            let _ = tokio::time::timeout(left.min(Duration::from_millis(100)), rx.changed()).await;
        }
    }

    fn state_of(snapshot: &[ServiceInfo], name: &str) -> ServiceState {
        snapshot
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.status)
            .unwrap()
    }

    const READY_AND_WAIT: &str = "echo ready; exec sleep 30";

    #[tokio::test]
    async fn first_output_marks_running() {
        let cfg = shell("a", READY_AND_WAIT).health_check(HealthCheckSpec::new(HealthCheckKind::None));
        let orch = orchestrator(vec![cfg]);
        orch.launch();
        wait_until(&orch, |s| state_of(s, "a") == ServiceState::Running).await;

        let info = orch.service("a").unwrap();
        assert!(info.pid.is_some());
        assert!(info.start_time.is_some());
        let lines: Vec<_> = orch.logs().tail("a", 10).into_iter().map(|l| l.text).collect();
        assert_eq!(lines, vec!["ready"]);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn silent_process_runs_once_pid_is_alive() {
        let cfg = shell("worker", "exec sleep 30").health_check(
            HealthCheckSpec::new(HealthCheckKind::Process).interval(Duration::from_millis(50)),
        );
        let orch = orchestrator(vec![cfg]);
        orch.launch();
        wait_until(&orch, |s| state_of(s, "worker") == ServiceState::Running).await;

        let worker = orch.service("worker").unwrap();
        assert_eq!(worker.health, HealthStatus::Unknown);
        assert!(worker.pid.is_some());
        assert!(orch.logs().tail("worker", 10).is_empty());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn one_crash_leaves_siblings_running() {
        let orch = orchestrator(vec![
            shell("a", READY_AND_WAIT),
            shell("b", READY_AND_WAIT),
            shell("c", READY_AND_WAIT),
        ]);
        orch.launch();
        wait_until(&orch, |s| s.iter().all(|i| i.status == ServiceState::Running)).await;

        let pid = orch.service("a").unwrap().pid.unwrap();
        // SAFETY: signalling a child we spawned
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };

        wait_until(&orch, |s| state_of(s, "a") == ServiceState::Crashed).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snap = orch.snapshot();
        assert_eq!(state_of(&snap, "a"), ServiceState::Crashed);
        assert_eq!(state_of(&snap, "b"), ServiceState::Running);
        assert_eq!(state_of(&snap, "c"), ServiceState::Running);
        assert!(!orch.is_shutting_down());

        for name in ["b", "c"] {
            let pid = orch.service(name).unwrap().pid.unwrap();
            assert!(crate::orchestrator::executor::is_process_running(pid));
        }
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn nonzero_exit_records_crash_with_code() {
        let orch = orchestrator(vec![
            shell("flaky", "echo booting; sleep 0.2; exit 3"),
            shell("steady", READY_AND_WAIT),
        ]);
        orch.launch();
        wait_until(&orch, |s| state_of(s, "flaky") == ServiceState::Crashed).await;

        let flaky = orch.service("flaky").unwrap();
        assert_eq!(flaky.exit_code, Some(3));
        assert_eq!(flaky.health, HealthStatus::Unhealthy);
        assert!(flaky.last_error.is_some());
        assert_eq!(orch.service("steady").unwrap().status, ServiceState::Running);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn clean_exit_is_stopped_not_crashed() {
        let orch = orchestrator(vec![shell("job", "echo done")]);
        orch.launch();
        wait_until(&orch, |s| s[0].status.is_terminal()).await;
        let job = orch.service("job").unwrap();
        assert_eq!(job.status, ServiceState::Stopped);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.health, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn launch_error_is_isolated() {
        let orch = orchestrator(vec![
            RuntimeConfig::new("broken", "definitely-not-a-real-binary-42"),
            shell("ok", READY_AND_WAIT),
        ]);
        orch.launch();
        wait_until(&orch, |s| {
            state_of(s, "broken") == ServiceState::Crashed && state_of(s, "ok") == ServiceState::Running
        })
        .await;
        assert!(orch
            .service("broken")
            .unwrap()
            .last_error
            .unwrap()
            .contains("not found"));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn stop_service_leaves_others_alone() {
        let orch = orchestrator(vec![shell("a", READY_AND_WAIT), shell("b", READY_AND_WAIT)]);
        orch.launch();
        wait_until(&orch, |s| s.iter().all(|i| i.status == ServiceState::Running)).await;

        let a = orch.stop_service("a").await.unwrap();
        assert_eq!(a.status, ServiceState::Stopped);
        assert_eq!(orch.service("b").unwrap().status, ServiceState::Running);

        // stopping again is a no-op
        assert_eq!(orch.stop_service("a").await.unwrap().status, ServiceState::Stopped);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn restart_requires_terminal_state() {
        let orch = orchestrator(vec![shell("a", READY_AND_WAIT)]);
        orch.launch();
        wait_until(&orch, |s| s[0].status == ServiceState::Running).await;

        assert!(matches!(
            orch.restart_service("a"),
            Err(OrchestratorError::NotRestartable { .. })
        ));

        let old_pid = orch.stop_service("a").await.unwrap().pid;
        let info = orch.restart_service("a").unwrap();
        assert_eq!(info.restarts, 1);
        assert_eq!(info.status, ServiceState::Starting);

        wait_until(&orch, |s| s[0].status == ServiceState::Running).await;
        assert_ne!(orch.service("a").unwrap().pid, old_pid);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_service_is_reported() {
        let orch = orchestrator(vec![shell("a", "true")]);
        assert!(matches!(
            orch.stop_service("nope").await,
            Err(OrchestratorError::UnknownService(_))
        ));
        assert!(matches!(
            orch.restart_service("nope"),
            Err(OrchestratorError::UnknownService(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = Orchestrator::new(
            vec![shell("a", "true"), shell("a", "true")],
            Arc::new(LogBuffer::default()),
        );
        assert!(matches!(result, Err(OrchestratorError::Manifest(_))));
    }

    #[tokio::test]
    async fn shutdown_stops_everything_within_grace() {
        let orch = orchestrator(vec![
            shell("polite", READY_AND_WAIT),
            shell("stubborn", "trap '' INT; echo ready; exec sleep 30"),
        ]);
        orch.launch();
        wait_until(&orch, |s| s.iter().all(|i| i.status == ServiceState::Running)).await;

        let started = Instant::now();
        orch.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(orch
            .snapshot()
            .iter()
            .all(|i| i.status == ServiceState::Stopped));
        assert!(matches!(
            orch.restart_service("polite"),
            Err(OrchestratorError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn snapshots_are_consistent_under_concurrent_updates() {
        let names: Vec<String> = (0..4).map(|i| format!("svc{i}")).collect();
        let configs = names
            .iter()
            .map(|n| shell(n, "i=0; while [ $i -lt 50 ]; do echo $i; i=$((i+1)); done; sleep 0.3; exit 1"))
            .collect();
        let orch = orchestrator(configs);
        orch.launch();

        let reader = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move {
                for _ in 0..500 {
                    for info in orch.snapshot() {
                        // Crashed always carries unhealthy and an exit code in the same write
                        if info.status == ServiceState::Crashed {
                            assert_eq!(info.health, HealthStatus::Unhealthy);
                            assert_eq!(info.exit_code, Some(1));
                        }
                        if info.status == ServiceState::Running {
                            assert!(info.pid.is_some());
                        }
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        wait_until(&orch, |s| s.iter().all(|i| i.status == ServiceState::Crashed)).await;
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn supervise_turns_panic_into_crash() {
        let crash = supervise("boom", async { panic!("kaboom") }).await.unwrap();
        assert_eq!(crash.service, "boom");
        assert_eq!(crash.exit_code, None);
        assert!(crash.reason.contains("kaboom"));

        assert!(supervise("fine", async {}).await.is_none());
    }
}
