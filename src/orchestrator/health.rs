//! Health Checker
//!
//! Each running service gets its own periodic probe task. Raw probe outcomes
//! go through a [`HealthTracker`], which owns the flapping rules: a failure
//! only turns a service `unhealthy` after `failure_threshold` consecutive
//! misses, and a slow success is `degraded` rather than `healthy`.

use super::executor::is_process_running;
use super::protocol::{
    HealthCheckKind, HealthCheckResult, HealthCheckSpec, HealthStatus, ServiceInfo, ServiceState,
};
use crate::error::HealthCheckError;
use chrono::Utc;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// `tokio::time::interval` panics on zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success(Duration),
    Failure(HealthCheckError),
    /// The pid is alive. Enough to call the service up, not enough to call it healthy.
    Alive,
    /// Nothing to judge
    Inconclusive,
}

impl ProbeOutcome {
    /// Whether the service answered at all. Drives the Starting to Running move.
    pub fn is_up(&self) -> bool {
        matches!(self, ProbeOutcome::Success(_) | ProbeOutcome::Alive)
    }
}

/// Folds probe outcomes into the latest [`HealthCheckResult`] for one service.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    service: String,
    kind: HealthCheckKind,
    failure_threshold: u32,
    degraded_latency: Duration,
    consecutive_failures: u32,
    status: HealthStatus,
}

impl HealthTracker {
    pub fn new(service: impl Into<String>, spec: &HealthCheckSpec) -> Self {
        let service = service.into();
        let status = HealthCheckResult::pending(&service, spec.kind).status;
        Self {
            service,
            kind: spec.kind,
            failure_threshold: spec.failure_threshold.max(1),
            degraded_latency: spec.degraded_latency,
            consecutive_failures: 0,
            status,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record(&mut self, outcome: ProbeOutcome) -> HealthCheckResult {
        let mut response_time = Duration::ZERO;
        let mut error = None;

        if self.kind == HealthCheckKind::None {
            self.status = HealthStatus::Unknown;
        } else {
            match outcome {
                ProbeOutcome::Success(latency) => {
                    response_time = latency;
                    self.consecutive_failures = 0;
                    self.status = if latency > self.degraded_latency {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Healthy
                    };
                }
                ProbeOutcome::Alive | ProbeOutcome::Inconclusive => {
                    self.consecutive_failures = 0;
                    self.status = HealthStatus::Unknown;
                }
                ProbeOutcome::Failure(err) => {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    self.status = if self.consecutive_failures >= self.failure_threshold {
                        HealthStatus::Unhealthy
                    } else {
                        match self.status {
                            HealthStatus::Healthy | HealthStatus::Degraded => HealthStatus::Degraded,
                            other => other,
                        }
                    };
                    error = Some(err.to_string());
                }
            }
        }

        HealthCheckResult {
            service_name: self.service.clone(),
            status: self.status,
            check_type: self.kind,
            response_time_nanos: u64::try_from(response_time.as_nanos()).unwrap_or(u64::MAX),
            consecutive_failures: self.consecutive_failures,
            timestamp: Utc::now(),
            error,
        }
    }
}

/// Executes probes. One instance is shared by every service.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Run one probe against a service.
    pub async fn probe(&self, spec: &HealthCheckSpec, port: u16, pid: Option<u32>) -> ProbeOutcome {
        match spec.kind {
            HealthCheckKind::Http => {
                let path = spec.path.as_deref().unwrap_or("/");
                self.probe_http(port, path, spec.timeout).await
            }
            HealthCheckKind::Tcp => probe_tcp(port, spec.timeout).await,
            HealthCheckKind::Process => match pid {
                None => ProbeOutcome::Failure(HealthCheckError::NoProcess),
                Some(pid) if is_process_running(pid) => ProbeOutcome::Alive,
                Some(pid) => ProbeOutcome::Failure(HealthCheckError::ProcessGone(pid)),
            },
            HealthCheckKind::None => ProbeOutcome::Inconclusive,
        }
    }

    async fn probe_http(&self, port: u16, path: &str, timeout: Duration) -> ProbeOutcome {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let url = format!("http://127.0.0.1:{}{}", port, path);
        let started = Instant::now();

        match tokio::time::timeout(timeout, self.client.get(&url).send()).await {
            Err(_) => ProbeOutcome::Failure(HealthCheckError::Timeout(timeout)),
            Ok(Err(e)) => ProbeOutcome::Failure(HealthCheckError::Connect(e.to_string())),
            Ok(Ok(resp)) => {
                let status = resp.status();
                if status.is_success() || status.is_redirection() {
                    ProbeOutcome::Success(started.elapsed())
                } else {
                    ProbeOutcome::Failure(HealthCheckError::Status(status.as_u16()))
                }
            }
        }
    }

    /// Probe on `spec.interval` until `cancel` fires, handing every raw outcome
    /// and the tracked result to `on_result`. The first probe runs immediately.
    pub async fn run<F>(
        &self,
        service: &str,
        spec: &HealthCheckSpec,
        port: u16,
        pid: Option<u32>,
        cancel: CancellationToken,
        mut on_result: F,
    ) where
        F: FnMut(&ProbeOutcome, HealthCheckResult),
    {
        if spec.kind == HealthCheckKind::None {
            trace!(service, "No health check configured");
            return;
        }

        let mut tracker = HealthTracker::new(service, spec);
        let mut ticker = tokio::time::interval(spec.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(service, kind = spec.kind.as_str(), interval = ?spec.interval, "Health checks started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.probe(spec, port, pid) => outcome,
            };
            let result = tracker.record(outcome.clone());
            trace!(service, status = %result.status, failures = result.consecutive_failures, "Health probe");
            on_result(&outcome, result);
        }
        debug!(service, "Health checks stopped");
    }
}

async fn probe_tcp(port: u16, timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await {
        Err(_) => ProbeOutcome::Failure(HealthCheckError::Timeout(timeout)),
        Ok(Err(e)) => ProbeOutcome::Failure(HealthCheckError::Connect(e.to_string())),
        Ok(Ok(stream)) => {
            drop(stream);
            ProbeOutcome::Success(started.elapsed())
        }
    }
}

/// Point-in-time health summary across all services.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub total: usize,
    pub running: usize,
    pub starting: usize,
    pub stopped: usize,
    pub crashed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    /// Crashed or unhealthy services, in snapshot order
    pub failing: Vec<String>,
}

impl HealthReport {
    pub fn from_services(services: &[ServiceInfo]) -> Self {
        let mut report = HealthReport {
            total: services.len(),
            ..Default::default()
        };
        for svc in services {
            match svc.status {
                ServiceState::Running => report.running += 1,
                ServiceState::Starting => report.starting += 1,
                ServiceState::Stopping | ServiceState::Stopped => report.stopped += 1,
                ServiceState::Crashed => report.crashed += 1,
            }
            match svc.health {
                HealthStatus::Healthy => report.healthy += 1,
                HealthStatus::Degraded => report.degraded += 1,
                HealthStatus::Unhealthy => report.unhealthy += 1,
                HealthStatus::Starting | HealthStatus::Unknown => report.unknown += 1,
            }
            if svc.status == ServiceState::Crashed || svc.health == HealthStatus::Unhealthy {
                report.failing.push(svc.name.clone());
            }
        }
        report
    }

    /// Worst status across services, ignoring ones with nothing to report.
    pub fn overall(&self) -> HealthStatus {
        if self.unhealthy > 0 || self.crashed > 0 {
            HealthStatus::Unhealthy
        } else if self.degraded > 0 {
            HealthStatus::Degraded
        } else if self.starting > 0 {
            HealthStatus::Starting
        } else if self.healthy > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.crashed == 0 && self.unhealthy == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn failure() -> ProbeOutcome {
        ProbeOutcome::Failure(HealthCheckError::Connect("refused".into()))
    }

    fn ok_fast() -> ProbeOutcome {
        ProbeOutcome::Success(Duration::from_millis(5))
    }

    fn tracker(threshold: u32) -> HealthTracker {
        HealthTracker::new(
            "svc",
            &HealthCheckSpec::new(HealthCheckKind::Tcp).failure_threshold(threshold),
        )
    }

    #[test]
    fn single_failure_then_success_never_flips_unhealthy() {
        let mut t = tracker(3);
        t.record(ok_fast());
        assert_eq!(t.record(failure()).status, HealthStatus::Degraded);
        let result = t.record(ok_fast());
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.consecutive_failures, 0);
    }

    #[test]
    fn threshold_minus_one_failures_stay_below_unhealthy() {
        let mut t = tracker(3);
        t.record(ok_fast());
        t.record(failure());
        let result = t.record(failure());
        assert_ne!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.consecutive_failures, 2);
    }

    #[test]
    fn threshold_failures_flip_to_unhealthy() {
        let mut t = tracker(3);
        t.record(ok_fast());
        for _ in 0..3 {
            t.record(failure());
        }
        assert_eq!(t.status(), HealthStatus::Unhealthy);
        assert_eq!(t.record(ok_fast()).status, HealthStatus::Healthy);
    }

    #[test]
    fn failures_while_starting_stay_starting() {
        let mut t = tracker(2);
        assert_eq!(t.status(), HealthStatus::Starting);
        assert_eq!(t.record(failure()).status, HealthStatus::Starting);
        assert_eq!(t.record(failure()).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn slow_success_is_degraded() {
        let spec = HealthCheckSpec::new(HealthCheckKind::Http)
            .degraded_latency(Duration::from_millis(100));
        let mut t = HealthTracker::new("svc", &spec);
        let result = t.record(ProbeOutcome::Success(Duration::from_millis(250)));
        assert_eq!(result.status, HealthStatus::Degraded);
        assert_eq!(result.response_time_nanos, 250_000_000);
        assert_eq!(
            t.record(ProbeOutcome::Success(Duration::from_millis(20))).status,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn no_check_reports_unknown() {
        let mut t = HealthTracker::new("svc", &HealthCheckSpec::new(HealthCheckKind::None));
        assert_eq!(t.status(), HealthStatus::Unknown);
        assert_eq!(t.record(ok_fast()).status, HealthStatus::Unknown);
    }

    #[test]
    fn live_process_is_unknown_not_healthy() {
        let mut t = HealthTracker::new("svc", &HealthCheckSpec::new(HealthCheckKind::Process));
        let result = t.record(ProbeOutcome::Alive);
        assert_eq!(result.status, HealthStatus::Unknown);
        assert_eq!(result.consecutive_failures, 0);
        assert!(ProbeOutcome::Alive.is_up());
        assert!(!ProbeOutcome::Inconclusive.is_up());
    }

    #[tokio::test]
    async fn process_probe_checks_pid() {
        let checker = HealthChecker::new();
        let spec = HealthCheckSpec::new(HealthCheckKind::Process);
        let me = std::process::id();
        assert_eq!(
            checker.probe(&spec, 0, Some(me)).await,
            ProbeOutcome::Alive
        );
        assert_eq!(
            checker.probe(&spec, 0, None).await,
            ProbeOutcome::Failure(HealthCheckError::NoProcess)
        );
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checker = HealthChecker::new();
        let spec = HealthCheckSpec::new(HealthCheckKind::Tcp);
        assert!(matches!(
            checker.probe(&spec, port, None).await,
            ProbeOutcome::Success(_)
        ));

        drop(listener);
        assert!(matches!(
            checker.probe(&spec, port, None).await,
            ProbeOutcome::Failure(_)
        ));
    }

    async fn canned_http(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        port
    }

    #[tokio::test]
    async fn http_probe_maps_status_codes() {
        let checker = HealthChecker::new();
        let spec = HealthCheckSpec::http("/health");

        let ok = canned_http("200 OK").await;
        assert!(matches!(
            checker.probe(&spec, ok, None).await,
            ProbeOutcome::Success(_)
        ));

        let broken = canned_http("503 Service Unavailable").await;
        assert_eq!(
            checker.probe(&spec, broken, None).await,
            ProbeOutcome::Failure(HealthCheckError::Status(503))
        );
    }

    #[tokio::test]
    async fn http_probe_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let checker = HealthChecker::new();
        let spec = HealthCheckSpec::http("/").timeout(Duration::from_millis(100));
        assert_eq!(
            checker.probe(&spec, port, None).await,
            ProbeOutcome::Failure(HealthCheckError::Timeout(Duration::from_millis(100)))
        );
    }

    #[tokio::test]
    async fn run_reports_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let spec = HealthCheckSpec::new(HealthCheckKind::Tcp).interval(Duration::from_millis(20));
        let cancel = CancellationToken::new();

        let checker = HealthChecker::new();
        let stopper = cancel.clone();
        let mut results = Vec::new();
        checker
            .run("svc", &spec, port, None, cancel, |outcome, r| {
                assert!(outcome.is_up());
                results.push(r);
                if results.len() == 3 {
                    stopper.cancel();
                }
            })
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == HealthStatus::Healthy));
    }

    #[test]
    fn report_counts_and_overall() {
        let info = |status, health| ServiceInfo {
            name: "x".into(),
            status,
            health,
            port: 0,
            url: None,
            pid: None,
            start_time: None,
            exit_code: None,
            restarts: 0,
            last_error: None,
            health_check: HealthCheckResult::pending("x", HealthCheckKind::Process),
        };
        let report = HealthReport::from_services(&[
            info(ServiceState::Running, HealthStatus::Healthy),
            info(ServiceState::Running, HealthStatus::Degraded),
            info(ServiceState::Crashed, HealthStatus::Unhealthy),
        ]);
        assert_eq!(report.total, 3);
        assert_eq!(report.running, 2);
        assert_eq!(report.crashed, 1);
        assert_eq!(report.overall(), HealthStatus::Unhealthy);
        assert_eq!(report.failing, vec!["x".to_string()]);
        assert!(!report.is_healthy());

        let calm = HealthReport::from_services(&[info(ServiceState::Running, HealthStatus::Healthy)]);
        assert_eq!(calm.overall(), HealthStatus::Healthy);
        assert!(calm.is_healthy());
    }
}
