//! Process Executor: start, stream and stop one OS process
//!
//! Platform differences are confined to [`ProcessTerminator`]. On unix each
//! service runs in its own process group so an interrupt reaches the whole
//! tree a dev server tends to spawn (npm -> node, cargo -> binary).

use super::protocol::{LogEntry, RuntimeConfig, ServiceState, StreamKind};
use crate::error::{LaunchError, TerminationError};
use chrono::{DateTime, Utc};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const STREAM_CHANNEL_CAPACITY: usize = 256;

/// A launched service process. Owned by exactly one monitor task, which is
/// the only place `wait` is ever called.
#[derive(Debug)]
pub struct ServiceProcess {
    pub name: String,
    pub pid: Option<u32>,
    pub start_time: DateTime<Utc>,
    state: ServiceState,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_status: Option<ExitStatus>,
}

impl ServiceProcess {
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Move forward along the lifecycle. Backward moves are ignored and reported as `false`.
    pub fn advance(&mut self, next: ServiceState) -> bool {
        if self.state.can_transition_to(next) {
            trace!(service = %self.name, from = %self.state, to = %next, "State transition");
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Wait for the process to exit. Safe to call again after it has exited.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        Ok(status)
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        if self.exit_status.is_some() {
            return Ok(true);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit_status = Some(status);
            return Ok(true);
        }
        Ok(false)
    }
}

/// How a [`ProcessExecutor::stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period after an interrupt
    Graceful,
    /// Killed after the grace period, or immediately where interrupts are unsupported
    Forced,
    /// Was already gone when stop was requested
    AlreadyExited,
}

/// Result of asking a process to shut down on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Sent,
    /// Platform has no graceful signal; caller should kill right away
    Unsupported,
    AlreadyExited,
}

/// Platform seam for terminating a child.
pub trait ProcessTerminator: Send + Sync + std::fmt::Debug {
    fn interrupt(&self, pid: u32) -> io::Result<Interrupt>;

    fn kill(&self, child: &mut Child) -> io::Result<()> {
        child.start_kill()
    }
}

/// POSIX: SIGINT to the process group, SIGKILL after the grace period.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptThenKill;

#[cfg(unix)]
impl InterruptThenKill {
    fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
        let pgid = -(pid as libc::pid_t);
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pgid, signal) };
        if rc == 0 {
            return Ok(());
        }
        // Group may be gone while the leader lingers as a zombie; fall back to the pid.
        // SAFETY: as above
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(unix)]
impl ProcessTerminator for InterruptThenKill {
    fn interrupt(&self, pid: u32) -> io::Result<Interrupt> {
        match Self::signal_group(pid, libc::SIGINT) {
            Ok(()) => Ok(Interrupt::Sent),
            Err(e) if is_already_exited(&e) => Ok(Interrupt::AlreadyExited),
            Err(e) => Err(e),
        }
    }

    fn kill(&self, child: &mut Child) -> io::Result<()> {
        if let Some(pid) = child.id() {
            if let Err(e) = Self::signal_group(pid, libc::SIGKILL) {
                if !is_already_exited(&e) {
                    return Err(e);
                }
            }
        }
        child.start_kill()
    }
}

/// Kill immediately. Used where children cannot receive an interrupt.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForceKill;

impl ProcessTerminator for ForceKill {
    fn interrupt(&self, _pid: u32) -> io::Result<Interrupt> {
        Ok(Interrupt::Unsupported)
    }
}

pub fn default_terminator() -> Arc<dyn ProcessTerminator> {
    #[cfg(unix)]
    {
        Arc::new(InterruptThenKill)
    }
    #[cfg(not(unix))]
    {
        Arc::new(ForceKill)
    }
}

/// Errors that only mean the target is already gone. On unix EPERM means
/// the process is alive but not ours to signal, so it does not count.
pub fn is_already_exited(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH) || err.kind() == io::ErrorKind::InvalidInput
    }
    #[cfg(not(unix))]
    {
        matches!(
            err.kind(),
            io::ErrorKind::InvalidInput | io::ErrorKind::PermissionDenied
        )
    }
}

/// OS-level liveness of a pid.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    // SAFETY: signal 0 only performs the existence/permission check
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// OS-level liveness of a pid. Without a portable probe the pid is assumed alive
/// while tracked; exit is still observed by the monitor's wait.
#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    true
}

/// One stream of line-delimited output. Ends when the pipe closes.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::Receiver<LogEntry>,
}

impl LogStream {
    fn closed() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    terminator: Arc<dyn ProcessTerminator>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(default_terminator())
    }
}

impl ProcessExecutor {
    pub fn new(terminator: Arc<dyn ProcessTerminator>) -> Self {
        Self { terminator }
    }

    /// Spawn the process and return right away in `Starting`.
    pub fn start(&self, cfg: &RuntimeConfig) -> Result<ServiceProcess, LaunchError> {
        if !cfg.working_dir.is_dir() {
            return Err(LaunchError::InvalidWorkingDir {
                service: cfg.name.clone(),
                path: cfg.working_dir.clone(),
            });
        }

        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args)
            .current_dir(&cfg.working_dir)
            .env_clear()
            .envs(&cfg.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LaunchError::CommandNotFound {
                service: cfg.name.clone(),
                command: cfg.command.clone(),
            },
            _ => LaunchError::Spawn {
                service: cfg.name.clone(),
                command: cfg.command_line(),
                source: e,
            },
        })?;

        let pid = child.id();
        info!("Started service '{}' with PID {:?}", cfg.name, pid);

        Ok(ServiceProcess {
            name: cfg.name.clone(),
            pid,
            start_time: Utc::now(),
            state: ServiceState::Starting,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            exit_status: None,
        })
    }

    /// Hand out the stdout/stderr line streams. Only the first call yields
    /// live streams; later calls get streams that are already closed.
    pub fn stream_output(&self, proc: &mut ServiceProcess) -> (LogStream, LogStream) {
        let stdout = match proc.stdout.take() {
            Some(pipe) => spawn_reader(proc.name.clone(), StreamKind::Stdout, pipe),
            None => LogStream::closed(),
        };
        let stderr = match proc.stderr.take() {
            Some(pipe) => spawn_reader(proc.name.clone(), StreamKind::Stderr, pipe),
            None => LogStream::closed(),
        };
        (stdout, stderr)
    }

    /// Interrupt, wait up to `grace`, then kill. Stopping an exited process succeeds.
    pub async fn stop(
        &self,
        proc: &mut ServiceProcess,
        grace: Duration,
    ) -> Result<StopOutcome, TerminationError> {
        let pid = proc.pid.unwrap_or_default();
        let name = proc.name.clone();
        let fail = |source: io::Error| TerminationError {
            service: name.clone(),
            pid,
            source,
        };

        if proc.has_exited().map_err(&fail)? {
            proc.advance(ServiceState::Stopped);
            return Ok(StopOutcome::AlreadyExited);
        }
        proc.advance(ServiceState::Stopping);

        let interrupt = match proc.child.id() {
            Some(pid) => match self.terminator.interrupt(pid) {
                Ok(outcome) => outcome,
                Err(e) if is_already_exited(&e) => Interrupt::AlreadyExited,
                Err(e) => {
                    warn!("Interrupt to service '{}' failed: {}", proc.name, e);
                    Interrupt::Unsupported
                }
            },
            None => Interrupt::AlreadyExited,
        };

        let outcome = match interrupt {
            Interrupt::AlreadyExited => match tokio::time::timeout(grace, proc.wait()).await {
                Ok(result) => {
                    result.map_err(&fail)?;
                    StopOutcome::AlreadyExited
                }
                Err(_) => {
                    warn!(
                        "Service '{}' reported gone but is still running, force killing",
                        proc.name
                    );
                    self.force_kill(proc).await.map_err(&fail)?
                }
            },
            Interrupt::Sent => match tokio::time::timeout(grace, proc.wait()).await {
                Ok(result) => {
                    result.map_err(&fail)?;
                    debug!("Service '{}' stopped gracefully", proc.name);
                    StopOutcome::Graceful
                }
                Err(_) => {
                    warn!(
                        "Service '{}' did not stop within {:?}, force killing",
                        proc.name, grace
                    );
                    self.force_kill(proc).await.map_err(&fail)?
                }
            },
            Interrupt::Unsupported => self.force_kill(proc).await.map_err(&fail)?,
        };

        proc.advance(ServiceState::Stopped);
        Ok(outcome)
    }

    async fn force_kill(&self, proc: &mut ServiceProcess) -> io::Result<StopOutcome> {
        let outcome = match self.terminator.kill(&mut proc.child) {
            Ok(()) => StopOutcome::Forced,
            Err(e) if is_already_exited(&e) => StopOutcome::AlreadyExited,
            Err(e) => return Err(e),
        };
        proc.wait().await?;
        Ok(outcome)
    }
}

fn spawn_reader<R>(service: String, stream: StreamKind, pipe: R) -> LogStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(LogEntry::new(&service, stream, text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Output reader for '{}' stopped: {}", service, e);
                    break;
                }
            }
        }
    });
    LogStream { rx }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(name: &str, script: &str) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::new(name, "sh").args(["-c", script]);
        cfg.env = crate::orchestrator::env::os_environment();
        cfg
    }

    #[tokio::test]
    async fn start_returns_immediately_in_starting() {
        let exec = ProcessExecutor::default();
        let mut proc = exec.start(&shell("svc", "sleep 5")).unwrap();
        assert_eq!(proc.state(), ServiceState::Starting);
        assert!(proc.pid.is_some());
        exec.stop(&mut proc, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn streams_keep_line_order_per_stream() {
        let exec = ProcessExecutor::default();
        let mut proc = exec
            .start(&shell("svc", "echo one; echo two; echo oops >&2; echo three"))
            .unwrap();
        let (mut out, mut err) = exec.stream_output(&mut proc);

        let mut lines = Vec::new();
        while let Some(entry) = out.next().await {
            assert_eq!(entry.stream, StreamKind::Stdout);
            assert_eq!(entry.service, "svc");
            lines.push(entry.text);
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(err.next().await.unwrap().text, "oops");
        assert!(err.next().await.is_none());
        assert!(proc.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn finished_streams_cannot_be_replayed() {
        let exec = ProcessExecutor::default();
        let mut proc = exec.start(&shell("svc", "echo once")).unwrap();
        let (mut out, _) = exec.stream_output(&mut proc);
        assert_eq!(out.next().await.unwrap().text, "once");

        let (mut again, mut again_err) = exec.stream_output(&mut proc);
        assert!(again.next().await.is_none());
        assert!(again_err.next().await.is_none());
        proc.wait().await.unwrap();
    }

    #[tokio::test]
    async fn resolved_env_and_working_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ProcessExecutor::default();
        let cfg = shell("svc", "echo $GREETING; pwd")
            .env("GREETING", "hello")
            .working_dir(dir.path());
        let mut proc = exec.start(&cfg).unwrap();
        let (mut out, _) = exec.stream_output(&mut proc);
        assert_eq!(out.next().await.unwrap().text, "hello");
        let pwd = out.next().await.unwrap().text;
        assert_eq!(
            std::fs::canonicalize(pwd).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn stop_is_graceful_when_process_honours_interrupt() {
        let exec = ProcessExecutor::default();
        let mut proc = exec.start(&shell("svc", "exec sleep 30")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome = exec.stop(&mut proc, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(proc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn stop_forces_after_grace_period() {
        let exec = ProcessExecutor::default();
        let mut proc = exec
            .start(&shell("stubborn", "trap '' INT; exec sleep 30"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let outcome = exec
            .stop(&mut proc, Duration::from_millis(200))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(proc.state(), ServiceState::Stopped);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let exec = ProcessExecutor::default();
        let mut proc = exec.start(&shell("svc", "exit 0")).unwrap();
        proc.wait().await.unwrap();

        let first = exec.stop(&mut proc, Duration::from_millis(100)).await;
        let second = exec.stop(&mut proc, Duration::from_millis(100)).await;
        assert_eq!(first.unwrap(), StopOutcome::AlreadyExited);
        assert_eq!(second.unwrap(), StopOutcome::AlreadyExited);
    }

    #[tokio::test]
    async fn force_kill_terminator_skips_interrupt() {
        let exec = ProcessExecutor::new(Arc::new(ForceKill));
        let mut proc = exec.start(&shell("svc", "exec sleep 30")).unwrap();
        let started = Instant::now();
        let outcome = exec.stop(&mut proc, Duration::from_secs(10)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_command_is_launch_error() {
        let exec = ProcessExecutor::default();
        let cfg = RuntimeConfig::new("svc", "definitely-not-a-real-binary-42");
        let err = exec.start(&cfg).unwrap_err();
        assert!(matches!(err, LaunchError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn bad_working_dir_is_launch_error() {
        let exec = ProcessExecutor::default();
        let cfg = shell("svc", "true").working_dir("/definitely/not/here");
        let err = exec.start(&cfg).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidWorkingDir { .. }));
    }

    #[test]
    fn benign_errors_count_as_already_exited() {
        assert!(is_already_exited(&io::Error::from_raw_os_error(libc::ESRCH)));
        assert!(is_already_exited(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_already_exited(&io::Error::from_raw_os_error(libc::EPERM)));
        assert!(!is_already_exited(&io::Error::from(io::ErrorKind::Other)));
    }

    /// Interrupt that always fails with a fixed errno.
    #[derive(Debug)]
    struct FailingInterrupt(i32);

    impl ProcessTerminator for FailingInterrupt {
        fn interrupt(&self, _pid: u32) -> io::Result<Interrupt> {
            Err(io::Error::from_raw_os_error(self.0))
        }
    }

    /// Claims every process is gone without signalling it.
    #[derive(Debug)]
    struct ClaimsExited;

    impl ProcessTerminator for ClaimsExited {
        fn interrupt(&self, _pid: u32) -> io::Result<Interrupt> {
            Ok(Interrupt::AlreadyExited)
        }
    }

    #[tokio::test]
    async fn permission_denied_interrupt_still_stops() {
        let exec = ProcessExecutor::new(Arc::new(FailingInterrupt(libc::EPERM)));
        let mut proc = exec.start(&shell("svc", "exec sleep 30")).unwrap();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            exec.stop(&mut proc, Duration::from_millis(200)),
        )
        .await
        .expect("stop must be bounded")
        .unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(proc.state(), ServiceState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn live_process_reported_gone_is_killed_after_grace() {
        let exec = ProcessExecutor::new(Arc::new(ClaimsExited));
        let mut proc = exec.start(&shell("svc", "exec sleep 30")).unwrap();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            exec.stop(&mut proc, Duration::from_millis(200)),
        )
        .await
        .expect("stop must be bounded")
        .unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
