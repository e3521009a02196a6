use crate::program::{ClientServerCommands, CommandLine};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Interval between `try_wait` checks on a running child.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Interval between readiness probe attempts.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
/// Bytes of captured output logged when a command misbehaves.
const OUTPUT_TAIL_BYTES: u64 = 2048;

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitStatus::Signal(signal) => Some(*signal),
            ExitStatus::Code(_) => None,
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            ExitStatus::Signal(_) => None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Code(code),
            (None, Some(signal)) => ExitStatus::Signal(signal),
            (None, None) => ExitStatus::Code(-1),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exited with code {code}"),
            ExitStatus::Signal(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Problems of the harness itself, as opposed to behavior of the target.
///
/// These never count as a bug reproduction; the benchmark engine retries them.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InfraError {
    #[error("Failed to spawn command '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Error waiting for command '{command}': {reason}")]
    Wait { command: String, reason: String },

    #[error("Server did not become ready within {0:?}")]
    NotReady(Duration),

    #[error("Server {0} before becoming ready")]
    ServerExited(ExitStatus),

    #[error("Coredump observation failed: {0}")]
    Observer(String),

    #[error("Trigger execution panicked: {0}")]
    Panicked(String),
}

/// Signals a server is up and accepting work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessProbe {
    /// A TCP connection to `address` succeeds.
    Tcp { address: String },
    /// The file at `path` contains `marker`.
    LogMarker { path: PathBuf, marker: String },
    /// The server is still alive after this long.
    Delay(Duration),
}

impl ReadinessProbe {
    fn is_ready(&self, since: Instant) -> bool {
        match self {
            ReadinessProbe::Tcp { address } => match address.to_socket_addrs() {
                Ok(addrs) => addrs
                    .into_iter()
                    .any(|addr| TcpStream::connect_timeout(&addr, TCP_PROBE_TIMEOUT).is_ok()),
                Err(e) => {
                    debug!("Cannot resolve readiness address {address}: {e}");
                    false
                }
            },
            ReadinessProbe::LogMarker { path, marker } => std::fs::read_to_string(path)
                .map(|content| content.contains(marker.as_str()))
                .unwrap_or(false),
            ReadinessProbe::Delay(delay) => since.elapsed() >= *delay,
        }
    }
}

/// Unclassified result of supervising one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRun {
    /// `None` when the harness could not let the target finish on its own.
    pub status: Option<ExitStatus>,
    pub duration: Duration,
    pub infra: Option<InfraError>,
    /// Failures during cleanup. Reported, never folded into the outcome.
    pub cleanup_errors: Vec<String>,
}

impl RawRun {
    pub fn completed(status: ExitStatus, duration: Duration) -> Self {
        Self {
            status: Some(status),
            duration,
            infra: None,
            cleanup_errors: Vec::new(),
        }
    }

    pub fn failed(infra: InfraError, duration: Duration) -> Self {
        Self {
            status: None,
            duration,
            infra: Some(infra),
            cleanup_errors: Vec::new(),
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.status.is_some_and(|status| status.signal().is_some())
    }
}

/// A spawned child along with the file its output is captured to.
struct Supervised {
    child: Child,
    output: Option<File>,
    label: String,
}

impl Supervised {
    fn log_output_tail(&mut self) {
        let Some(output) = self.output.as_mut() else {
            return;
        };
        let mut tail = String::new();
        let read = output
            .seek(SeekFrom::End(0))
            .and_then(|len| output.seek(SeekFrom::Start(len.saturating_sub(OUTPUT_TAIL_BYTES))))
            .and_then(|_| output.read_to_string(&mut tail));
        match read {
            Ok(_) if !tail.trim().is_empty() => debug!("Output of '{}':\n{}", self.label, tail.trim_end()),
            Ok(_) => {}
            Err(e) => debug!("Could not read captured output of '{}': {e}", self.label),
        }
    }
}

/// Starts and stops the child processes of one program.
///
/// Every child is started in its own process group with its core size limit
/// raised, so the whole group can be signalled and the kernel may write a dump.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl ProcessSupervisor {
    pub fn new(env: BTreeMap<String, String>, working_dir: Option<PathBuf>) -> Self {
        Self { env, working_dir }
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Supervised, InfraError> {
        let mut command = Command::new(cmd.program());
        command.args(cmd.args()).envs(&self.env).stdin(Stdio::null());

        if let Some(cwd) = &self.working_dir {
            command.current_dir(cwd);
        }

        let output = match tempfile::tempfile() {
            Ok(file) => {
                let stdout = file.try_clone();
                let stderr = file.try_clone();
                match (stdout, stderr) {
                    (Ok(stdout), Ok(stderr)) => {
                        command.stdout(stdout).stderr(stderr);
                        Some(file)
                    }
                    _ => {
                        command.stdout(Stdio::null()).stderr(Stdio::null());
                        None
                    }
                }
            }
            Err(e) => {
                debug!("Output of '{cmd}' will not be captured: {e}");
                command.stdout(Stdio::null()).stderr(Stdio::null());
                None
            }
        };

        // SAFETY: the hook only issues async-signal-safe syscalls.
        unsafe {
            command.pre_exec(prepare_child);
        }

        debug!("Spawning '{cmd}'");
        let child = command.spawn().map_err(|e| InfraError::SpawnFailed {
            command: cmd.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Supervised {
            child,
            output,
            label: cmd.to_string(),
        })
    }

    /// Runs `cmd` to completion, killing it once `timeout` has elapsed.
    pub fn run_simple(&self, cmd: &CommandLine, timeout: Duration) -> RawRun {
        let start = Instant::now();
        let mut proc = match self.spawn(cmd) {
            Ok(proc) => proc,
            Err(e) => {
                warn!("{e}");
                return RawRun::failed(e, start.elapsed());
            }
        };
        let run = self.finish(&mut proc, timeout, start);
        if !run.status.is_some_and(|status| status.is_success()) {
            proc.log_output_tail();
        }
        run
    }

    fn finish(&self, proc: &mut Supervised, timeout: Duration, start: Instant) -> RawRun {
        match wait_with_timeout(&mut proc.child, timeout) {
            Ok(Some(status)) => RawRun::completed(status.into(), start.elapsed()),
            Ok(None) => {
                let elapsed = start.elapsed();
                warn!("'{}' timed out after {timeout:?}, killing it", proc.label);
                if let Err(e) = kill_group(&mut proc.child) {
                    warn!("Failed to kill timed-out process '{}': {e}", proc.label);
                }
                RawRun::failed(
                    InfraError::Timeout {
                        command: proc.label.clone(),
                        timeout,
                    },
                    elapsed,
                )
            }
            Err(e) => {
                let _ = kill_group(&mut proc.child);
                RawRun::failed(
                    InfraError::Wait {
                        command: proc.label.clone(),
                        reason: e.to_string(),
                    },
                    start.elapsed(),
                )
            }
        }
    }

    /// Runs a server and a client against it.
    ///
    /// The client starts only once the server is ready. The stop command is
    /// issued after the client has terminated (or was killed on timeout) and is
    /// issued even when the server never became ready. The reported duration
    /// covers the client only. A server killed by a signal while a client ran
    /// to completion is reported in place of the client's status.
    pub fn run_client_server(
        &self,
        commands: &ClientServerCommands,
        client_cmd: &CommandLine,
        client_timeout: Duration,
    ) -> RawRun {
        let mut server = match self.spawn(&commands.start_cmd) {
            Ok(server) => server,
            Err(e) => {
                warn!("{e}");
                return RawRun::failed(e, Duration::ZERO);
            }
        };

        let mut run = match self.wait_ready(&mut server, commands) {
            Ok(()) => {
                info!("Server '{}' is ready, starting client", server.label);
                self.run_simple(client_cmd, client_timeout)
            }
            Err(e) => {
                warn!("{e}");
                RawRun::failed(e, Duration::ZERO)
            }
        };

        let server_exit = match server.child.try_wait() {
            Ok(status) => status.map(ExitStatus::from),
            Err(e) => {
                run.cleanup_errors
                    .push(format!("Could not query server state: {e}"));
                None
            }
        };

        if let Err(e) = self.stop(&commands.stop_cmd, client_timeout) {
            warn!("{e}");
            run.cleanup_errors.push(e);
        }

        match terminate(&mut server.child, commands.grace_period) {
            Ok(status) => debug!("Server '{}' {}", server.label, ExitStatus::from(status)),
            Err(e) => {
                let msg = format!("Failed to terminate server '{}': {e}", server.label);
                warn!("{msg}");
                run.cleanup_errors.push(msg);
            }
        }

        if let Some(status) = server_exit {
            if run.infra.is_none() && status.signal().is_some() {
                info!("Server '{}' {status} while the client was running", server.label);
                server.log_output_tail();
                run.status = Some(status);
            } else if !(commands.daemon && status.is_success()) {
                debug!("Server '{}' {status} before the stop command", server.label);
            }
        }

        run
    }

    fn wait_ready(
        &self,
        server: &mut Supervised,
        commands: &ClientServerCommands,
    ) -> Result<(), InfraError> {
        let since = Instant::now();
        let mut exited_cleanly = false;
        loop {
            if !exited_cleanly {
                match server.child.try_wait() {
                    Ok(Some(status)) if commands.daemon && status.success() => exited_cleanly = true,
                    Ok(Some(status)) => {
                        server.log_output_tail();
                        return Err(InfraError::ServerExited(status.into()));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        return Err(InfraError::Wait {
                            command: server.label.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if commands.readiness.is_ready(since) {
                return Ok(());
            }
            if since.elapsed() >= commands.ready_timeout {
                return Err(InfraError::NotReady(commands.ready_timeout));
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
    }

    fn stop(&self, cmd: &CommandLine, timeout: Duration) -> Result<(), String> {
        let run = self.run_simple(cmd, timeout);
        match (run.infra, run.status) {
            (Some(e), _) => Err(format!("Stop command failed: {e}")),
            (None, Some(status)) if !status.is_success() => {
                Err(format!("Stop command '{cmd}' {status}"))
            }
            _ => Ok(()),
        }
    }
}

/// Runs in the forked child right before `exec`.
fn prepare_child() -> io::Result<()> {
    // SAFETY: plain syscalls on a local struct.
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_CORE, &mut limit) == 0 {
            limit.rlim_cur = limit.rlim_max;
            // Best effort: dumps are only missing when this fails.
            libc::setrlimit(libc::RLIMIT_CORE, &limit);
        }
    }
    Ok(())
}

fn signal_group(child: &Child, signal: libc::c_int) -> io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill has no memory-safety preconditions.
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn kill_group(child: &mut Child) -> io::Result<()> {
    if signal_group(child, libc::SIGKILL).is_err() {
        child.kill()?;
    }
    child.wait().map(|_| ())
}

/// Waits for `child` for at most `timeout`. `Ok(None)` means it is still running.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<std::process::ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// SIGTERM to the child's group, then SIGKILL once `grace` has passed.
fn terminate(child: &mut Child, grace: Duration) -> io::Result<std::process::ExitStatus> {
    if let Some(status) = child.try_wait()? {
        // The leader is gone but its group may still hold workers.
        let _ = signal_group(child, libc::SIGKILL);
        return Ok(status);
    }
    let _ = signal_group(child, libc::SIGTERM);
    if let Some(status) = wait_with_timeout(child, grace)? {
        return Ok(status);
    }
    warn!("Process {} ignored SIGTERM for {grace:?}, killing it", child.id());
    if signal_group(child, libc::SIGKILL).is_err() {
        child.kill()?;
    }
    child.wait()
}
