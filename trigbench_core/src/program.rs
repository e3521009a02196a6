use crate::executor::{ExitStatus, ReadinessProbe};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An argv-style command: the program followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine(Vec<String>);

impl CommandLine {
    /// Returns `None` when `argv` is empty or its program is blank.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Some(Self(argv)),
            _ => None,
        }
    }

    pub fn program(&self) -> &str {
        &self.0[0]
    }

    pub fn args(&self) -> &[String] {
        &self.0[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.0
    }

    /// `prefix` followed by this command line.
    pub fn wrapped(&self, prefix: &[String]) -> Self {
        Self(prefix.iter().chain(&self.0).cloned().collect())
    }

    /// Same arguments, different program.
    pub fn with_program(&self, program: String) -> Self {
        let mut argv = self.0.clone();
        argv[0] = program;
        Self(argv)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// Which command of a program a run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Run the command that should complete without triggering the bug.
    Success,
    /// Run the designated failure command, which should trigger the bug.
    Fail,
}

impl RunMode {
    /// Suffix used to look up mode-specific executable variants (`<exe>-<suffix>`).
    pub fn suffix(&self) -> &'static str {
        match self {
            RunMode::Success => "success",
            RunMode::Fail => "fail",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Source location of the known bug. Only used to label reports.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BugLocation {
    pub file: String,
    pub function: String,
    pub line: u32,
}

impl fmt::Display for BugLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.file, self.line, self.function)
    }
}

/// How a triggered bug is expected to terminate the target.
///
/// An unset field matches anything, so the default signature accepts every
/// signal-terminated exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BugSignature {
    pub signal: Option<i32>,
    pub exit_code: Option<i32>,
}

impl BugSignature {
    /// True when `status` is the kind of abnormal exit this bug produces.
    pub fn matches(&self, status: &ExitStatus) -> bool {
        match status {
            ExitStatus::Signal(signal) => self.signal.is_none_or(|expected| expected == *signal),
            ExitStatus::Code(code) => self.exit_code == Some(*code),
        }
    }
}

/// Commands and supervision parameters for a program driven as a server plus a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientServerCommands {
    pub start_cmd: CommandLine,
    pub stop_cmd: CommandLine,
    pub client_cmd: CommandLine,
    /// Client used in [`RunMode::Fail`]. Falls back to `client_cmd`.
    pub failure_client_cmd: Option<CommandLine>,
    pub readiness: ReadinessProbe,
    pub ready_timeout: Duration,
    /// How long the server may take to exit after the stop command.
    pub grace_period: Duration,
    /// The start command forks the real server and exits on its own.
    pub daemon: bool,
}

impl ClientServerCommands {
    pub fn client_for(&self, mode: RunMode) -> &CommandLine {
        match mode {
            RunMode::Success => &self.client_cmd,
            RunMode::Fail => self.failure_client_cmd.as_ref().unwrap_or(&self.client_cmd),
        }
    }
}

/// Shape of a program's trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    Simple {
        success_cmd: CommandLine,
        failure_cmd: CommandLine,
    },
    ClientServer(ClientServerCommands),
}

/// Everything needed to run one target program. Built once from configuration
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramDescriptor {
    pub name: String,
    pub executable: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub kind: TriggerKind,
    pub bug_location: Option<BugLocation>,
    pub signature: Option<BugSignature>,
    /// Heavier workload substituted for the mode command while benchmarking.
    pub benchmark_cmd: Option<CommandLine>,
    /// Per-command timeout (simple command, or client in client/server mode).
    pub timeout: Duration,
}

impl ProgramDescriptor {
    pub fn executable_name(&self) -> &str {
        executable_name(&self.executable)
    }

    pub fn is_client_server(&self) -> bool {
        matches!(self.kind, TriggerKind::ClientServer(_))
    }
}

pub(crate) fn executable_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
}
