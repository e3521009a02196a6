use crate::executor::{ExitStatus, InfraError, ProcessSupervisor, RawRun};
use crate::observer::{CoreDumpObserver, Observation};
use crate::oracle::{DefaultOracle, Oracle, RunOutcome};
use crate::program::{
    ClientServerCommands, CommandLine, ProgramDescriptor, RunMode, TriggerKind, executable_name,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Side channel hooks use to attach extra measurements to a run.
pub type Metrics = BTreeMap<String, serde_json::Value>;

/// What a run is for. Benchmark runs use the program's benchmark command when it has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Workload {
    #[default]
    Normal,
    Benchmark,
}

/// Classified result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub program: String,
    pub mode: RunMode,
    /// The command that exercised the target (the client in client/server mode).
    pub command: String,
    pub status: Option<ExitStatus>,
    pub duration: Duration,
    pub coredump: bool,
    /// Where the consumed crash artifact was archived, if it was kept.
    pub artifact: Option<PathBuf>,
    pub outcome: RunOutcome,
    pub infra: Option<InfraError>,
    pub cleanup_errors: Vec<String>,
    pub metrics: Metrics,
}

impl RunResult {
    /// Result standing in for a run whose execution panicked.
    pub fn panicked(program: &str, mode: RunMode, message: String) -> Self {
        Self {
            program: program.to_string(),
            mode,
            command: String::new(),
            status: None,
            duration: Duration::ZERO,
            coredump: false,
            artifact: None,
            outcome: RunOutcome::InfraError,
            infra: Some(InfraError::Panicked(message)),
            cleanup_errors: Vec::new(),
            metrics: Metrics::new(),
        }
    }
}

/// Commands resolved for one mode and workload.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Simple {
        command: CommandLine,
        executable: PathBuf,
    },
    ClientServer {
        commands: ClientServerCommands,
        client: CommandLine,
        executable: PathBuf,
    },
}

impl Plan {
    /// Executable whose crash artifacts the run is observed for.
    pub fn executable(&self) -> &Path {
        match self {
            Plan::Simple { executable, .. } | Plan::ClientServer { executable, .. } => executable,
        }
    }

    /// Prepends `prefix` to the target process: the command itself, or the
    /// server's start command in client/server mode.
    pub fn wrap(&mut self, prefix: &[String]) {
        if prefix.is_empty() {
            return;
        }
        match self {
            Plan::Simple { command, .. } => *command = command.wrapped(prefix),
            Plan::ClientServer { commands, .. } => {
                commands.start_cmd = commands.start_cmd.wrapped(prefix)
            }
        }
    }

    pub fn exercised(&self) -> &CommandLine {
        match self {
            Plan::Simple { command, .. } => command,
            Plan::ClientServer { client, .. } => client,
        }
    }
}

/// Runs a program in a given mode and classifies what happened.
#[derive(Clone)]
pub struct Trigger {
    descriptor: Arc<ProgramDescriptor>,
    oracle: Arc<dyn Oracle>,
    supervisor: ProcessSupervisor,
}

impl Trigger {
    pub fn new(descriptor: Arc<ProgramDescriptor>, oracle: Arc<dyn Oracle>) -> Self {
        let supervisor =
            ProcessSupervisor::new(descriptor.env.clone(), descriptor.working_dir.clone());
        Self {
            descriptor,
            oracle,
            supervisor,
        }
    }

    pub fn with_default_oracle(descriptor: Arc<ProgramDescriptor>) -> Self {
        let oracle = Arc::new(DefaultOracle::new(descriptor.signature));
        Self::new(descriptor, oracle)
    }

    pub fn descriptor(&self) -> &ProgramDescriptor {
        &self.descriptor
    }

    pub fn classify(&self, raw: &RawRun, coredump: bool, mode: RunMode) -> RunOutcome {
        self.oracle.classify(raw, coredump, mode)
    }

    /// Picks the commands for `mode`, swapping in `<argv0>-<mode>` variants that exist on disk.
    pub fn plan(&self, mode: RunMode, workload: Workload) -> Plan {
        let benchmark = match workload {
            Workload::Benchmark => self.descriptor.benchmark_cmd.as_ref(),
            Workload::Normal => None,
        };
        let mut executable = self.descriptor.executable.clone();

        match &self.descriptor.kind {
            TriggerKind::Simple {
                success_cmd,
                failure_cmd,
            } => {
                let selected = match mode {
                    RunMode::Success => success_cmd,
                    RunMode::Fail => failure_cmd,
                };
                let command = self.resolve(benchmark.unwrap_or(selected), mode, &mut executable);
                Plan::Simple {
                    command,
                    executable,
                }
            }
            TriggerKind::ClientServer(commands) => {
                let mut commands = commands.clone();
                commands.start_cmd = self.resolve(&commands.start_cmd, mode, &mut executable);
                let client = benchmark.unwrap_or(commands.client_for(mode)).clone();
                let client = self.resolve(&client, mode, &mut executable);
                Plan::ClientServer {
                    commands,
                    client,
                    executable,
                }
            }
        }
    }

    fn resolve(&self, cmd: &CommandLine, mode: RunMode, executable: &mut PathBuf) -> CommandLine {
        match self.variant(cmd.program(), mode) {
            Some(variant) => {
                debug!("Using {} variant {variant:?} of '{}'", mode, cmd.program());
                let resolved = cmd.with_program(variant.to_string_lossy().into_owned());
                *executable = variant;
                resolved
            }
            None => cmd.clone(),
        }
    }

    /// `<program>-<mode>` when `program` names the target executable and the variant exists.
    fn variant(&self, program: &str, mode: RunMode) -> Option<PathBuf> {
        let path = Path::new(program);
        let name = executable_name(path);
        if name.is_empty() || name != self.descriptor.executable_name() {
            return None;
        }
        let base = if path.components().count() > 1 {
            path.to_path_buf()
        } else {
            self.descriptor.executable.clone()
        };
        let variant = base.with_file_name(format!("{name}-{}", mode.suffix()));
        let on_disk = match &self.descriptor.working_dir {
            Some(dir) if variant.is_relative() => dir.join(&variant),
            _ => variant.clone(),
        };
        on_disk.is_file().then_some(variant)
    }

    /// Runs the program once in `mode` under coredump observation.
    ///
    /// A non-empty `wrapper` is prepended to the target's command, see [`Plan::wrap`].
    pub fn execute(
        &self,
        mode: RunMode,
        workload: Workload,
        wrapper: &[String],
        observer: &mut CoreDumpObserver,
    ) -> RunResult {
        let mut plan = self.plan(mode, workload);
        plan.wrap(wrapper);
        let timeout = self.descriptor.timeout;
        info!(
            "Running '{}' in {mode} mode: {}",
            self.descriptor.name,
            plan.exercised()
        );

        let observed = observer.observe(&self.descriptor.name, plan.executable(), || match &plan {
            Plan::Simple { command, .. } => self.supervisor.run_simple(command, timeout),
            Plan::ClientServer {
                commands, client, ..
            } => self.supervisor.run_client_server(commands, client, timeout),
        });
        let (raw, observation) = match observed {
            Ok(observed) => observed,
            Err(e) => {
                warn!("Could not observe coredumps of '{}': {e}", self.descriptor.name);
                (
                    RawRun::failed(InfraError::Observer(e.to_string()), Duration::ZERO),
                    Observation::default(),
                )
            }
        };

        let outcome = self.classify(&raw, observation.detected, mode);
        debug!(
            "'{}' {:?} coredump={} -> {outcome}",
            self.descriptor.name, raw.status, observation.detected
        );

        RunResult {
            program: self.descriptor.name.clone(),
            mode,
            command: plan.exercised().to_string(),
            status: raw.status,
            duration: raw.duration,
            coredump: observation.detected,
            artifact: observation.artifact,
            outcome,
            infra: raw.infra,
            cleanup_errors: raw.cleanup_errors,
            metrics: Metrics::new(),
        }
    }
}
