use crate::benchmark::{BenchmarkPolicy, Retention};
use crate::executor::ReadinessProbe;
use crate::observer::{CoreDumpConfig, DumpDisposal, ObserverError, pattern_regex};
use crate::program::{
    BugLocation, BugSignature, ClientServerCommands, CommandLine, ProgramDescriptor, TriggerKind,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Program '{name}': {reason}")]
    InvalidProgram { name: String, reason: String },

    #[error("Program '{0}' is defined more than once")]
    DuplicateProgram(String),

    #[error("Invalid benchmark settings: {0}")]
    InvalidBenchmark(String),

    #[error("Invalid coredump settings: {0}")]
    InvalidCoredump(String),

    #[error("Coredump setup failed: {0}")]
    CoreDumpSetup(#[from] ObserverError),

    #[error("Unknown hook '{0}'")]
    UnknownHook(String),

    #[error("Unknown hook stage '{0}'")]
    UnknownStage(String),

    #[error("Invalid hook registration: {0}")]
    InvalidHook(String),

    #[error("No check_trigger_success implementation registered")]
    MissingCheck,

    #[error("check_trigger_success already provided by '{existing}', cannot add '{new}'")]
    DuplicateCheck { existing: String, new: String },
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OnDetect {
    #[default]
    Delete,
    Archive,
    Keep,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoreDumpSettings {
    #[serde(default = "default_coredump_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_coredump_pattern")]
    pub pattern: String,
    pub filter: Option<u32>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub on_detect: OnDetect,
    pub archive_directory: Option<PathBuf>,
    #[serde(default)]
    pub clear_stale: bool,
}

fn default_coredump_directory() -> PathBuf {
    PathBuf::from("/tmp/trigbench-cores")
}

fn default_coredump_pattern() -> String {
    "core.%e.%p".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

impl Default for CoreDumpSettings {
    fn default() -> Self {
        Self {
            directory: default_coredump_directory(),
            pattern: default_coredump_pattern(),
            filter: None,
            poll_timeout_ms: default_poll_timeout_ms(),
            on_detect: OnDetect::default(),
            archive_directory: None,
            clear_stale: false,
        }
    }
}

impl CoreDumpSettings {
    pub fn validate(&self) -> Result<CoreDumpConfig, ConfigError> {
        if self.pattern.trim().is_empty() {
            return Err(ConfigError::InvalidCoredump("pattern is empty".into()));
        }
        if self.pattern.contains('/') {
            return Err(ConfigError::InvalidCoredump(format!(
                "pattern '{}' must be a file name, put the path in directory",
                self.pattern
            )));
        }
        pattern_regex(&self.pattern, Path::new("probe"))
            .map_err(|e| ConfigError::InvalidCoredump(e.to_string()))?;

        let disposal = match (self.on_detect, &self.archive_directory) {
            (OnDetect::Delete, _) => DumpDisposal::Delete,
            (OnDetect::Keep, _) => DumpDisposal::Keep,
            (OnDetect::Archive, Some(dir)) => DumpDisposal::Archive(dir.clone()),
            (OnDetect::Archive, None) => {
                return Err(ConfigError::InvalidCoredump(
                    "on-detect = \"archive\" requires archive-directory".into(),
                ));
            }
        };

        Ok(CoreDumpConfig {
            directory: self.directory.clone(),
            pattern: self.pattern.clone(),
            filter: self.filter,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            disposal,
            clear_stale: self.clear_stale,
        })
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BenchmarkSettings {
    #[serde(default = "default_maximum_tries")]
    pub maximum_tries: u32,
    #[serde(default = "default_wanted_results")]
    pub wanted_results: u32,
    #[serde(default = "default_kept_runs")]
    pub kept_runs: u32,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub cooldown_ms: u64,
    /// File the per-session summary line is appended to.
    pub log: Option<PathBuf>,
}

pub fn default_maximum_tries() -> u32 {
    100
}
pub fn default_wanted_results() -> u32 {
    20
}
pub fn default_kept_runs() -> u32 {
    10
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            maximum_tries: default_maximum_tries(),
            wanted_results: default_wanted_results(),
            kept_runs: default_kept_runs(),
            retention: Retention::default(),
            cooldown_ms: 0,
            log: None,
        }
    }
}

impl BenchmarkSettings {
    pub fn validate(&self) -> Result<BenchmarkPolicy, ConfigError> {
        Ok(
            BenchmarkPolicy::new(self.maximum_tries, self.wanted_results, self.kept_runs)?
                .with_retention(self.retention)
                .with_cooldown(Duration::from_millis(self.cooldown_ms)),
        )
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HookSettings {
    /// Name of the built-in `check_trigger_success` implementation.
    #[serde(default = "default_check")]
    pub check: String,
    #[serde(default = "default_true")]
    pub duration_metric: bool,
    pub run_log: Option<PathBuf>,
}

fn default_check() -> String {
    "outcome".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            check: default_check(),
            duration_metric: true,
            run_log: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "probe", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum ReadinessSettings {
    Tcp { address: String },
    LogMarker { path: PathBuf, marker: String },
    Delay { delay_ms: u64 },
}

impl ReadinessSettings {
    fn to_probe(&self) -> ReadinessProbe {
        match self {
            ReadinessSettings::Tcp { address } => ReadinessProbe::Tcp {
                address: address.clone(),
            },
            ReadinessSettings::LogMarker { path, marker } => ReadinessProbe::LogMarker {
                path: path.clone(),
                marker: marker.clone(),
            },
            ReadinessSettings::Delay { delay_ms } => {
                ReadinessProbe::Delay(Duration::from_millis(*delay_ms))
            }
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct BugLocationSettings {
    pub file: String,
    pub function: String,
    pub line: u32,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SignatureSettings {
    pub signal: Option<i32>,
    pub exit_code: Option<i32>,
}

/// One `[[programs]]` entry.
///
/// Either `success-cmd`/`failure-cmd` (simple) or `start-cmd`/`stop-cmd`/`client-cmd`
/// (client/server) must be given, not both.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProgramSettings {
    pub name: String,
    pub executable: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    pub success_cmd: Option<Vec<String>>,
    pub failure_cmd: Option<Vec<String>>,

    pub start_cmd: Option<Vec<String>>,
    pub stop_cmd: Option<Vec<String>>,
    pub client_cmd: Option<Vec<String>>,
    pub failure_client_cmd: Option<Vec<String>>,
    pub readiness: Option<ReadinessSettings>,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default)]
    pub daemon: bool,

    pub bug_location: Option<BugLocationSettings>,
    pub signature: Option<SignatureSettings>,
    pub benchmark_cmd: Option<Vec<String>>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

/// Readiness used for servers that declare no probe: alive after one second.
const DEFAULT_READY_DELAY: Duration = Duration::from_secs(1);

impl ProgramSettings {
    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidProgram {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn command(&self, field: &str, argv: &Option<Vec<String>>) -> Result<Option<CommandLine>, ConfigError> {
        match argv {
            None => Ok(None),
            Some(argv) => CommandLine::new(argv.clone())
                .map(Some)
                .ok_or_else(|| self.invalid(format!("{field} has no program"))),
        }
    }

    fn required(&self, field: &str, argv: &Option<Vec<String>>) -> Result<CommandLine, ConfigError> {
        self.command(field, argv)?
            .ok_or_else(|| self.invalid(format!("client/server program needs {field}")))
    }

    pub fn validate(&self) -> Result<ProgramDescriptor, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name is empty"));
        }
        if self.executable.as_os_str().is_empty() {
            return Err(self.invalid("executable is empty"));
        }
        if self.timeout_ms == 0 {
            return Err(self.invalid("timeout-ms must be positive"));
        }

        let simple = self.success_cmd.is_some() || self.failure_cmd.is_some();
        let client_server = self.start_cmd.is_some()
            || self.stop_cmd.is_some()
            || self.client_cmd.is_some()
            || self.failure_client_cmd.is_some()
            || self.readiness.is_some();

        let kind = match (simple, client_server) {
            (true, true) => {
                return Err(self.invalid("mixes simple and client/server commands"));
            }
            (false, false) => {
                return Err(self.invalid(
                    "needs success-cmd/failure-cmd or start-cmd/stop-cmd/client-cmd",
                ));
            }
            (true, false) => {
                let success = self.command("success-cmd", &self.success_cmd)?;
                let failure = self.command("failure-cmd", &self.failure_cmd)?;
                // One command may serve both modes; the executable variant tells them apart.
                let (success_cmd, failure_cmd) = match (success, failure) {
                    (Some(s), Some(f)) => (s, f),
                    (Some(cmd), None) | (None, Some(cmd)) => (cmd.clone(), cmd),
                    (None, None) => return Err(self.invalid("no trigger command")),
                };
                TriggerKind::Simple {
                    success_cmd,
                    failure_cmd,
                }
            }
            (false, true) => TriggerKind::ClientServer(self.client_server()?),
        };

        Ok(ProgramDescriptor {
            name: self.name.clone(),
            executable: self.executable.clone(),
            working_dir: self.working_dir.clone(),
            install_dir: self.install_dir.clone(),
            env: self.env.clone(),
            kind,
            bug_location: self.bug_location.as_ref().map(|loc| BugLocation {
                file: loc.file.clone(),
                function: loc.function.clone(),
                line: loc.line,
            }),
            signature: self.signature.as_ref().map(|sig| BugSignature {
                signal: sig.signal,
                exit_code: sig.exit_code,
            }),
            benchmark_cmd: self.command("benchmark-cmd", &self.benchmark_cmd)?,
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }

    fn client_server(&self) -> Result<ClientServerCommands, ConfigError> {
        let readiness = self
            .readiness
            .as_ref()
            .map(ReadinessSettings::to_probe)
            .unwrap_or(ReadinessProbe::Delay(DEFAULT_READY_DELAY));
        let ready_timeout = Duration::from_millis(self.ready_timeout_ms);
        if let ReadinessProbe::Delay(delay) = readiness {
            if delay > ready_timeout {
                return Err(self.invalid(format!(
                    "readiness delay {delay:?} exceeds ready-timeout-ms {ready_timeout:?}"
                )));
            }
        }
        Ok(ClientServerCommands {
            start_cmd: self.required("start-cmd", &self.start_cmd)?,
            stop_cmd: self.required("stop-cmd", &self.stop_cmd)?,
            client_cmd: self.required("client-cmd", &self.client_cmd)?,
            failure_client_cmd: self.command("failure-client-cmd", &self.failure_client_cmd)?,
            readiness,
            ready_timeout,
            grace_period: Duration::from_millis(self.grace_period_ms),
            daemon: self.daemon,
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TrigbenchConfig {
    #[serde(default)]
    pub coredump: CoreDumpSettings,
    #[serde(default)]
    pub benchmark: BenchmarkSettings,
    #[serde(default)]
    pub hooks: HookSettings,
    #[serde(default)]
    pub programs: Vec<ProgramSettings>,
}

/// Validated, immutable configuration a session runs with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub coredump: CoreDumpConfig,
    pub benchmark: BenchmarkPolicy,
    pub benchmark_log: Option<PathBuf>,
    pub hooks: HookSettings,
    pub programs: Vec<Arc<ProgramDescriptor>>,
}

impl TrigbenchConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    pub fn validate(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut seen = HashSet::new();
        let mut programs = Vec::with_capacity(self.programs.len());
        for settings in &self.programs {
            if !seen.insert(settings.name.as_str()) {
                return Err(ConfigError::DuplicateProgram(settings.name.clone()));
            }
            programs.push(Arc::new(settings.validate()?));
        }

        Ok(RuntimeConfig {
            coredump: self.coredump.validate()?,
            benchmark: self.benchmark.validate()?,
            benchmark_log: self.benchmark.log.clone(),
            hooks: self.hooks.clone(),
            programs,
        })
    }
}

impl std::str::FromStr for TrigbenchConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(content)?)
    }
}
