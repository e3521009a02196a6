use crate::benchmark::{BenchmarkEngine, BenchmarkError, BenchmarkReport};
use crate::config::{ConfigError, RuntimeConfig};
use crate::hooks::{HookDispatcher, HookRegistry};
use crate::observer::{self, CoreDumpObserver};
use crate::oracle::{Oracle, target_outcome};
use crate::program::{ProgramDescriptor, RunMode};
use crate::trigger::{RunResult, Trigger, Workload};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown program '{0}'")]
    UnknownProgram(String),

    #[error(transparent)]
    Benchmark(#[from] BenchmarkError),
}

/// Runs programs from one validated configuration.
///
/// Owns the coredump directory for its lifetime; runs are strictly sequential.
pub struct Session {
    config: RuntimeConfig,
    observer: CoreDumpObserver,
    dispatcher: HookDispatcher,
    oracles: HashMap<String, Arc<dyn Oracle>>,
    attempts: u32,
}

impl Session {
    /// Prepares the dump directory and freezes the hook registrations.
    pub fn initialize(config: RuntimeConfig, registry: HookRegistry) -> Result<Self, SessionError> {
        let dispatcher = registry.build()?;
        observer::setup(&config.coredump).map_err(ConfigError::from)?;
        info!(
            "Session ready with {} program(s), dumps in {:?}",
            config.programs.len(),
            config.coredump.directory
        );
        Ok(Self {
            observer: CoreDumpObserver::new(config.coredump.clone()),
            config,
            dispatcher,
            oracles: HashMap::new(),
            attempts: 0,
        })
    }

    /// Session using the built-in hooks selected by the configuration.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, SessionError> {
        let registry = HookRegistry::from_settings(&config.hooks)?;
        Self::initialize(config, registry)
    }

    /// Replaces the default classification for one program.
    pub fn with_oracle(mut self, program: &str, oracle: Arc<dyn Oracle>) -> Result<Self, SessionError> {
        self.descriptor(program)?;
        self.oracles.insert(program.to_string(), oracle);
        Ok(self)
    }

    pub fn programs(&self) -> impl Iterator<Item = &ProgramDescriptor> {
        self.config.programs.iter().map(|p| p.as_ref())
    }

    fn descriptor(&self, name: &str) -> Result<&Arc<ProgramDescriptor>, SessionError> {
        self.config
            .programs
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SessionError::UnknownProgram(name.to_string()))
    }

    fn trigger_for(&self, name: &str) -> Result<Trigger, SessionError> {
        let descriptor = Arc::clone(self.descriptor(name)?);
        Ok(match self.oracles.get(name) {
            Some(oracle) => Trigger::new(descriptor, Arc::clone(oracle)),
            None => Trigger::with_default_oracle(descriptor),
        })
    }

    /// Runs the `post_install_run` stage for `name`.
    pub fn post_install(&self, name: &str) -> Result<bool, SessionError> {
        let descriptor = self.descriptor(name)?;
        Ok(self.dispatcher.run_post_install(descriptor))
    }

    /// One hook-wrapped run of `name` in `mode`.
    pub fn trigger(&mut self, name: &str, mode: RunMode) -> Result<RunResult, SessionError> {
        let trigger = self.trigger_for(name)?;
        self.attempts += 1;
        let observer = &mut self.observer;
        let result = self.dispatcher.dispatch(trigger.descriptor(), mode, self.attempts, |wrapper| {
            trigger.execute(mode, Workload::Normal, wrapper, &mut *observer)
        });
        info!("'{name}' ({mode}): {}", result.outcome);
        Ok(result)
    }

    /// Repeats hook-wrapped runs of `name` until the benchmark policy is satisfied.
    ///
    /// An exhausted benchmark is returned as [`SessionError::Benchmark`] carrying
    /// the partial report.
    pub fn benchmark(&mut self, name: &str, mode: RunMode) -> Result<BenchmarkReport, SessionError> {
        let trigger = self.trigger_for(name)?;
        let engine = BenchmarkEngine::new(self.config.benchmark);
        let dispatcher = &self.dispatcher;
        let observer = &mut self.observer;

        let report = engine.run(name, mode, target_outcome(mode), |attempt| {
            dispatcher.dispatch(trigger.descriptor(), mode, attempt, |wrapper| {
                trigger.execute(mode, Workload::Benchmark, wrapper, &mut *observer)
            })
        });
        self.attempts += report.attempts;

        if let Some(log) = &self.config.benchmark_log {
            if let Err(e) = report.append_to_log(log) {
                warn!("Could not append to benchmark log {log:?}: {e}");
            }
        }
        Ok(report.into_result()?)
    }
}
