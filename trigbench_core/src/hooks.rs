use crate::config::{ConfigError, HookSettings};
use crate::executor::InfraError;
use crate::oracle::RunOutcome;
use crate::program::{ProgramDescriptor, RunMode};
use crate::trigger::{Metrics, RunResult};
use anyhow::Context;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    PostInstallRun,
    BeforeRun,
    PreTriggerRun,
    CheckTriggerSuccess,
    PostTriggerRun,
    AfterRun,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::PostInstallRun,
        Stage::BeforeRun,
        Stage::PreTriggerRun,
        Stage::CheckTriggerSuccess,
        Stage::PostTriggerRun,
        Stage::AfterRun,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::PostInstallRun => "post_install_run",
            Stage::BeforeRun => "before_run",
            Stage::PreTriggerRun => "pre_trigger_run",
            Stage::CheckTriggerSuccess => "check_trigger_success",
            Stage::PostTriggerRun => "post_trigger_run",
            Stage::AfterRun => "after_run",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| ConfigError::UnknownStage(s.to_string()))
    }
}

/// What a hook sees of the run it is attached to.
pub struct HookContext<'a> {
    pub program: &'a ProgramDescriptor,
    pub mode: RunMode,
    /// 1-based attempt number within the current session.
    pub attempt: u32,
    /// Set for stages after the trigger executed.
    pub result: Option<&'a RunResult>,
    pub metrics: &'a mut Metrics,
    /// Arguments prepended to the target's command, such as `rr record`.
    /// Only changes made in `before_run` and `pre_trigger_run` take effect.
    pub wrapper: &'a mut Vec<String>,
}

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn call(&self, stage: Stage, ctx: &mut HookContext<'_>) -> anyhow::Result<()>;
}

/// Wraps a closure as a [`Hook`].
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(Stage, &mut HookContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Hook for FnHook<F>
where
    F: Fn(Stage, &mut HookContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, stage: Stage, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        (self.f)(stage, ctx)
    }
}

/// The single `check_trigger_success` implementation. Its answer is the run's outcome.
pub trait SuccessCheck: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, program: &ProgramDescriptor, mode: RunMode, result: &RunResult) -> RunOutcome;
}

/// Accepts the trigger's own classification.
#[derive(Debug, Default)]
pub struct OutcomeCheck;

impl SuccessCheck for OutcomeCheck {
    fn name(&self) -> &str {
        "outcome"
    }

    fn check(&self, _program: &ProgramDescriptor, _mode: RunMode, result: &RunResult) -> RunOutcome {
        result.outcome
    }
}

/// Appends one line per attempt to a run log.
#[derive(Debug)]
pub struct RunLogHook {
    path: PathBuf,
}

impl RunLogHook {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Hook for RunLogHook {
    fn name(&self) -> &str {
        "run-log"
    }

    fn call(&self, _stage: Stage, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        let Some(result) = ctx.result else {
            return Ok(());
        };
        let status = match result.status {
            Some(status) => status.to_string(),
            None => "no status".to_string(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open run log {:?}", self.path))?;
        writeln!(
            file,
            "{}, {}, {}, {}, {}, {:.6}, {}",
            result.program,
            result.mode,
            ctx.attempt,
            result.outcome,
            status,
            result.duration.as_secs_f64(),
            result.coredump
        )
        .with_context(|| format!("Failed to write run log {:?}", self.path))?;
        Ok(())
    }
}

/// Records the run's duration as the `duration_ms` metric.
#[derive(Debug, Default)]
pub struct DurationMetricHook;

impl Hook for DurationMetricHook {
    fn name(&self) -> &str {
        "duration-metric"
    }

    fn call(&self, _stage: Stage, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        if let Some(result) = ctx.result {
            let millis = result.duration.as_secs_f64() * 1000.0;
            ctx.metrics
                .insert("duration_ms".to_string(), serde_json::json!(millis));
        }
        Ok(())
    }
}

/// Stage registrations collected at startup.
#[derive(Default)]
pub struct HookRegistry {
    stages: BTreeMap<Stage, Vec<Arc<dyn Hook>>>,
    check: Option<Arc<dyn SuccessCheck>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in registrations selected by the `[hooks]` table.
    pub fn from_settings(settings: &HookSettings) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        match settings.check.as_str() {
            "outcome" => registry.set_check(OutcomeCheck)?,
            other => return Err(ConfigError::UnknownHook(other.to_string())),
        };
        if settings.duration_metric {
            registry.register(Stage::PostTriggerRun, DurationMetricHook)?;
        }
        if let Some(path) = &settings.run_log {
            registry.register(Stage::PostTriggerRun, RunLogHook::new(path.clone()))?;
        }
        Ok(registry)
    }

    /// Appends `hook` to `stage`. Hooks of a stage run in registration order.
    pub fn register(
        &mut self,
        stage: Stage,
        hook: impl Hook + 'static,
    ) -> Result<&mut Self, ConfigError> {
        if stage == Stage::CheckTriggerSuccess {
            return Err(ConfigError::InvalidHook(format!(
                "'{}' cannot be registered for {stage}; use a success check",
                hook.name()
            )));
        }
        self.stages.entry(stage).or_default().push(Arc::new(hook));
        Ok(self)
    }

    pub fn set_check(&mut self, check: impl SuccessCheck + 'static) -> Result<&mut Self, ConfigError> {
        if let Some(existing) = &self.check {
            return Err(ConfigError::DuplicateCheck {
                existing: existing.name().to_string(),
                new: check.name().to_string(),
            });
        }
        self.check = Some(Arc::new(check));
        Ok(self)
    }

    /// Freezes the registrations. Fails when no success check was provided.
    pub fn build(self) -> Result<HookDispatcher, ConfigError> {
        let check = self.check.ok_or(ConfigError::MissingCheck)?;
        for (stage, hooks) in &self.stages {
            let names: Vec<&str> = hooks.iter().map(|h| h.name()).collect();
            debug!("Stage {stage}: {names:?}");
        }
        debug!("Stage {}: {}", Stage::CheckTriggerSuccess, check.name());
        Ok(HookDispatcher {
            stages: self.stages,
            check,
        })
    }
}

/// Runs the stages around each trigger execution.
pub struct HookDispatcher {
    stages: BTreeMap<Stage, Vec<Arc<dyn Hook>>>,
    check: Arc<dyn SuccessCheck>,
}

impl HookDispatcher {
    pub fn hooks(&self, stage: Stage) -> impl Iterator<Item = &str> {
        self.stages
            .get(&stage)
            .into_iter()
            .flatten()
            .map(|hook| hook.name())
    }

    /// Runs the `post_install_run` stage. Returns false if any hook failed.
    pub fn run_post_install(&self, program: &ProgramDescriptor) -> bool {
        let mut scratch = Scratch::default();
        let outcome = self.run_stage(Stage::PostInstallRun, program, RunMode::Success, 0, None, &mut scratch);
        outcome.failures == 0 && outcome.panic.is_none()
    }

    /// Wraps one execution in the hook stages.
    ///
    /// `post_trigger_run` and `after_run` run exactly once whatever happens to
    /// the execution. A panic before or during the execution, or in the check,
    /// turns the run into an infra error. Panics in the later stages are
    /// recorded in `cleanup_errors` and leave the outcome alone.
    pub fn dispatch<F>(
        &self,
        program: &ProgramDescriptor,
        mode: RunMode,
        attempt: u32,
        execute: F,
    ) -> RunResult
    where
        F: FnOnce(&[String]) -> RunResult,
    {
        let mut scratch = Scratch::default();

        let mut panic = self
            .run_stage(Stage::BeforeRun, program, mode, attempt, None, &mut scratch)
            .panic;
        if panic.is_none() {
            panic = self
                .run_stage(Stage::PreTriggerRun, program, mode, attempt, None, &mut scratch)
                .panic;
        }
        let wrapper = std::mem::take(&mut scratch.wrapper);
        if !wrapper.is_empty() {
            debug!("Wrapping '{}' in {wrapper:?}", program.name);
        }

        let mut result = match panic {
            Some(message) => {
                warn!("Skipping execution of '{}' after a hook panicked", program.name);
                RunResult::panicked(&program.name, mode, message)
            }
            None => match catch_unwind(AssertUnwindSafe(|| execute(&wrapper))) {
                Ok(result) => self.check(program, mode, result),
                Err(payload) => {
                    let message = panic_message(payload);
                    error!("Execution of '{}' panicked: {message}", program.name);
                    RunResult::panicked(&program.name, mode, message)
                }
            },
        };

        scratch.metrics.append(&mut result.metrics);
        let post = self.run_stage(
            Stage::PostTriggerRun,
            program,
            mode,
            attempt,
            Some(&result),
            &mut scratch,
        );
        let after = self.run_stage(Stage::AfterRun, program, mode, attempt, Some(&result), &mut scratch);
        for (stage, outcome) in [(Stage::PostTriggerRun, post), (Stage::AfterRun, after)] {
            if let Some(message) = outcome.panic {
                result
                    .cleanup_errors
                    .push(format!("Hook panicked in {stage}: {message}"));
            }
        }
        result.metrics = scratch.metrics;
        result
    }

    fn check(&self, program: &ProgramDescriptor, mode: RunMode, mut result: RunResult) -> RunResult {
        let check = &self.check;
        match catch_unwind(AssertUnwindSafe(|| check.check(program, mode, &result))) {
            Ok(outcome) => {
                if outcome != result.outcome {
                    debug!(
                        "Check '{}' changed outcome of '{}' from {} to {outcome}",
                        check.name(),
                        program.name,
                        result.outcome
                    );
                }
                result.outcome = outcome;
                result
            }
            Err(payload) => {
                let message = panic_message(payload);
                error!("Check '{}' panicked: {message}", check.name());
                result.outcome = RunOutcome::InfraError;
                result.infra = Some(InfraError::Panicked(message));
                result
            }
        }
    }

    fn run_stage(
        &self,
        stage: Stage,
        program: &ProgramDescriptor,
        mode: RunMode,
        attempt: u32,
        result: Option<&RunResult>,
        scratch: &mut Scratch,
    ) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        let Some(hooks) = self.stages.get(&stage) else {
            return outcome;
        };
        for hook in hooks {
            let mut ctx = HookContext {
                program,
                mode,
                attempt,
                result,
                metrics: &mut scratch.metrics,
                wrapper: &mut scratch.wrapper,
            };
            match catch_unwind(AssertUnwindSafe(|| hook.call(stage, &mut ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Hook '{}' failed in {stage}: {e:#}", hook.name());
                    outcome.failures += 1;
                }
                Err(payload) => {
                    let message = panic_message(payload);
                    error!("Hook '{}' panicked in {stage}: {message}", hook.name());
                    if outcome.panic.is_none() {
                        outcome.panic = Some(message);
                    }
                }
            }
        }
        outcome
    }
}

/// State hooks share across the stages of one run.
#[derive(Debug, Default)]
struct Scratch {
    metrics: Metrics,
    wrapper: Vec<String>,
}

#[derive(Debug, Default)]
struct StageOutcome {
    failures: usize,
    panic: Option<String>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExitStatus;
    use crate::program::{CommandLine, TriggerKind};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn descriptor() -> ProgramDescriptor {
        let cmd = CommandLine::new(vec!["true".into()]).unwrap();
        ProgramDescriptor {
            name: "pbzip2".into(),
            executable: PathBuf::from("pbzip2"),
            working_dir: None,
            install_dir: None,
            env: BTreeMap::new(),
            kind: TriggerKind::Simple {
                success_cmd: cmd.clone(),
                failure_cmd: cmd,
            },
            bug_location: None,
            signature: None,
            benchmark_cmd: None,
            timeout: Duration::from_secs(1),
        }
    }

    fn success() -> RunResult {
        RunResult {
            program: "pbzip2".into(),
            mode: RunMode::Success,
            command: "true".into(),
            status: Some(ExitStatus::Code(0)),
            duration: Duration::from_millis(40),
            coredump: false,
            artifact: None,
            outcome: RunOutcome::Success,
            infra: None,
            cleanup_errors: Vec::new(),
            metrics: Metrics::new(),
        }
    }

    /// Registers a recorder for every stage except the check.
    fn recording_registry(events: &Arc<Mutex<Vec<String>>>) -> HookRegistry {
        let mut registry = HookRegistry::new();
        registry.set_check(OutcomeCheck).unwrap();
        for stage in Stage::ALL {
            if stage == Stage::CheckTriggerSuccess {
                continue;
            }
            let events = Arc::clone(events);
            registry
                .register(
                    stage,
                    FnHook::new("recorder", move |stage, _ctx| {
                        events.lock().unwrap().push(stage.name().to_string());
                        Ok(())
                    }),
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.name().parse::<Stage>().unwrap(), stage);
        }
        assert!(matches!("during_run".parse::<Stage>(), Err(ConfigError::UnknownStage(_))));
    }

    #[test]
    fn missing_check_is_rejected_before_any_run() {
        let registry = HookRegistry::new();
        assert!(matches!(registry.build(), Err(ConfigError::MissingCheck)));
    }

    #[test]
    fn second_check_is_rejected() {
        let mut registry = HookRegistry::new();
        registry.set_check(OutcomeCheck).unwrap();
        assert!(matches!(
            registry.set_check(OutcomeCheck),
            Err(ConfigError::DuplicateCheck { .. })
        ));
    }

    #[test]
    fn check_stage_cannot_take_plain_hooks() {
        let mut registry = HookRegistry::new();
        let result = registry.register(Stage::CheckTriggerSuccess, DurationMetricHook);
        assert!(matches!(result, Err(ConfigError::InvalidHook(_))));
    }

    #[test]
    fn stages_run_in_nesting_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = recording_registry(&events).build().unwrap();
        let program = descriptor();

        let exec_events = Arc::clone(&events);
        let result = dispatcher.dispatch(&program, RunMode::Success, 1, |_| {
            exec_events.lock().unwrap().push("execute".into());
            success()
        });
        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["before_run", "pre_trigger_run", "execute", "post_trigger_run", "after_run"]
        );
    }

    #[test]
    fn post_stages_run_once_when_execution_panics() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = recording_registry(&events).build().unwrap();
        let program = descriptor();

        let result = dispatcher.dispatch(&program, RunMode::Fail, 1, |_| -> RunResult {
            panic!("supervisor exploded")
        });
        assert_eq!(result.outcome, RunOutcome::InfraError);
        assert_eq!(
            result.infra,
            Some(InfraError::Panicked("supervisor exploded".into()))
        );
        let events = events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| *e == "post_trigger_run").count(), 1);
        assert_eq!(events.iter().filter(|e| *e == "after_run").count(), 1);
    }

    #[test]
    fn post_stages_run_once_when_execution_times_out() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = recording_registry(&events).build().unwrap();
        let program = descriptor();

        let result = dispatcher.dispatch(&program, RunMode::Fail, 1, |_| {
            let mut result = success();
            result.status = None;
            result.outcome = RunOutcome::InfraError;
            result.infra = Some(InfraError::Timeout {
                command: "true".into(),
                timeout: Duration::from_secs(1),
            });
            result
        });
        assert_eq!(result.outcome, RunOutcome::InfraError);
        let events = events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| *e == "post_trigger_run").count(), 1);
        assert_eq!(events.iter().filter(|e| *e == "after_run").count(), 1);
    }

    #[test]
    fn panicking_before_run_hook_skips_execution_but_not_cleanup() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry.set_check(OutcomeCheck).unwrap();
        registry
            .register(
                Stage::BeforeRun,
                FnHook::new("broken", |_, _| -> anyhow::Result<()> { panic!("bad hook") }),
            )
            .unwrap();
        let after_events = Arc::clone(&events);
        registry
            .register(
                Stage::AfterRun,
                FnHook::new("after", move |_, ctx| {
                    let outcome = ctx.result.map(|r| r.outcome);
                    after_events.lock().unwrap().push(format!("{outcome:?}"));
                    Ok(())
                }),
            )
            .unwrap();
        let dispatcher = registry.build().unwrap();

        let mut executed = false;
        let result = dispatcher.dispatch(&descriptor(), RunMode::Success, 1, |_| {
            executed = true;
            success()
        });
        assert!(!executed);
        assert_eq!(result.outcome, RunOutcome::InfraError);
        assert_eq!(*events.lock().unwrap(), vec!["Some(InfraError)"]);
    }

    #[test]
    fn panicking_after_run_hook_keeps_checked_outcome() {
        let mut registry = HookRegistry::new();
        registry.set_check(OutcomeCheck).unwrap();
        registry
            .register(
                Stage::AfterRun,
                FnHook::new("broken", |_, _| -> anyhow::Result<()> { panic!("report failed") }),
            )
            .unwrap();
        let dispatcher = registry.build().unwrap();

        let result = dispatcher.dispatch(&descriptor(), RunMode::Fail, 1, |_| {
            let mut result = success();
            result.mode = RunMode::Fail;
            result.status = Some(ExitStatus::Signal(11));
            result.coredump = true;
            result.outcome = RunOutcome::ExpectedFailure;
            result
        });
        assert_eq!(result.outcome, RunOutcome::ExpectedFailure);
        assert!(result.infra.is_none());
        assert_eq!(result.cleanup_errors, vec!["Hook panicked in after_run: report failed"]);
    }

    #[test]
    fn pre_trigger_hooks_wrap_the_command() {
        let mut registry = HookRegistry::new();
        registry.set_check(OutcomeCheck).unwrap();
        registry
            .register(
                Stage::PreTriggerRun,
                FnHook::new("rr", |_, ctx| {
                    ctx.wrapper.extend(["rr".to_string(), "record".to_string()]);
                    Ok(())
                }),
            )
            .unwrap()
            .register(
                Stage::PostTriggerRun,
                FnHook::new("late", |_, ctx| {
                    ctx.wrapper.push("ignored".to_string());
                    Ok(())
                }),
            )
            .unwrap();
        let dispatcher = registry.build().unwrap();

        for attempt in 1..=2 {
            let mut seen = Vec::new();
            dispatcher.dispatch(&descriptor(), RunMode::Success, attempt, |wrapper| {
                seen = wrapper.to_vec();
                success()
            });
            assert_eq!(seen, vec!["rr", "record"]);
        }
    }

    #[test]
    fn hook_errors_are_logged_not_fatal() {
        let mut registry = HookRegistry::new();
        registry.set_check(OutcomeCheck).unwrap();
        registry
            .register(
                Stage::PostTriggerRun,
                FnHook::new("failing", |_, _| Err(anyhow::anyhow!("disk full"))),
            )
            .unwrap();
        let dispatcher = registry.build().unwrap();
        let result = dispatcher.dispatch(&descriptor(), RunMode::Success, 1, |_| success());
        assert_eq!(result.outcome, RunOutcome::Success);
    }

    #[test]
    fn check_decides_the_outcome() {
        struct AlwaysCrash;
        impl SuccessCheck for AlwaysCrash {
            fn name(&self) -> &str {
                "always-crash"
            }
            fn check(&self, _: &ProgramDescriptor, _: RunMode, _: &RunResult) -> RunOutcome {
                RunOutcome::UnexpectedCrash
            }
        }
        let mut registry = HookRegistry::new();
        registry.set_check(AlwaysCrash).unwrap();
        let dispatcher = registry.build().unwrap();
        let result = dispatcher.dispatch(&descriptor(), RunMode::Success, 1, |_| success());
        assert_eq!(result.outcome, RunOutcome::UnexpectedCrash);
    }

    #[test]
    fn metrics_flow_from_pre_to_post_stages() {
        let mut registry = HookRegistry::new();
        registry.set_check(OutcomeCheck).unwrap();
        registry
            .register(
                Stage::PreTriggerRun,
                FnHook::new("tag", |_, ctx| {
                    ctx.metrics.insert("threads".into(), serde_json::json!(4));
                    Ok(())
                }),
            )
            .unwrap()
            .register(Stage::PostTriggerRun, DurationMetricHook)
            .unwrap();
        let dispatcher = registry.build().unwrap();
        let result = dispatcher.dispatch(&descriptor(), RunMode::Success, 1, |_| success());
        assert_eq!(result.metrics["threads"], serde_json::json!(4));
        assert_eq!(result.metrics["duration_ms"], serde_json::json!(40.0));
    }

    #[test]
    fn run_log_appends_a_line_per_attempt() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("runs.log");
        let settings = HookSettings {
            run_log: Some(log.clone()),
            ..HookSettings::default()
        };
        let dispatcher = HookRegistry::from_settings(&settings).unwrap().build().unwrap();
        assert_eq!(
            dispatcher.hooks(Stage::PostTriggerRun).collect::<Vec<_>>(),
            vec!["duration-metric", "run-log"]
        );
        for attempt in 1..=3 {
            dispatcher.dispatch(&descriptor(), RunMode::Success, attempt, |_| success());
        }
        let content = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("pbzip2, success, 3, success, exited with code 0"));
    }

    #[test]
    fn post_install_reports_failures() {
        let mut registry = HookRegistry::new();
        registry.set_check(OutcomeCheck).unwrap();
        registry
            .register(
                Stage::PostInstallRun,
                FnHook::new("verify", |_, ctx| {
                    anyhow::ensure!(ctx.program.install_dir.is_some(), "not installed");
                    Ok(())
                }),
            )
            .unwrap();
        let dispatcher = registry.build().unwrap();
        assert!(!dispatcher.run_post_install(&descriptor()));
        let mut installed = descriptor();
        installed.install_dir = Some(PathBuf::from("/opt/pbzip2"));
        assert!(dispatcher.run_post_install(&installed));
    }
}
