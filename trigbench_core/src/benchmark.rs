use crate::config::ConfigError;
use crate::oracle::RunOutcome;
use crate::program::RunMode;
use crate::stats::SampleStatistics;
use crate::trigger::RunResult;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Which collected samples make it into the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Retention {
    /// The last `kept_runs` samples; earlier ones count as warm-up.
    #[default]
    Trailing,
    /// The first `kept_runs` samples.
    Leading,
}

/// Validated retry-and-trim bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkPolicy {
    maximum_tries: u32,
    wanted_results: u32,
    kept_runs: u32,
    retention: Retention,
    cooldown: Duration,
}

impl BenchmarkPolicy {
    pub fn new(maximum_tries: u32, wanted_results: u32, kept_runs: u32) -> Result<Self, ConfigError> {
        if maximum_tries < 1 {
            return Err(ConfigError::InvalidBenchmark(
                "maximum-tries must be at least 1".into(),
            ));
        }
        if wanted_results < 1 || wanted_results > maximum_tries {
            return Err(ConfigError::InvalidBenchmark(format!(
                "wanted-results must be between 1 and maximum-tries ({maximum_tries}), got {wanted_results}"
            )));
        }
        if kept_runs < 1 || kept_runs > wanted_results {
            return Err(ConfigError::InvalidBenchmark(format!(
                "kept-runs must be between 1 and wanted-results ({wanted_results}), got {kept_runs}"
            )));
        }
        Ok(Self {
            maximum_tries,
            wanted_results,
            kept_runs,
            retention: Retention::default(),
            cooldown: Duration::ZERO,
        })
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Pause between consecutive attempts.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn maximum_tries(&self) -> u32 {
        self.maximum_tries
    }

    pub fn wanted_results(&self) -> u32 {
        self.wanted_results
    }

    pub fn kept_runs(&self) -> u32 {
        self.kept_runs
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }
}

impl Default for BenchmarkPolicy {
    fn default() -> Self {
        Self {
            maximum_tries: 100,
            wanted_results: 20,
            kept_runs: 10,
            retention: Retention::Trailing,
            cooldown: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: RunOutcome,
    pub duration: Duration,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    /// `wanted_results` samples were collected.
    Completed,
    /// `maximum_tries` attempts were spent first.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub program: String,
    pub mode: RunMode,
    /// Retained window of durations, in collection order.
    pub kept: Vec<Duration>,
    pub collected: usize,
    pub discarded: u32,
    pub attempts: u32,
    pub termination: Termination,
    pub attempt_log: Vec<AttemptRecord>,
    pub statistics: Option<SampleStatistics>,
}

impl BenchmarkReport {
    pub fn is_exhausted(&self) -> bool {
        self.termination == Termination::Exhausted
    }

    pub fn into_result(self) -> Result<Self, BenchmarkError> {
        match self.termination {
            Termination::Completed => Ok(self),
            Termination::Exhausted => Err(BenchmarkError::Exhausted(Box::new(self))),
        }
    }

    /// `name, mode, kept, mean, stdev, variance, samples...` with times in seconds.
    pub fn log_line(&self) -> String {
        let (mean, stdev, variance) = self
            .statistics
            .map(|s| (s.mean, s.stdev, s.variance))
            .unwrap_or_default();
        let mut fields = vec![
            self.program.clone(),
            self.mode.to_string(),
            self.kept.len().to_string(),
            format!("{mean:.6}"),
            format!("{stdev:.6}"),
            format!("{variance:.6}"),
        ];
        fields.extend(self.kept.iter().map(|d| format!("{:.6}", d.as_secs_f64())));
        fields.join(", ")
    }

    pub fn append_to_log(&self, path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", self.log_line())
    }
}

#[derive(Error, Debug)]
pub enum BenchmarkError {
    #[error(
        "Benchmark of '{}' exhausted after {} attempts with {} collected samples",
        .0.program, .0.attempts, .0.collected
    )]
    Exhausted(Box<BenchmarkReport>),
}

/// Repeats a run until enough accepted samples are collected or the try budget is spent.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkEngine {
    policy: BenchmarkPolicy,
}

impl BenchmarkEngine {
    pub fn new(policy: BenchmarkPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BenchmarkPolicy {
        &self.policy
    }

    /// Calls `attempt` with 1-based attempt numbers. Runs whose outcome is not
    /// `accepted` are counted and discarded.
    pub fn run<F>(&self, program: &str, mode: RunMode, accepted: RunOutcome, mut attempt: F) -> BenchmarkReport
    where
        F: FnMut(u32) -> RunResult,
    {
        let wanted = self.policy.wanted_results as usize;
        let mut samples: Vec<Duration> = Vec::with_capacity(wanted);
        let mut attempt_log = Vec::new();
        let mut attempts = 0u32;
        let mut discarded = 0u32;

        info!(
            "Benchmarking '{program}' in {mode} mode: want {wanted} samples within {} tries",
            self.policy.maximum_tries
        );

        while samples.len() < wanted && attempts < self.policy.maximum_tries {
            if attempts > 0 && !self.policy.cooldown.is_zero() {
                std::thread::sleep(self.policy.cooldown);
            }
            attempts += 1;
            let result = attempt(attempts);
            let is_accepted = result.outcome == accepted;
            if is_accepted {
                samples.push(result.duration);
                debug!(
                    "Attempt {attempts}: sample {}/{wanted} ({:?})",
                    samples.len(),
                    result.duration
                );
            } else {
                discarded += 1;
                warn!(
                    "Attempt {attempts} of '{program}' discarded: {} (expected {accepted})",
                    result.outcome
                );
            }
            attempt_log.push(AttemptRecord {
                attempt: attempts,
                outcome: result.outcome,
                duration: result.duration,
                accepted: is_accepted,
            });
        }

        let termination = if samples.len() >= wanted {
            Termination::Completed
        } else {
            Termination::Exhausted
        };
        let collected = samples.len();
        let kept = self.retain(samples);
        let statistics = SampleStatistics::from_durations(&kept);

        match termination {
            Termination::Completed => info!(
                "Benchmark of '{program}' completed after {attempts} attempts, keeping {} samples",
                kept.len()
            ),
            Termination::Exhausted => warn!(
                "Benchmark of '{program}' exhausted after {attempts} attempts with {collected}/{wanted} samples"
            ),
        }

        BenchmarkReport {
            program: program.to_string(),
            mode,
            kept,
            collected,
            discarded,
            attempts,
            termination,
            attempt_log,
            statistics,
        }
    }

    fn retain(&self, mut samples: Vec<Duration>) -> Vec<Duration> {
        let keep = (self.policy.kept_runs as usize).min(samples.len());
        match self.policy.retention {
            Retention::Trailing => samples.split_off(samples.len() - keep),
            Retention::Leading => {
                samples.truncate(keep);
                samples
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Metrics;
    use tempfile::TempDir;

    fn result(outcome: RunOutcome, millis: u64) -> RunResult {
        RunResult {
            program: "pbzip2".into(),
            mode: RunMode::Success,
            command: "pbzip2 -k".into(),
            status: None,
            duration: Duration::from_millis(millis),
            coredump: false,
            artifact: None,
            outcome,
            infra: None,
            cleanup_errors: Vec::new(),
            metrics: Metrics::new(),
        }
    }

    #[test]
    fn policy_bounds_are_validated() {
        assert!(BenchmarkPolicy::new(0, 1, 1).is_err());
        assert!(BenchmarkPolicy::new(5, 0, 1).is_err());
        assert!(BenchmarkPolicy::new(5, 6, 1).is_err());
        assert!(BenchmarkPolicy::new(5, 3, 0).is_err());
        assert!(BenchmarkPolicy::new(5, 3, 4).is_err());
        assert!(BenchmarkPolicy::new(1, 1, 1).is_ok());
        assert!(BenchmarkPolicy::new(100, 20, 10).is_ok());
    }

    #[test]
    fn discarded_attempts_are_counted_and_trailing_window_kept() {
        let engine = BenchmarkEngine::new(BenchmarkPolicy::new(100, 20, 10).unwrap());
        // Attempts 3 and 9 are infra errors; every other attempt is a success of n ms.
        let report = engine.run("pbzip2", RunMode::Success, RunOutcome::Success, |n| {
            if n == 3 || n == 9 {
                result(RunOutcome::InfraError, 1)
            } else {
                result(RunOutcome::Success, u64::from(n))
            }
        });

        assert_eq!(report.termination, Termination::Completed);
        assert_eq!(report.collected, 20);
        assert_eq!(report.discarded, 2);
        assert_eq!(report.attempts, 22);
        assert!(report.attempts <= 24);
        assert_eq!(report.attempt_log.len(), 22);
        let expected: Vec<Duration> = (13..=22).map(Duration::from_millis).collect();
        assert_eq!(report.kept, expected);
        assert!(report.clone().into_result().is_ok());
    }

    #[test]
    fn leading_retention_keeps_first_samples() {
        let policy = BenchmarkPolicy::new(10, 5, 2)
            .unwrap()
            .with_retention(Retention::Leading);
        let report = BenchmarkEngine::new(policy).run("x", RunMode::Success, RunOutcome::Success, |n| {
            result(RunOutcome::Success, u64::from(n))
        });
        assert_eq!(report.kept, vec![Duration::from_millis(1), Duration::from_millis(2)]);
    }

    #[test]
    fn all_infra_errors_exhaust_the_budget() {
        let engine = BenchmarkEngine::new(BenchmarkPolicy::new(100, 20, 10).unwrap());
        let mut calls = 0;
        let report = engine.run("memcached", RunMode::Fail, RunOutcome::ExpectedFailure, |_| {
            calls += 1;
            result(RunOutcome::InfraError, 5)
        });
        assert_eq!(calls, 100);
        assert_eq!(report.attempts, 100);
        assert_eq!(report.termination, Termination::Exhausted);
        assert!(report.kept.is_empty());
        assert!(report.statistics.is_none());
        match report.into_result() {
            Err(BenchmarkError::Exhausted(report)) => assert_eq!(report.collected, 0),
            Ok(_) => panic!("Expected exhaustion"),
        }
    }

    #[test]
    fn terminates_within_maximum_tries_for_any_outcome_mix() {
        let outcomes = [
            RunOutcome::Success,
            RunOutcome::InfraError,
            RunOutcome::UnexpectedCrash,
            RunOutcome::ExpectedFailure,
        ];
        for maximum in 1..=12u32 {
            for wanted in 1..=maximum {
                let engine = BenchmarkEngine::new(BenchmarkPolicy::new(maximum, wanted, 1).unwrap());
                let report = engine.run("x", RunMode::Success, RunOutcome::Success, |n| {
                    result(outcomes[(n as usize * 7 + wanted as usize) % outcomes.len()], 1)
                });
                assert!(report.attempts <= maximum);
                assert!(report.kept.len() <= 1);
                if !report.is_exhausted() {
                    assert_eq!(report.collected, wanted as usize);
                }
            }
        }
    }

    #[test]
    fn log_line_lists_kept_samples() {
        let engine = BenchmarkEngine::new(BenchmarkPolicy::new(3, 2, 2).unwrap());
        let report = engine.run("aget", RunMode::Fail, RunOutcome::ExpectedFailure, |n| {
            let mut r = result(RunOutcome::ExpectedFailure, u64::from(n) * 1000);
            r.mode = RunMode::Fail;
            r
        });
        assert_eq!(
            report.log_line(),
            "aget, fail, 2, 1.500000, 0.707107, 0.500000, 1.000000, 2.000000"
        );

        let dir = TempDir::new().unwrap();
        let log = dir.path().join("benchmark.log");
        report.append_to_log(&log).unwrap();
        report.append_to_log(&log).unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 2);
    }
}
