use std::fs;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use trigbench_core::benchmark::{BenchmarkError, Termination};
use trigbench_core::config::TrigbenchConfig;
use trigbench_core::executor::{ExitStatus, InfraError};
use trigbench_core::hooks::{FnHook, HookRegistry, OutcomeCheck, Stage};
use trigbench_core::oracle::RunOutcome;
use trigbench_core::program::RunMode;
use trigbench_core::session::{Session, SessionError};

/// Builds a config rooted in `dir`: dumps go to `dir/cores`, programs run in `dir`.
fn config_in(dir: &TempDir, benchmark: &str, programs: &str) -> TrigbenchConfig {
    let root = dir.path().display();
    let toml = format!(
        r#"
[coredump]
directory = "{root}/cores"
poll-timeout-ms = 500

[benchmark]
{benchmark}

{programs}
"#
    )
    .replace("@ROOT@", &root.to_string());
    toml.parse().unwrap()
}

fn session(dir: &TempDir, benchmark: &str, programs: &str) -> Session {
    Session::from_config(config_in(dir, benchmark, programs).validate().unwrap()).unwrap()
}

const COMPRESSOR: &str = r#"
[[programs]]
name = "compressor"
executable = "compressor"
working-dir = "@ROOT@"
success-cmd = ["sh", "-c", "head -c 1024 /dev/zero > input && cksum input > input.sum"]
failure-cmd = ["sh", "-c", "touch cores/core.compressor.$$; kill -SEGV $$"]
signature = { signal = 11 }
"#;

#[test]
fn clean_success_run_is_success() {
    let dir = TempDir::new().unwrap();
    let mut session = session(&dir, "", COMPRESSOR);

    let result = session.trigger("compressor", RunMode::Success).unwrap();
    assert_eq!(result.status, Some(ExitStatus::Code(0)));
    assert!(!result.coredump);
    assert_eq!(result.outcome, RunOutcome::Success);
    assert!(dir.path().join("input.sum").exists());
}

#[test]
fn segfault_with_dump_from_failure_command_is_expected_failure() {
    let dir = TempDir::new().unwrap();
    let mut session = session(&dir, "", COMPRESSOR);

    let result = session.trigger("compressor", RunMode::Fail).unwrap();
    assert_eq!(result.status, Some(ExitStatus::Signal(11)));
    assert!(result.coredump);
    assert_eq!(result.outcome, RunOutcome::ExpectedFailure);

    // The artifact is consumed, so a second run starts from a quiet directory.
    let leftovers = fs::read_dir(dir.path().join("cores")).unwrap().count();
    assert_eq!(leftovers, 0);
    let again = session.trigger("compressor", RunMode::Fail).unwrap();
    assert_eq!(again.outcome, RunOutcome::ExpectedFailure);
}

#[test]
fn benchmark_discards_infra_errors_and_keeps_trailing_window() {
    let dir = TempDir::new().unwrap();
    // Attempts 3 and 9 fail without a dump, which classifies as an infra error.
    let programs = r#"
[[programs]]
name = "flaky"
executable = "flaky"
working-dir = "@ROOT@"
success-cmd = ["sh", "-c", "n=$(cat n 2>/dev/null || echo 0); n=$((n+1)); echo $n > n; [ $n -ne 3 ] && [ $n -ne 9 ]"]
"#;
    let mut session = session(
        &dir,
        "maximum-tries = 100\nwanted-results = 20\nkept-runs = 10\nlog = \"@ROOT@/bench.log\"",
        programs,
    );

    let report = session.benchmark("flaky", RunMode::Success).unwrap();
    assert_eq!(report.termination, Termination::Completed);
    assert_eq!(report.collected, 20);
    assert_eq!(report.discarded, 2);
    assert_eq!(report.attempts, 22);
    assert_eq!(report.kept.len(), 10);
    let kept_attempts: Vec<u32> = report
        .attempt_log
        .iter()
        .filter(|a| a.accepted)
        .map(|a| a.attempt)
        .skip(10)
        .collect();
    assert_eq!(kept_attempts, (13..=22).collect::<Vec<_>>());
    let kept_durations: Vec<_> = report
        .attempt_log
        .iter()
        .filter(|a| kept_attempts.contains(&a.attempt))
        .map(|a| a.duration)
        .collect();
    assert_eq!(report.kept, kept_durations);

    let log = fs::read_to_string(dir.path().join("bench.log")).unwrap();
    assert!(log.starts_with("flaky, success, 10, "));
}

#[test]
fn benchmark_of_always_failing_infra_is_exhausted() {
    let dir = TempDir::new().unwrap();
    let programs = r#"
[[programs]]
name = "broken"
executable = "broken"
success-cmd = ["sh", "-c", "exit 3"]
"#;
    let mut session = session(
        &dir,
        "maximum-tries = 100\nwanted-results = 20\nkept-runs = 10",
        programs,
    );

    match session.benchmark("broken", RunMode::Success) {
        Err(SessionError::Benchmark(BenchmarkError::Exhausted(report))) => {
            assert_eq!(report.attempts, 100);
            assert_eq!(report.collected, 0);
            assert!(report.kept.is_empty());
            assert!(
                report
                    .attempt_log
                    .iter()
                    .all(|a| a.outcome == RunOutcome::InfraError)
            );
        }
        other => panic!("Expected exhaustion, got {other:?}"),
    }
}

#[test]
fn server_never_ready_skips_client_and_still_stops() {
    let dir = TempDir::new().unwrap();
    let programs = r#"
[[programs]]
name = "server"
executable = "server"
working-dir = "@ROOT@"
start-cmd = ["sh", "-c", "sleep 10"]
stop-cmd = ["sh", "-c", "echo stop >> events"]
client-cmd = ["sh", "-c", "echo client >> events"]
readiness = { probe = "log-marker", path = "@ROOT@/server.log", marker = "listening" }
ready-timeout-ms = 300
grace-period-ms = 200
"#;
    let mut session = session(&dir, "", programs);

    let result = session.trigger("server", RunMode::Fail).unwrap();
    assert_eq!(result.outcome, RunOutcome::InfraError);
    assert!(matches!(result.infra, Some(InfraError::NotReady(_))));

    let events = fs::read_to_string(dir.path().join("events")).unwrap();
    assert_eq!(events.lines().collect::<Vec<_>>(), vec!["stop"]);
}

#[test]
fn cleanup_stages_run_once_for_timed_out_runs() {
    let dir = TempDir::new().unwrap();
    let programs = r#"
[[programs]]
name = "hang"
executable = "hang"
success-cmd = ["sh", "-c", "sleep 10"]
timeout-ms = 100
"#;
    let config = config_in(&dir, "", programs).validate().unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HookRegistry::new();
    registry.set_check(OutcomeCheck).unwrap();
    for stage in [Stage::PostTriggerRun, Stage::AfterRun] {
        let events = Arc::clone(&events);
        registry
            .register(
                stage,
                FnHook::new("record", move |stage, ctx| {
                    let outcome = ctx.result.map(|r| r.outcome);
                    events.lock().unwrap().push((stage, outcome));
                    Ok(())
                }),
            )
            .unwrap();
    }
    let mut session = Session::initialize(config, registry).unwrap();

    let result = session.trigger("hang", RunMode::Success).unwrap();
    assert!(matches!(result.infra, Some(InfraError::Timeout { .. })));
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (Stage::PostTriggerRun, Some(RunOutcome::InfraError)),
            (Stage::AfterRun, Some(RunOutcome::InfraError)),
        ]
    );
}

#[test]
fn missing_check_fails_before_any_run() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, "", COMPRESSOR).validate().unwrap();
    let result = Session::initialize(config, HookRegistry::new());
    assert!(matches!(result, Err(SessionError::Config(_))));
    assert!(!dir.path().join("input.sum").exists());
}

#[test]
fn pre_trigger_hook_records_under_a_wrapper() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, "", COMPRESSOR).validate().unwrap();

    let mut registry = HookRegistry::new();
    registry.set_check(OutcomeCheck).unwrap();
    let marker = dir.path().join("recorded");
    registry
        .register(
            Stage::PreTriggerRun,
            FnHook::new("record", move |_, ctx| {
                let script = format!("touch {}; exec \"$@\"", marker.display());
                ctx.wrapper
                    .extend(["sh".to_string(), "-c".to_string(), script, "record".to_string()]);
                Ok(())
            }),
        )
        .unwrap();
    let mut session = Session::initialize(config, registry).unwrap();

    let result = session.trigger("compressor", RunMode::Success).unwrap();
    assert_eq!(result.outcome, RunOutcome::Success);
    assert!(dir.path().join("recorded").exists());
    assert!(dir.path().join("input.sum").exists());
}
