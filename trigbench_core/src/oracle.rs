use crate::executor::RawRun;
use crate::program::{BugSignature, RunMode};
use serde::Serialize;
use std::fmt;

/// Classification of one executed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Success,
    ExpectedFailure,
    UnexpectedCrash,
    InfraError,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::ExpectedFailure => "expected-failure",
            RunOutcome::UnexpectedCrash => "unexpected-crash",
            RunOutcome::InfraError => "infra-error",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome a mode is trying to produce.
pub fn target_outcome(mode: RunMode) -> RunOutcome {
    match mode {
        RunMode::Success => RunOutcome::Success,
        RunMode::Fail => RunOutcome::ExpectedFailure,
    }
}

/// Decides what a supervised run means.
///
/// Implementations must be pure: the same `(raw, coredump, mode)` always maps
/// to the same outcome.
pub trait Oracle: Send + Sync {
    fn classify(&self, raw: &RawRun, coredump: bool, mode: RunMode) -> RunOutcome;
}

/// Classification shared by every program unless it brings its own rule.
///
/// A crash is a signal-terminated run, or an exit with the code the bug
/// signature declares. With a crash artifact present it is the expected bug
/// only when the failure command ran and the signature matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOracle {
    signature: BugSignature,
}

impl DefaultOracle {
    pub fn new(signature: Option<BugSignature>) -> Self {
        Self {
            signature: signature.unwrap_or_default(),
        }
    }
}

impl Oracle for DefaultOracle {
    fn classify(&self, raw: &RawRun, coredump: bool, mode: RunMode) -> RunOutcome {
        if raw.infra.is_some() {
            return RunOutcome::InfraError;
        }
        let Some(status) = raw.status else {
            return RunOutcome::InfraError;
        };

        match (coredump, status.is_success()) {
            (true, _) if mode == RunMode::Fail && self.signature.matches(&status) => {
                RunOutcome::ExpectedFailure
            }
            // A dump with any other exit means something crashed that we did not ask for.
            (true, _) => RunOutcome::UnexpectedCrash,
            (false, true) => RunOutcome::Success,
            (false, false) => RunOutcome::InfraError,
        }
    }
}

/// Program-specific rule consulted before the default classification.
///
/// Returning `None` defers to the default.
pub type ClassifyRule = fn(&RawRun, bool, RunMode) -> Option<RunOutcome>;

#[derive(Debug, Clone, Copy)]
pub struct OverrideOracle {
    rule: ClassifyRule,
    fallback: DefaultOracle,
}

impl OverrideOracle {
    pub fn new(rule: ClassifyRule, signature: Option<BugSignature>) -> Self {
        Self {
            rule,
            fallback: DefaultOracle::new(signature),
        }
    }
}

impl Oracle for OverrideOracle {
    fn classify(&self, raw: &RawRun, coredump: bool, mode: RunMode) -> RunOutcome {
        (self.rule)(raw, coredump, mode).unwrap_or_else(|| self.fallback.classify(raw, coredump, mode))
    }
}
