pub mod benchmark;
pub mod config;
pub mod executor;
pub mod hooks;
pub mod observer;
pub mod oracle;
pub mod program;
pub mod session;
pub mod stats;
pub mod trigger;

pub use benchmark::{BenchmarkEngine, BenchmarkError, BenchmarkPolicy, BenchmarkReport, Retention};
pub use config::{ConfigError, RuntimeConfig, TrigbenchConfig};
pub use executor::{ExitStatus, InfraError, ProcessSupervisor, RawRun, ReadinessProbe};
pub use hooks::{Hook, HookDispatcher, HookRegistry, Stage, SuccessCheck};
pub use observer::{CoreDumpConfig, CoreDumpObserver, DumpDisposal};
pub use oracle::{DefaultOracle, Oracle, OverrideOracle, RunOutcome};
pub use program::{ProgramDescriptor, RunMode};
pub use session::{Session, SessionError};
pub use stats::SampleStatistics;
pub use trigger::{RunResult, Trigger, Workload};
