use crate::executor::{InfraError, RawRun};
use crate::program::executable_name;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const DUMP_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// The kernel truncates `%e` to the task's comm name.
const COMM_NAME_LEN: usize = 15;
const COREDUMP_FILTER_PATH: &str = "/proc/self/coredump_filter";
const CORE_PATTERN_PATH: &str = "/proc/sys/kernel/core_pattern";

#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("Coredump I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid coredump pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ObserverError + '_ {
    move |source| ObserverError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What happens to a crash artifact once a run has been classified.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DumpDisposal {
    #[default]
    Delete,
    /// Move into `<dir>/<program>/`.
    Archive(PathBuf),
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreDumpConfig {
    pub directory: PathBuf,
    /// File name pattern in kernel `core_pattern` syntax.
    pub pattern: String,
    /// Mask written to `/proc/self/coredump_filter` at setup.
    pub filter: Option<u32>,
    /// Upper bound on waiting for the kernel to finish writing a dump.
    pub poll_timeout: Duration,
    pub disposal: DumpDisposal,
    /// Delete matching artifacts found when a scope opens instead of ignoring them.
    pub clear_stale: bool,
}

impl Default for CoreDumpConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp/trigbench-cores"),
            pattern: "core.%e.%p".to_string(),
            filter: None,
            poll_timeout: Duration::from_secs(1),
            disposal: DumpDisposal::Delete,
            clear_stale: false,
        }
    }
}

/// Process-wide coredump preparation. Call once before any run.
///
/// Creates the dump directory and applies the dump size filter to this
/// process, which every child inherits.
pub fn setup(config: &CoreDumpConfig) -> Result<(), ObserverError> {
    info!("Preparing coredump directory {:?}", config.directory);
    fs::create_dir_all(&config.directory).map_err(io_error(&config.directory))?;
    if let Err(e) = fs::set_permissions(&config.directory, fs::Permissions::from_mode(0o777)) {
        warn!("Could not open up permissions of {:?}: {e}", config.directory);
    }

    if let Some(filter) = config.filter {
        debug!("Setting coredump filter to {filter:#x}");
        fs::write(COREDUMP_FILTER_PATH, format!("{filter:#x}"))
            .map_err(io_error(Path::new(COREDUMP_FILTER_PATH)))?;
    }

    check_core_pattern(config);
    Ok(())
}

fn check_core_pattern(config: &CoreDumpConfig) {
    let Ok(current) = fs::read_to_string(CORE_PATTERN_PATH) else {
        return;
    };
    let current = current.trim();
    let wanted = config.directory.join(&config.pattern);
    if Path::new(current) != wanted {
        warn!(
            "kernel.core_pattern is '{current}', dumps may not be detected. Set kernel.core_pattern={}",
            wanted.display()
        );
    }
}

/// Builds an anchored regex for dump file names produced by `executable`.
///
/// `%e` is the executable name, `%E` its path with `/` replaced by `!`, and
/// `%%` a literal percent sign. Any other specifier matches a non-empty run of
/// characters.
pub fn pattern_regex(pattern: &str, executable: &Path) -> Result<Regex, ObserverError> {
    let mut expr = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
            continue;
        }
        match chars.next() {
            Some('e') => {
                let comm: String = executable_name(executable).chars().take(COMM_NAME_LEN).collect();
                expr.push_str(&regex::escape(&comm));
            }
            Some('E') => {
                let path = executable.to_string_lossy().replace('/', "!");
                expr.push_str(&regex::escape(&path));
            }
            Some('%') => expr.push('%'),
            Some(_) => expr.push_str(".+"),
            None => {
                return Err(ObserverError::Pattern {
                    pattern: pattern.to_string(),
                    reason: "dangling '%' at end of pattern".to_string(),
                });
            }
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| ObserverError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Result of observing one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// A new matching artifact appeared during the run.
    pub detected: bool,
    /// Where the artifact lives after disposal, if it was kept.
    pub artifact: Option<PathBuf>,
}

/// Detects crash artifacts written while a run executes.
///
/// The dump directory is owned by one scope at a time, which `&mut self`
/// enforces.
#[derive(Debug)]
pub struct CoreDumpObserver {
    config: CoreDumpConfig,
}

impl CoreDumpObserver {
    pub fn new(config: CoreDumpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CoreDumpConfig {
        &self.config
    }

    /// Snapshots the dump directory. Artifacts already present are excluded
    /// from detection (or deleted when `clear_stale` is set).
    pub fn scope(&mut self, executable: &Path) -> Result<CoreDumpScope<'_>, ObserverError> {
        let matcher = pattern_regex(&self.config.pattern, executable)?;
        let existing = matching_artifacts(&self.config.directory, &matcher)?;
        let mut before = HashSet::new();
        if self.config.clear_stale {
            for stale in existing {
                debug!("Removing stale coredump {stale:?}");
                if let Err(e) = fs::remove_file(&stale) {
                    warn!("Could not remove stale coredump {stale:?}: {e}");
                    before.insert(stale);
                }
            }
        } else {
            before = existing;
        }
        Ok(CoreDumpScope {
            config: &self.config,
            matcher,
            before,
            finished: false,
        })
    }

    /// Runs `run` inside a scope and reports whether it left a crash artifact.
    ///
    /// Signal-terminated runs get a bounded wait for the kernel to write the
    /// dump; other runs are checked once. Only a failure to open the scope is
    /// returned as an error. Failures after the run keep its status and
    /// duration and attach [`InfraError::Observer`] to it.
    pub fn observe<F>(
        &mut self,
        program: &str,
        executable: &Path,
        run: F,
    ) -> Result<(RawRun, Observation), ObserverError>
    where
        F: FnOnce() -> RawRun,
    {
        let scope = self.scope(executable)?;
        let mut raw = run();
        let abnormal = raw.is_signaled()
            || raw
                .status
                .and_then(|status| status.code())
                .is_some_and(|code| code > 128);
        let observation = match scope
            .detect(abnormal)
            .and_then(|found| scope.consume(program, found))
        {
            Ok(observation) => observation,
            Err(e) => {
                warn!("Coredump observation of '{program}' failed: {e}");
                if raw.infra.is_some() {
                    raw.cleanup_errors.push(e.to_string());
                } else {
                    raw.infra = Some(InfraError::Observer(e.to_string()));
                }
                Observation::default()
            }
        };
        Ok((raw, observation))
    }
}

/// Snapshot of the dump directory taken before a run.
///
/// Dropping an unfinished scope (for example while unwinding from a panic)
/// disposes of whatever appeared during it, so the next run starts quiesced.
pub struct CoreDumpScope<'a> {
    config: &'a CoreDumpConfig,
    matcher: Regex,
    before: HashSet<PathBuf>,
    finished: bool,
}

impl CoreDumpScope<'_> {
    fn matching(&self) -> Result<HashSet<PathBuf>, ObserverError> {
        matching_artifacts(&self.config.directory, &self.matcher)
    }

    /// Matching artifacts that were not in the snapshot, sorted by path.
    pub fn new_artifacts(&self) -> Result<Vec<PathBuf>, ObserverError> {
        let mut fresh: Vec<PathBuf> = self
            .matching()?
            .into_iter()
            .filter(|path| !self.before.contains(path))
            .collect();
        fresh.sort();
        Ok(fresh)
    }

    /// Looks for new artifacts, polling up to the configured timeout when `wait` is set.
    pub fn detect(&self, wait: bool) -> Result<Vec<PathBuf>, ObserverError> {
        let deadline = Instant::now() + self.config.poll_timeout;
        loop {
            let fresh = self.new_artifacts()?;
            if !fresh.is_empty() {
                self.settle(&fresh[0], deadline);
                return Ok(fresh);
            }
            if !wait || Instant::now() >= deadline {
                return Ok(fresh);
            }
            std::thread::sleep(DUMP_POLL_INTERVAL);
        }
    }

    /// Waits until the dump stops growing or the deadline passes.
    fn settle(&self, path: &Path, deadline: Instant) {
        let mut last = fs::metadata(path).map(|m| m.len()).ok();
        while Instant::now() < deadline {
            std::thread::sleep(DUMP_POLL_INTERVAL);
            let size = fs::metadata(path).map(|m| m.len()).ok();
            if size == last {
                return;
            }
            last = size;
        }
    }

    /// Applies the disposal policy to `found` and closes the scope.
    pub fn consume(
        mut self,
        program: &str,
        found: Vec<PathBuf>,
    ) -> Result<Observation, ObserverError> {
        self.finished = true;
        let mut observation = Observation {
            detected: !found.is_empty(),
            artifact: None,
        };
        for (index, path) in found.iter().enumerate() {
            info!("Coredump detected at {path:?}");
            let kept = dispose(&self.config.disposal, program, path)?;
            if index == 0 {
                observation.artifact = kept;
            }
        }
        Ok(observation)
    }
}

impl Drop for CoreDumpScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.new_artifacts() {
            Ok(fresh) => {
                for path in fresh {
                    if let Err(e) = dispose(&self.config.disposal, "unfinished", &path) {
                        warn!("Could not dispose of coredump {path:?}: {e}");
                    }
                }
            }
            Err(e) => warn!("Could not sweep coredump directory: {e}"),
        }
    }
}

fn matching_artifacts(dir: &Path, matcher: &Regex) -> Result<HashSet<PathBuf>, ObserverError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(io_error(dir)(e)),
    };
    let mut found = HashSet::new();
    for entry in entries {
        let entry = entry.map_err(io_error(dir))?;
        let name = entry.file_name();
        if name.to_str().is_some_and(|name| matcher.is_match(name)) {
            found.insert(entry.path());
        }
    }
    Ok(found)
}

fn dispose(
    disposal: &DumpDisposal,
    program: &str,
    path: &Path,
) -> Result<Option<PathBuf>, ObserverError> {
    match disposal {
        DumpDisposal::Delete => {
            fs::remove_file(path).map_err(io_error(path))?;
            debug!("Deleted coredump {path:?}");
            Ok(None)
        }
        DumpDisposal::Keep => Ok(Some(path.to_path_buf())),
        DumpDisposal::Archive(dir) => {
            let destination_dir = dir.join(program);
            fs::create_dir_all(&destination_dir).map_err(io_error(&destination_dir))?;
            let destination = destination_dir.join(path.file_name().unwrap_or_default());
            if fs::rename(path, &destination).is_err() {
                fs::copy(path, &destination).map_err(io_error(&destination))?;
                fs::remove_file(path).map_err(io_error(path))?;
            }
            info!("Archived coredump to {destination:?}");
            Ok(Some(destination))
        }
    }
}
