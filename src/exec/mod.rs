//! Sandboxed execution engine.
//!
//! Runs one external command under resource limits and produces an
//! [`ExecutionReport`]. A graded program's own non-zero exit or timeout
//! never raises; only environment and setup failures do.
//!
//! Two strategies:
//! - [direct](Executor::run_direct): unconfined, wall-clock kill only
//! - [isolated](Executor::run_isolated): the external isolation binary with
//!   CPU/wall/memory enforcement, degrading to direct when the binary or
//!   its privilege-fixup companion is unusable

mod direct;
mod isolate;
pub(crate) mod watchdog;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{GraderConfig, LimitTransform};
use crate::files::{capture_file, Capture};
use crate::lang::Language;
use crate::limits::ExecutionLimits;

/// Exit-signal value reported for a limit-enforced kill
pub const KILL_SIGNAL: i32 = 137;

/// Errors from execution setup. None of these describe a graded program's
/// own failure; that lives in the report.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("time limit {requested}ms exceeds configured maximum {max}ms")]
    TimeLimitTooHigh { requested: u64, max: u64 },

    #[error("memory limit {requested}kB exceeds configured maximum {max}kB")]
    MemoryLimitTooHigh { requested: u64, max: u64 },

    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("isolation step `{step}` exceeded its hard timeout of {timeout:?}")]
    IsolationHung { step: String, timeout: Duration },

    #[error("isolation step `{step}` failed: {detail}")]
    Isolation { step: String, detail: String },

    #[error("bad output glob `{0}`")]
    BadGlob(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Report of one compile or run step, cached alongside produced files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// Requested CPU time limit, in task units
    pub time_limit_ms: u64,

    /// Requested memory limit
    pub memory_limit_kb: u64,

    /// Enforced time limit after the language transform
    pub realized_time_limit_ms: u64,

    /// Enforced memory limit after the language transform
    pub realized_memory_limit_kb: u64,

    /// Whether this report was served from cache
    pub was_cached: bool,

    /// The executed command line
    pub command_line: String,

    /// CPU time consumed, un-transformed back to task units
    pub time_taken_ms: u64,

    /// Wall-clock time consumed
    pub real_time_taken_ms: u64,

    /// Whether a limit kill terminated the program
    pub was_killed: bool,

    /// Exit code (128+signal for signaled exits)
    pub exit_code: i32,

    /// Terminating signal, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_sig: Option<i32>,

    /// Peak memory, kilobytes (0 when the strategy cannot measure it)
    pub memory_used_kb: u64,

    pub stdout: Capture,
    pub stderr: Capture,

    /// Captured working-directory files matching the `getFiles` globs
    pub files: Vec<Capture>,
}

impl ExecutionReport {
    /// A zero-cost success report for steps performed in-process (script
    /// assembly for interpreted languages).
    pub fn synthetic(limits: &ExecutionLimits, command_line: &str) -> Self {
        Self {
            time_limit_ms: limits.time_limit_ms,
            memory_limit_kb: limits.memory_limit_kb,
            realized_time_limit_ms: limits.time_limit_ms,
            realized_memory_limit_kb: limits.memory_limit_kb,
            was_cached: false,
            command_line: command_line.to_string(),
            time_taken_ms: 0,
            real_time_taken_ms: 0,
            was_killed: false,
            exit_code: 0,
            exit_sig: None,
            memory_used_kb: 0,
            stdout: Capture::empty("stdout"),
            stderr: Capture::empty("stderr"),
            files: Vec::new(),
        }
    }

    /// True when the program ran to completion with exit code 0.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.was_killed
    }
}

/// One execution request.
#[derive(Debug)]
pub struct ExecRequest<'a> {
    /// Argv; the first element is the executable (relative paths resolve
    /// against the working directory)
    pub command: &'a [String],

    /// Scoped working directory; all side effects stay inside it
    pub working_dir: &'a Path,

    pub limits: &'a ExecutionLimits,

    /// Language of the program, for limit transforms
    pub language: Option<Language>,

    /// File fed to the program's stdin (must live in the working directory)
    pub stdin_file: Option<&'a Path>,

    /// Where stdout is written; defaults to `stdout.out` in the working
    /// directory
    pub stdout_file: Option<&'a Path>,
}

impl<'a> ExecRequest<'a> {
    pub fn new(command: &'a [String], working_dir: &'a Path, limits: &'a ExecutionLimits) -> Self {
        Self {
            command,
            working_dir,
            limits,
            language: None,
            stdin_file: None,
            stdout_file: None,
        }
    }

    pub fn language(mut self, language: Option<Language>) -> Self {
        self.language = language;
        self
    }

    pub fn stdin_file(mut self, path: Option<&'a Path>) -> Self {
        self.stdin_file = path;
        self
    }

    pub fn stdout_file(mut self, path: Option<&'a Path>) -> Self {
        self.stdout_file = path;
        self
    }

    fn command_line(&self) -> String {
        self.command.join(" ")
    }

    fn stdout_path(&self) -> PathBuf {
        self.stdout_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.working_dir.join("stdout.out"))
    }

    fn stderr_path(&self) -> PathBuf {
        self.working_dir.join("stderr.out")
    }
}

/// The execution engine front: validates limits, applies transforms, picks
/// the strategy, and assembles the report.
pub struct Executor<'a> {
    config: &'a GraderConfig,
}

impl<'a> Executor<'a> {
    pub fn new(config: &'a GraderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GraderConfig {
        self.config
    }

    /// Run unconfined (compilation and other trusted steps).
    pub fn run_direct(&self, req: &ExecRequest<'_>) -> Result<ExecutionReport, ExecError> {
        req.limits.validate(self.config)?;
        direct::run(self, req)
    }

    /// Run inside the isolation tool, degrading to the direct strategy
    /// when the tool is unusable on this host.
    pub fn run_isolated(&self, req: &ExecRequest<'_>) -> Result<ExecutionReport, ExecError> {
        req.limits.validate(self.config)?;
        if isolate::isolation_available(self.config) {
            isolate::run(self, req)
        } else {
            tracing::warn!(
                isolate = %self.config.isolate_bin.display(),
                rights = %self.config.rights_bin.display(),
                "isolation tool unavailable, degrading to direct execution"
            );
            direct::run(self, req)
        }
    }

    fn transform(&self, req: &ExecRequest<'_>) -> LimitTransform {
        self.config.transform_for(req.language)
    }

    /// Report skeleton with requested and realized limits filled in.
    fn base_report(&self, req: &ExecRequest<'_>) -> ExecutionReport {
        let transform = self.transform(req);
        ExecutionReport {
            time_limit_ms: req.limits.time_limit_ms,
            memory_limit_kb: req.limits.memory_limit_kb,
            realized_time_limit_ms: transform.transform_time(req.limits.time_limit_ms),
            realized_memory_limit_kb: transform.transform_memory(req.limits.memory_limit_kb),
            was_cached: false,
            command_line: req.command_line(),
            time_taken_ms: 0,
            real_time_taken_ms: 0,
            was_killed: false,
            exit_code: -1,
            exit_sig: None,
            memory_used_kb: 0,
            stdout: Capture::empty("stdout"),
            stderr: Capture::empty("stderr"),
            files: Vec::new(),
        }
    }

    /// Capture stdout, stderr and the requested working-directory files
    /// into the report.
    fn capture_outputs(
        &self,
        report: &mut ExecutionReport,
        req: &ExecRequest<'_>,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<(), ExecError> {
        report.stdout = if stdout_path.exists() {
            capture_file(stdout_path, "stdout", req.limits.stdout_truncate_kb)?
        } else {
            Capture::empty("stdout")
        };
        report.stderr = if stderr_path.exists() {
            capture_file(stderr_path, "stderr", req.limits.stderr_truncate_kb)?
        } else {
            Capture::empty("stderr")
        };
        report.files = self.capture_globs(req.working_dir, &req.limits.get_files)?;
        Ok(())
    }

    /// Capture files in `dir` matching the globs, sorted by name for
    /// reproducible reports.
    fn capture_globs(&self, dir: &Path, globs: &[String]) -> Result<Vec<Capture>, ExecError> {
        if globs.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = GlobSetBuilder::new();
        for glob in globs {
            builder.add(Glob::new(glob).map_err(|_| ExecError::BadGlob(glob.clone()))?);
        }
        let set = builder
            .build()
            .map_err(|_| ExecError::BadGlob(globs.join(",")))?;

        let mut names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if set.is_match(&name) && entry.path().is_file() {
                names.push(name);
            }
        }
        names.sort();

        let truncate_kb = self.config.max_capture_kb as i64;
        let mut captures = Vec::with_capacity(names.len());
        for name in names {
            captures.push(capture_file(&dir.join(&name), &name, truncate_kb)?);
        }
        Ok(captures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn report_round_trips_through_json() {
        let report = ExecutionReport::synthetic(&ExecutionLimits::default(), "gcc -o x x.c");
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"wasCached\":false"));
        assert!(json.contains("\"commandLine\""));
        let back: ExecutionReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn limits_are_validated_before_running() {
        let config = GraderConfig::default();
        let executor = Executor::new(&config);
        let temp = TempDir::new().unwrap();
        let command = sh("true");
        let limits = ExecutionLimits {
            time_limit_ms: config.max_time_limit_ms + 1,
            ..Default::default()
        };
        let req = ExecRequest::new(&command, temp.path(), &limits);
        assert!(matches!(
            executor.run_direct(&req),
            Err(ExecError::TimeLimitTooHigh { .. })
        ));
    }

    #[test]
    fn glob_capture_is_sorted_and_filtered() {
        let config = GraderConfig::default();
        let executor = Executor::new(&config);
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b.out"), "b").unwrap();
        fs::write(temp.path().join("a.out"), "a").unwrap();
        fs::write(temp.path().join("skip.txt"), "no").unwrap();

        let captures = executor
            .capture_globs(temp.path(), &["*.out".to_string()])
            .unwrap();
        let names: Vec<&str> = captures.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a.out", "b.out"]);
    }
}
