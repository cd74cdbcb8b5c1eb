//! Isolated execution strategy.
//!
//! Wraps the command in the external isolation binary. The box identifier
//! derives from the running process id modulo a fixed pool size, which
//! bounds (but does not eliminate) collisions between concurrently running
//! isolated jobs on one host; that trade-off belongs to the external tool.
//!
//! Working-directory files are copied into the box, the privilege-fixup
//! companion adjusts ownership, the program runs under CPU/wall/memory
//! limits, results are copied back, and the machine-readable meta file is
//! folded into the report. Every tool invocation carries its own hard
//! timeout; exceeding it is a fatal setup error, unlike the sandboxed
//! program's own timeout. Cleanup is attempted on every exit path.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

use super::direct::WALL_FACTOR;
use super::watchdog::{isolate_process_group, split_status, wait_with_deadline};
use super::{ExecError, ExecRequest, ExecutionReport, Executor, KILL_SIGNAL};
use crate::config::GraderConfig;

/// Size of the box identifier pool
const BOX_POOL: u32 = 100;

/// True when both the isolation binary and its privilege-fixup companion
/// are present and executable.
pub(super) fn isolation_available(config: &GraderConfig) -> bool {
    is_executable(&config.isolate_bin) && is_executable(&config.rights_bin)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Parsed isolation meta file
#[derive(Debug, Default, PartialEq)]
pub(super) struct IsolateMeta {
    pub time_ms: u64,
    pub wall_ms: u64,
    pub memory_kb: u64,
    pub exit_code: Option<i32>,
    pub exit_sig: Option<i32>,
    pub killed: bool,
    pub status: Option<String>,
}

/// Parse the `key:value` lines of the isolation meta file.
pub(super) fn parse_meta(text: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "time" => meta.time_ms = seconds_to_ms(value),
            "time-wall" => meta.wall_ms = seconds_to_ms(value),
            "max-rss" | "cg-mem" => meta.memory_kb = value.parse().unwrap_or(0),
            "exitcode" => meta.exit_code = value.parse().ok(),
            "exitsig" => meta.exit_sig = value.parse().ok(),
            "killed" => meta.killed = value != "0",
            "status" => meta.status = Some(value.to_string()),
            _ => {}
        }
    }
    meta
}

fn seconds_to_ms(value: &str) -> u64 {
    value
        .parse::<f64>()
        .map(|s| (s * 1000.0).round() as u64)
        .unwrap_or(0)
}

pub(super) fn run(
    executor: &Executor<'_>,
    req: &ExecRequest<'_>,
) -> Result<ExecutionReport, ExecError> {
    let config = executor.config();
    let box_id = std::process::id() % BOX_POOL;
    let session = BoxSession {
        config,
        box_id,
        cg: config.control_groups,
    };

    // Run with guaranteed cleanup, even when setup fails midway.
    let result = run_in_box(executor, req, &session);
    session.cleanup();
    result
}

fn run_in_box(
    executor: &Executor<'_>,
    req: &ExecRequest<'_>,
    session: &BoxSession<'_>,
) -> Result<ExecutionReport, ExecError> {
    let mut report = executor.base_report(req);
    let transform = executor.transform(req);
    let config = executor.config();

    let box_dir = session.init()?;
    debug!(box_id = session.box_id, box_dir = %box_dir.display(), "isolation box initialized");

    // Stage the working directory inside the box
    copy_tree(req.working_dir, &box_dir)?;
    session.fix_rights(&box_dir)?;

    let meta_path = req.working_dir.join("isolate.meta");
    let stdout_name = req
        .stdout_file
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stdout.out".to_string());

    let time_secs = report.realized_time_limit_ms as f64 / 1000.0;
    let wall_secs = time_secs * WALL_FACTOR as f64;

    let mut argv: Vec<String> = vec![
        config.isolate_bin.display().to_string(),
        format!("--box-id={}", session.box_id),
    ];
    if session.cg {
        argv.push("--cg".to_string());
        argv.push("--cg-timing".to_string());
        argv.push(format!("--cg-mem={}", report.realized_memory_limit_kb));
    } else {
        argv.push(format!("--mem={}", report.realized_memory_limit_kb));
    }
    argv.push(format!("--time={time_secs:.3}"));
    argv.push(format!("--wall-time={wall_secs:.3}"));
    argv.push("--processes".to_string());
    argv.push(format!("--meta={}", meta_path.display()));
    if let Some(stdin) = req.stdin_file {
        let name = stdin
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ExecError::Isolation {
                step: "run".to_string(),
                detail: format!("stdin path has no file name: {}", stdin.display()),
            })?;
        // The stdin file was staged with the rest of the working directory
        argv.push(format!("--stdin={name}"));
    }
    argv.push(format!("--stdout={stdout_name}"));
    argv.push("--stderr=stderr.out".to_string());
    argv.push("--run".to_string());
    argv.push("--".to_string());
    argv.extend(req.command.iter().cloned());

    // The run call's own hard timeout leaves room for the sandbox to
    // enforce its wall limit first.
    let run_timeout = Duration::from_secs(config.tool_timeout_secs)
        + Duration::from_millis(report.realized_time_limit_ms.saturating_mul(WALL_FACTOR));
    session.invoke("run", &argv, run_timeout)?;

    // Bring produced files (and the redirected streams) back out
    copy_tree(&box_dir, req.working_dir)?;

    let meta_text = fs::read_to_string(&meta_path).unwrap_or_default();
    let meta = parse_meta(&meta_text);

    report.time_taken_ms = transform.untransform_time(meta.time_ms);
    report.real_time_taken_ms = meta.wall_ms;
    report.memory_used_kb = meta.memory_kb;
    report.exit_code = meta.exit_code.unwrap_or(0);
    report.exit_sig = meta.exit_sig;
    // "TO" is the sandbox's own timeout verdict
    let timed_out = meta.status.as_deref() == Some("TO");
    if meta.killed || timed_out {
        report.was_killed = true;
        report.exit_sig = Some(KILL_SIGNAL);
        if report.exit_code == 0 {
            report.exit_code = KILL_SIGNAL;
        }
    } else if let Some(sig) = meta.exit_sig {
        report.exit_code = 128 + sig;
    }

    let stdout_path = req
        .stdout_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| req.working_dir.join("stdout.out"));
    let stderr_path = req.working_dir.join("stderr.out");
    executor.capture_outputs(&mut report, req, &stdout_path, &stderr_path)?;
    Ok(report)
}

/// One allocated box of the isolation tool.
struct BoxSession<'a> {
    config: &'a GraderConfig,
    box_id: u32,
    cg: bool,
}

impl BoxSession<'_> {
    fn base_argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.config.isolate_bin.display().to_string(),
            format!("--box-id={}", self.box_id),
        ];
        if self.cg {
            argv.push("--cg".to_string());
        }
        argv
    }

    /// Initialize the box and return its file area.
    fn init(&self) -> Result<PathBuf, ExecError> {
        let mut argv = self.base_argv();
        argv.push("--init".to_string());
        let stdout = self.invoke("init", &argv, self.tool_timeout())?;
        let root = stdout.trim().lines().last().unwrap_or("").to_string();
        if root.is_empty() {
            return Err(ExecError::Isolation {
                step: "init".to_string(),
                detail: "isolation tool reported no box directory".to_string(),
            });
        }
        Ok(PathBuf::from(root).join("box"))
    }

    /// Run the privilege-fixup companion over the box files.
    fn fix_rights(&self, box_dir: &Path) -> Result<(), ExecError> {
        let argv = vec![
            self.config.rights_bin.display().to_string(),
            box_dir.display().to_string(),
        ];
        self.invoke("rights-fix", &argv, self.tool_timeout())?;
        Ok(())
    }

    /// Tear the box down. Failures are logged, not propagated: cleanup
    /// runs on error paths where the original error matters more.
    fn cleanup(&self) {
        let mut argv = self.base_argv();
        argv.push("--cleanup".to_string());
        if let Err(err) = self.invoke("cleanup", &argv, self.tool_timeout()) {
            tracing::warn!(box_id = self.box_id, error = %err, "isolation cleanup failed");
        }
    }

    fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tool_timeout_secs)
    }

    /// Invoke one isolation-tool step under its own hard timeout.
    ///
    /// The `run` step tolerates non-zero exits (the sandbox reports the
    /// graded program's failure that way); other steps treat them as setup
    /// errors.
    fn invoke(&self, step: &str, argv: &[String], timeout: Duration) -> Result<String, ExecError> {
        let (program, args) = argv.split_first().ok_or_else(|| ExecError::Isolation {
            step: step.to_string(),
            detail: "empty command".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ExecError::SpawnFailed {
            command: argv.join(" "),
            source,
        })?;
        let outcome = wait_with_deadline(&mut child, timeout)?;
        if outcome.killed {
            return Err(ExecError::IsolationHung {
                step: step.to_string(),
                timeout,
            });
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            use std::io::Read;
            let _ = pipe.read_to_string(&mut stdout);
        }
        if let Some(mut pipe) = child.stderr.take() {
            use std::io::Read;
            let _ = pipe.read_to_string(&mut stderr);
        }

        let (code, _) = split_status(outcome.status);
        if code != 0 && step != "run" {
            return Err(ExecError::Isolation {
                step: step.to_string(),
                detail: format!("exit code {code}: {}", stderr.trim()),
            });
        }
        Ok(stdout)
    }
}

/// Copy the regular files of `src` into `dest`, replacing symlinked
/// destinations instead of writing through them (a cached artifact must
/// never be modified via a restored link).
fn copy_tree(src: &Path, dest: &Path) -> Result<(), ExecError> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let target = dest.join(entry.file_name());
        if target.symlink_metadata().is_ok() {
            fs::remove_file(&target)?;
        }
        fs::copy(entry.path(), &target)?;
    }
    Ok(())
}
