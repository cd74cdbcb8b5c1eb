//! Direct (unconfined) execution strategy.
//!
//! Spawns the command inside the scoped working directory with
//! stdin/stdout/stderr redirected to files. The only enforcement is a hard
//! wall-clock kill of the process group at 3x the (transformed) time limit;
//! memory usage is not measured.

use std::fs::File;
use std::process::{Command, Stdio};

use super::watchdog::{isolate_process_group, split_status, wait_with_deadline};
use super::{ExecError, ExecRequest, ExecutionReport, Executor, KILL_SIGNAL};

/// Wall-clock allowance as a multiple of the CPU time limit
pub(super) const WALL_FACTOR: u64 = 3;

pub(super) fn run(
    executor: &Executor<'_>,
    req: &ExecRequest<'_>,
) -> Result<ExecutionReport, ExecError> {
    let mut report = executor.base_report(req);
    let transform = executor.transform(req);

    let stdout_path = req.stdout_path();
    let stderr_path = req.stderr_path();

    let (program, args) = req
        .command
        .split_first()
        .ok_or_else(|| ExecError::Isolation {
            step: "spawn".to_string(),
            detail: "empty command line".to_string(),
        })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(req.working_dir)
        .stdout(File::create(&stdout_path)?)
        .stderr(File::create(&stderr_path)?);
    match req.stdin_file {
        Some(path) => {
            cmd.stdin(File::open(path)?);
        }
        None => {
            cmd.stdin(Stdio::null());
        }
    }
    isolate_process_group(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| ExecError::SpawnFailed {
        command: report.command_line.clone(),
        source,
    })?;

    let wall_limit_ms = report.realized_time_limit_ms.saturating_mul(WALL_FACTOR);
    let outcome = wait_with_deadline(
        &mut child,
        std::time::Duration::from_millis(wall_limit_ms),
    )?;

    let wall_ms = outcome.wall.as_millis() as u64;
    report.real_time_taken_ms = wall_ms;
    // No CPU accounting in this strategy; wall time stands in, mapped back
    // to task units.
    report.time_taken_ms = transform.untransform_time(wall_ms);
    report.memory_used_kb = 0;

    if outcome.killed {
        report.was_killed = true;
        report.exit_code = KILL_SIGNAL;
        report.exit_sig = Some(KILL_SIGNAL);
    } else {
        let (code, sig) = split_status(outcome.status);
        report.exit_code = code;
        report.exit_sig = sig;
    }

    executor.capture_outputs(&mut report, req, &stdout_path, &stderr_path)?;
    Ok(report)
}
