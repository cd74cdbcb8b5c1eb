//! Hard-deadline supervision of child processes.
//!
//! The only in-process concurrency in the grader is this deadline: a child
//! that outlives it gets its whole process group killed. Children are
//! always spawned into their own group so a forking graded program cannot
//! outlive its supervisor.

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of a supervised wait
#[derive(Debug)]
pub(crate) struct WaitOutcome {
    pub status: ExitStatus,
    /// True when the deadline fired and the group was killed
    pub killed: bool,
    /// Wall-clock time from spawn to exit
    pub wall: Duration,
}

/// Put the child into its own process group so the whole tree can be
/// terminated at once.
pub(crate) fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
}

/// Wait for the child, killing its process group if `deadline` elapses
/// first. Always reaps the child.
pub(crate) fn wait_with_deadline(child: &mut Child, deadline: Duration) -> io::Result<WaitOutcome> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(WaitOutcome {
                status,
                killed: false,
                wall: start.elapsed(),
            });
        }
        if start.elapsed() >= deadline {
            kill_group(child);
            let status = child.wait()?;
            return Ok(WaitOutcome {
                status,
                killed: true,
                wall: start.elapsed(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Kill the child's process group (or just the child where groups are
/// unavailable). Errors are ignored: the group may already be gone.
pub(crate) fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    }
    let _ = child.kill();
}

/// Split an exit status into (exit code, signal). Signaled exits map to the
/// conventional `128 + signal` code.
pub(crate) fn split_status(status: ExitStatus) -> (i32, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (status.code().unwrap_or(-1), None)
}
