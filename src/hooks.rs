//! Connect/disconnect hook execution and process signal dispositions.

use std::process::Command;

use tracing::{debug, error};

/// Launch a hook program, detached, with no arguments. Failures are
/// logged only; a broken hook never takes the receiver down.
pub fn run_hook(prog: &str) {
    match Command::new(prog).spawn() {
        Ok(child) => {
            debug!(prog, pid = child.id(), "hook started");
        }
        Err(e) => {
            error!(prog, error = %e, "hook exec failed");
        }
    }
}

/// Ignore `SIGPIPE` (pipe reader may vanish mid-write; the write error is
/// handled inline) and `SIGCHLD` (hook children are auto-reaped, never
/// waited on).
pub fn ignore_signals() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_hook_does_not_panic() {
        run_hook("/nonexistent/hook-program");
    }

    #[test]
    fn test_hook_spawns_detached() {
        run_hook("/bin/true");
    }
}
