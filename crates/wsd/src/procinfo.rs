// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process bookkeeping via `/proc` and signals.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Resident set size of a process in KB, from `/proc/{pid}/status`.
///
/// Returns 0 when the process is gone or the field is unreadable; callers
/// treat a vanished worker as consuming nothing.
pub fn rss_kb(pid: i32) -> u64 {
    status_field(pid, "VmRSS:").unwrap_or(0)
}

/// Parent pid of a process, from `/proc/{pid}/status`.
pub fn parent_pid(pid: i32) -> Option<i32> {
    status_field(pid, "PPid:").and_then(|v| i32::try_from(v).ok())
}

fn status_field(pid: i32, field: &str) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Whether a pid still names a live process.
pub fn alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Send SIGINT, as the admin `kill` command does.
pub fn interrupt(pid: i32) -> nix::Result<()> {
    kill(Pid::from_raw(pid), Signal::SIGINT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_rss_is_nonzero() {
        let pid = std::process::id() as i32;
        assert!(rss_kb(pid) > 0);
    }

    #[test]
    fn dead_pid_reads_as_zero() {
        // Pid well above any default pid_max allocation in test environments.
        assert_eq!(rss_kb(i32::MAX - 1), 0);
        assert!(!alive(i32::MAX - 1));
    }

    #[test]
    fn parent_of_self_is_live() {
        let pid = std::process::id() as i32;
        let ppid = parent_pid(pid).unwrap();
        assert!(ppid >= 0);
    }
}
