//! Process-group helpers for spawning and killing job subprocesses.
//!
//! A job's command is spawned as the leader of its own process group so that
//! a timeout or cancellation can terminate the whole tree (the shell plus
//! anything it forked), not just the immediate child. On non-Unix targets
//! these are no-ops; SchedArray's worker pool only ever group-kills on POSIX.

use std::io;

#[cfg(unix)]
/// Put the calling process into its own process group. Intended for use in
/// `pre_exec`, so the spawned shell becomes the group leader.
pub fn set_process_group() -> io::Result<()> {
    let result = unsafe { libc::setpgid(0, 0) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
pub fn set_process_group() -> io::Result<()> {
    Ok(())
}

/// Signal levels used by the supervision loop's SIGTERM-then-SIGKILL grace
/// window (§5, §4.3 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
/// Send `signal` to the whole process group led by `pid` (best-effort).
pub fn signal_process_group(pid: i64, signal: Signal) -> io::Result<()> {
    let raw = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let result = unsafe { libc::killpg(pid as libc::pid_t, raw) };
    if result == -1 {
        let err = io::Error::last_os_error();
        // ESRCH means the group is already gone; that is the desired end state.
        if err.kind() != io::ErrorKind::NotFound {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_process_group(_pid: i64, _signal: Signal) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
/// Whether a process with the given pid is alive, used for stale pid-lock
/// reclaim and the worker pool's crash-recovery sweep.
pub fn is_process_alive(pid: i64) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: i64) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        let pid = std::process::id() as i64;
        assert!(is_process_alive(pid));
    }

    #[test]
    fn pid_zero_reserved_is_not_treated_as_current_process() {
        // pid 0 means "my own process group" to kill(2), not a real pid; the
        // orphan sweep never passes it, but guard the helper's contract.
        assert_ne!(std::process::id() as i64, 0);
    }
}
