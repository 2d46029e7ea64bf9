//! Moving pids between cgroups, and waiting for the kernel to reflect a move.

use log::warn;

use crate::{Pid, Result};

use super::cgroup::Cgroup;

/// Iteration budget for [`wait_until_gone`]. The loop does not sleep; slow cgroup subsystems
/// commit `cgroup.procs` moves within far fewer reads than this in practice.
pub(crate) const WAIT_BUDGET: u32 = 5000;

/// Migrates a process into `dest` by writing its pid to `cgroup.procs`.
pub(crate) fn move_pid(dest: &Cgroup, pid: Pid) -> Result<()> {
    dest.add_pid(pid)
}

/// Spins until `pid` no longer appears in `source`'s `cgroup.procs`, or the budget runs out.
///
/// Used during step teardown after the calling process moved itself out of the step cgroup: the
/// kernel may expose the move in `cgroup.procs` with a delay. Returns `true` when the pid is
/// gone. On budget exhaustion the caller proceeds anyway; the following `rmdir` will report the
/// cgroup busy and teardown already tolerates that. Even a pid absent from `cgroup.procs` can
/// pin the directory for a little longer through kernel-internal references.
pub(crate) fn wait_until_gone(source: &Cgroup, pid: Pid, budget: u32) -> bool {
    for _ in 0..budget {
        match source.pids() {
            Ok(pids) if !pids.contains(&pid) => return true,
            Ok(_) => {}
            // The step directory may already be gone; nothing left to wait for.
            Err(_) => return true,
        }
    }

    warn!(
        "pid {} still listed in {} after {} reads",
        pid,
        source.path().display(),
        budget
    );
    false
}
