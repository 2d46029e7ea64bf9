//! Per-task cgroups and accounting snapshots.
//!
//! Tasks are tracked per controller as an ordered list in creation order; steps carry well under
//! a thousand tasks, so lookup is a linear scan and teardown just walks the list.

use log::warn;

use crate::{parse, Pid, Result};

use super::{
    migrate,
    registry::{ControllerState, TaskCg},
    JobSpec,
};

const CPUACCT_STAT: &str = "cpuacct.stat";
const MEMORY_STAT: &str = "memory.stat";

/// Accounting counters of one task, read from its cpuacct and memory cgroups.
///
/// Any field may be [`AccountingSnapshot::UNKNOWN`] when its source file was absent or
/// malformed; a snapshot is still produced. CPU times are in kernel USER_HZ ticks; callers
/// convert with [`Manager::acct_units`](crate::v1::Manager::acct_units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountingSnapshot {
    /// CPU time consumed in user mode, in USER_HZ ticks.
    pub user_ticks: u64,
    /// CPU time consumed in kernel mode, in USER_HZ ticks.
    pub system_ticks: u64,
    /// Resident set size in bytes, hierarchical.
    pub total_rss: u64,
    /// Major page faults, hierarchical.
    pub total_pgmajfault: u64,
    /// `total_rss + total_cache + total_swap`, omitting unknown contributors.
    pub total_vmem: u64,
}

impl AccountingSnapshot {
    /// Marker for a field whose source was absent or did not parse.
    pub const UNKNOWN: u64 = u64::MAX;
}

/// Adds `pid` to the task cgroup for `task_id`, creating the cgroup on first use.
///
/// Idempotent per task id: a repeated call re-migrates the pid into the existing cgroup and the
/// task list keeps a single entry.
pub(crate) fn addto(
    state: &mut ControllerState,
    job: &JobSpec,
    pid: Pid,
    task_id: u32,
) -> Result<()> {
    let idx = match state.tasks.iter().position(|t| t.task_id == task_id) {
        Some(idx) => idx,
        None => {
            let task_cg = state
                .step_cg()?
                .child(&format!("task_{}", task_id))
                .with_owner(job.uid, job.gid);
            task_cg.instantiate()?;
            if let Err(e) = task_cg.set_notify_on_release(false) {
                warn!(
                    "cannot clear notify_on_release on {}: {}",
                    task_cg.path().display(),
                    e
                );
            }
            state.tasks.push(TaskCg {
                task_id,
                cg: task_cg,
            });
            state.tasks.len() - 1
        }
    };

    migrate::move_pid(&state.tasks[idx].cg, pid)?;

    if state.max_task_id.map_or(true, |max| task_id > max) {
        state.max_task_id = Some(task_id);
    }
    Ok(())
}

/// Builds the accounting snapshot of one task from its cpuacct and memory task cgroups.
///
/// Either handle may be absent (controller not managed, task never attached there); every
/// unreadable or unparseable field degrades to `UNKNOWN` instead of failing the call.
pub(crate) fn snapshot(cpuacct: Option<&TaskCg>, memory: Option<&TaskCg>) -> AccountingSnapshot {
    const UNKNOWN: u64 = AccountingSnapshot::UNKNOWN;

    let cpuacct_stat = read_stat(cpuacct, CPUACCT_STAT);
    let memory_stat = read_stat(memory, MEMORY_STAT);

    let field = |content: &Option<String>, key: &str| -> u64 {
        content
            .as_deref()
            .and_then(|c| parse::stat_value(c, key))
            .unwrap_or(UNKNOWN)
    };

    let total_rss = field(&memory_stat, "total_rss");
    let total_cache = field(&memory_stat, "total_cache");
    let total_swap = field(&memory_stat, "total_swap");

    let known: Vec<u64> = [total_rss, total_cache, total_swap]
        .into_iter()
        .filter(|&v| v != UNKNOWN)
        .collect();
    let total_vmem = if known.is_empty() {
        UNKNOWN
    } else {
        known.into_iter().sum()
    };

    AccountingSnapshot {
        user_ticks: field(&cpuacct_stat, "user"),
        system_ticks: field(&cpuacct_stat, "system"),
        total_rss,
        total_pgmajfault: field(&memory_stat, "total_pgmajfault"),
        total_vmem,
    }
}

fn read_stat(task: Option<&TaskCg>, file: &str) -> Option<String> {
    let bytes = task?.cg.read_param(file).ok()?;
    String::from_utf8(bytes).ok()
}

/// Removes every task cgroup of the controller and clears the list.
///
/// Best-effort: a busy task directory is logged and skipped, and the list is cleared regardless.
/// Must run before the step directory itself can be removed.
pub(crate) fn destroy_all(state: &mut ControllerState) {
    for task in &state.tasks {
        if let Err(e) = task.cg.delete() {
            warn!(
                "cannot remove task cgroup {}: {}",
                task.cg.path().display(),
                e
            );
        }
    }
    state.tasks.clear();
    state.max_task_id = None;
}
