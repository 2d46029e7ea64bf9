//! Per-controller mutable state behind one coarse mutex per kind.
//!
//! Steps are long-lived compared to any operation here, so a single mutex per controller is
//! enough; the facade takes the guard at the top of an operation and every helper works on the
//! borrowed state.

use std::{
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use crate::{Error, ErrorKind, Result};

use super::{cgroup::Cgroup, Config, ControllerKind, Level};

/// One task cgroup tracked for a step, in creation order.
#[derive(Debug)]
pub(crate) struct TaskCg {
    pub(crate) task_id: u32,
    pub(crate) cg: Cgroup,
}

/// State of one controller.
#[derive(Debug)]
pub(crate) struct ControllerState {
    pub(crate) kind: ControllerKind,
    /// Root of the subsystem hierarchy (`<mount>/<subsys>`).
    pub(crate) mount: PathBuf,
    /// The shared cgroup all jobs live under. `Some` iff the controller is initialized.
    pub(crate) slurm: Option<Cgroup>,
    pub(crate) system: Option<Cgroup>,
    pub(crate) user: Option<Cgroup>,
    pub(crate) job: Option<Cgroup>,
    pub(crate) step: Option<Cgroup>,
    /// Number of facade consumers holding the step hierarchy. Directories exist on disk while
    /// this is non-zero; only the decrement to zero tears them down.
    pub(crate) step_active_cnt: u16,
    pub(crate) tasks: Vec<TaskCg>,
    pub(crate) max_task_id: Option<u32>,
}

impl ControllerState {
    fn new(kind: ControllerKind, mount: PathBuf) -> Self {
        Self {
            kind,
            mount,
            slurm: None,
            system: None,
            user: None,
            job: None,
            step: None,
            step_active_cnt: 0,
            tasks: Vec::new(),
            max_task_id: None,
        }
    }

    pub(crate) fn initialized(&self) -> bool {
        self.slurm.is_some()
    }

    /// The slurm cgroup, or `NotInitialized` when `initialize` has not run.
    pub(crate) fn slurm_cg(&self) -> Result<&Cgroup> {
        self.slurm
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotInitialized(self.kind)))
    }

    /// The step cgroup, or `NotInitialized` when no step hierarchy is active.
    pub(crate) fn step_cg(&self) -> Result<&Cgroup> {
        self.step
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotInitialized(self.kind)))
    }

    pub(crate) fn job_cg(&self) -> Result<&Cgroup> {
        self.job
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotInitialized(self.kind)))
    }

    /// The handle for a hierarchy level, when one is held.
    pub(crate) fn level(&self, level: Level) -> Option<&Cgroup> {
        match level {
            Level::Slurm => self.slurm.as_ref(),
            Level::System => self.system.as_ref(),
            Level::User => self.user.as_ref(),
            Level::Job => self.job.as_ref(),
            Level::Step => self.step.as_ref(),
            Level::Root | Level::Task => None,
        }
    }

    pub(crate) fn task(&self, task_id: u32) -> Option<&TaskCg> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// A handle on the subsystem mount root itself.
    pub(crate) fn root_cg(&self) -> Cgroup {
        Cgroup::new(self.kind, self.mount.clone(), "")
    }

    /// Drops all step-scoped handles after the last consumer tore the hierarchy down.
    pub(crate) fn clear_step(&mut self) {
        self.user = None;
        self.job = None;
        self.step = None;
        self.tasks.clear();
        self.max_task_id = None;
    }
}

/// The owned registry: one mutex-guarded [`ControllerState`] per controller kind.
#[derive(Debug)]
pub(crate) struct Registry {
    states: [Mutex<ControllerState>; 5],
}

impl Registry {
    pub(crate) fn new(config: &Config) -> Self {
        let state = |kind: ControllerKind| {
            Mutex::new(ControllerState::new(kind, config.subsystem_root(kind)))
        };
        Self {
            states: [
                state(ControllerKind::Track),
                state(ControllerKind::Cpuset),
                state(ControllerKind::Memory),
                state(ControllerKind::Devices),
                state(ControllerKind::Cpuacct),
            ],
        }
    }

    /// Locks and returns the state of one controller. A poisoned lock is taken over rather than
    /// propagated; the state is plain data and stays consistent across a panicking holder.
    pub(crate) fn state(&self, kind: ControllerKind) -> MutexGuard<'_, ControllerState> {
        match self.states[kind.index()].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
