#![cfg(target_os = "linux")]
#![warn(missing_docs)]

//! Hierarchical cgroup v1 resource control for a workload manager's compute daemon.
//!
//! The crate owns the full lifecycle of per-job, per-step, per-task control groups under five
//! controllers (freezer-backed process tracking, cpuset, memory, devices, cpuacct), reports
//! out-of-memory events per step, and produces per-task accounting snapshots.
//!
//! ## Example
//!
//! ```no_run
//! # fn main() -> stepgroup::Result<()> {
//! use stepgroup::{Pid, v1::{Config, Constraint, ControllerKind, JobSpec, Level, Manager, StepId}};
//!
//! let mut manager = Manager::new(Config::default());
//!
//! // Bring up the cpuset controller and build the hierarchy for a job step.
//! manager.initialize(ControllerKind::Cpuset)?;
//! let job = JobSpec { uid: 1000, gid: 1000, job_id: 42, step_id: StepId::Batch };
//! manager.step_create(ControllerKind::Cpuset, &job)?;
//!
//! // Attach a task and narrow the step to two cores.
//! manager.step_addto(ControllerKind::Cpuset, &[Pid::from(12345_u32)])?;
//! manager.constrain_set(
//!     ControllerKind::Cpuset,
//!     Level::Step,
//!     &Constraint::cpuset("0-1", "0"),
//! )?;
//!
//! // Tear down when the step ends. The last consumer removes the directories.
//! manager.step_destroy(ControllerKind::Cpuset)?;
//! manager.fini();
//! # Ok(())
//! # }
//! ```
//!
//! Note that cgroup directories are kernel objects: dropping a [`v1::Manager`] without calling
//! [`v1::Manager::fini`] leaves any remaining directories around.

mod error;
mod parse;
pub mod v1;

pub use error::{Error, ErrorKind, Result};

/// PID for attaching a process to a cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32); // Max PID is 2^15 on 32-bit systems, 2^22 on 64-bit systems

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

impl From<&std::process::Child> for Pid {
    fn from(child: &std::process::Child) -> Self {
        Self(child.id())
    }
}

impl Pid {
    /// The calling process.
    pub fn this() -> Self {
        Self(std::process::id())
    }
}

impl std::str::FromStr for Pid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u32>().map(Self)
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
