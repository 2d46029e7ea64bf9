//! Hierarchical resource control on a cgroup v1 hierarchy.
//!
//! The entry point is [`manager::Manager`], the lifecycle facade of the engine. It owns one
//! [`Config`] describing where the controller hierarchies are mounted, and drives per-controller
//! state through `initialize` / `step_create` / `step_destroy` / `fini`.
//!
//! Controllers are named by [`ControllerKind`]; the levels of the managed hierarchy
//! (`<root>/slurm/uid_U/job_J/step_S[/task_T]`) by [`Level`].
//!
//! For more information about cgroup v1, see the kernel's documentation
//! [Documentation/cgroup-v1/cgroups.txt].
//!
//! [Documentation/cgroup-v1/cgroups.txt]: https://www.kernel.org/doc/Documentation/cgroup-v1/cgroups.txt

use std::{fmt, path::PathBuf};

pub mod cgroup;
pub mod constrain;
pub mod features;
pub mod manager;
pub mod oom;
pub mod tasks;

mod hierarchy;
mod migrate;
mod registry;

pub use cgroup::Cgroup;
pub use constrain::{Constraint, DeviceId, DeviceType};
pub use features::Feature;
pub use manager::Manager;
pub use oom::OomReport;
pub use tasks::AccountingSnapshot;

const CGROUPFS_MOUNT_POINT: &str = "/sys/fs/cgroup";
const DEFAULT_PREPEND: &str = "/slurm";

/// Kinds of controllers this engine drives.
///
/// `ControllerKind` implements [`Display`]. The resulting string is the kernel subsystem
/// directory name for the controller.
///
/// ```
/// use stepgroup::v1::ControllerKind;
///
/// assert_eq!(ControllerKind::Track.to_string(), "freezer");
/// assert_eq!(ControllerKind::Cpuset.to_string(), "cpuset");
/// ```
///
/// [`Display`]: https://doc.rust-lang.org/std/fmt/trait.Display.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    /// Process tracking and suspension, backed by the freezer subsystem.
    Track,
    /// cpuset subsystem.
    Cpuset,
    /// memory subsystem.
    Memory,
    /// devices subsystem.
    Devices,
    /// cpuacct (CPU accounting) subsystem.
    Cpuacct,
}

impl ControllerKind {
    /// All controller kinds, in the order the facade initializes and finalizes them.
    pub const ALL: [ControllerKind; 5] = [
        ControllerKind::Track,
        ControllerKind::Cpuset,
        ControllerKind::Memory,
        ControllerKind::Devices,
        ControllerKind::Cpuacct,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Track => 0,
            Self::Cpuset => 1,
            Self::Memory => 2,
            Self::Devices => 3,
            Self::Cpuacct => 4,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Track => "freezer",
            Self::Cpuset => "cpuset",
            Self::Memory => "memory",
            Self::Devices => "devices",
            Self::Cpuacct => "cpuacct",
        })
    }
}

/// Levels of the managed hierarchy, shallowest first.
///
/// `System` and `User` are siblings at the same depth: `System` holds daemon-owned pids, `User`
/// is the ancestor of `Job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// The controller mount root.
    Root,
    /// The shared cgroup all jobs live under (`<root>/<subsys>/slurm`).
    Slurm,
    /// Daemon-owned pids (`slurm/system`).
    System,
    /// Per-user cgroup (`slurm/uid_<U>`).
    User,
    /// Per-job cgroup (`uid_<U>/job_<J>`).
    Job,
    /// Per-step cgroup (`job_<J>/step_<S>`).
    Step,
    /// Per-task cgroup (`step_<S>/task_<T>`).
    Task,
}

/// Identifier of a step within a job.
///
/// `StepId` renders with no `job_` prefix; [`StepId::dir_name`] yields the step's directory name.
///
/// ```
/// use stepgroup::v1::StepId;
///
/// assert_eq!(StepId::Numeric(0).dir_name(), "step_0");
/// assert_eq!(StepId::Batch.dir_name(), "step_batch");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    /// A regular numbered step.
    Numeric(u32),
    /// The batch script step.
    Batch,
    /// The external (prolog/epilog) step.
    Extern,
}

impl StepId {
    /// The on-disk directory name for this step.
    pub fn dir_name(self) -> String {
        format!("step_{}", self)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{}", n),
            Self::Batch => f.write_str("batch"),
            Self::Extern => f.write_str("extern"),
        }
    }
}

/// Identity of the job step a hierarchy is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSpec {
    /// Uid owning the step cgroups.
    pub uid: u32,
    /// Gid owning the step cgroups.
    pub gid: u32,
    /// Job id.
    pub job_id: u32,
    /// Step id within the job.
    pub step_id: StepId,
}

impl JobSpec {
    pub(crate) fn user_dir(&self) -> String {
        format!("uid_{}", self.uid)
    }

    pub(crate) fn job_dir(&self) -> String {
        format!("job_{}", self.job_id)
    }

    pub(crate) fn step_dir(&self) -> String {
        self.step_id.dir_name()
    }
}

/// Where the controller hierarchies are mounted and which cgroup all jobs live under.
///
/// The default points at `/sys/fs/cgroup` with a `/slurm` prepend. The prepend may contain `%n`,
/// replaced with the configured node name (multi-daemon-per-host deployments).
///
/// ```
/// use stepgroup::v1::Config;
///
/// let config = Config::default()
///     .with_prepend("/slurm_%n")
///     .with_node_name("node3");
/// assert_eq!(config.slurm_rel(), std::path::PathBuf::from("slurm_node3"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    root: PathBuf,
    prepend: String,
    node_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(CGROUPFS_MOUNT_POINT),
            prepend: DEFAULT_PREPEND.to_string(),
            node_name: None,
        }
    }
}

impl Config {
    /// A configuration with a non-default mount root. Subsystem hierarchies are expected at
    /// `<root>/<subsys>`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Replaces the cgroup prepend (default `/slurm`).
    pub fn with_prepend(mut self, prepend: impl Into<String>) -> Self {
        self.prepend = prepend.into();
        self
    }

    /// Sets the node name substituted for `%n` in the prepend.
    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// Whether this configuration still points at the stock mount root, in which case
    /// `initialize` verifies the subsystem against `/proc/mounts`.
    pub(crate) fn is_default_root(&self) -> bool {
        self.root == PathBuf::from(CGROUPFS_MOUNT_POINT)
    }

    /// Absolute root of one subsystem hierarchy.
    pub(crate) fn subsystem_root(&self, kind: ControllerKind) -> PathBuf {
        self.root.join(kind.to_string())
    }

    /// The slurm cgroup name relative to the subsystem root, `%n` already substituted.
    pub fn slurm_rel(&self) -> PathBuf {
        let prepend = match self.node_name {
            Some(ref node) => self.prepend.replace("%n", node),
            None => self.prepend.clone(),
        };
        PathBuf::from(prepend.trim_start_matches('/'))
    }
}

/// Scans `/proc/mounts`-format content for a v1 mount of the given subsystem.
///
/// A line qualifies when its filesystem type is `cgroup` and the mount options name the
/// subsystem. Returns the mount point.
pub(crate) fn find_subsystem_mount(mounts: &str, kind: ControllerKind) -> Option<PathBuf> {
    let subsys = kind.to_string();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let mount_point = fields.next()?;
        let fstype = fields.next()?;
        let options = fields.next()?;

        if fstype == "cgroup" && options.split(',').any(|opt| opt == subsys) {
            return Some(PathBuf::from(mount_point));
        }
    }
    None
}
