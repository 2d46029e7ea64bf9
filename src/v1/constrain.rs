//! Translation of logical resource limits into controller-specific pseudo-file writes.
//!
//! A [`Constraint`] is a tagged record over one controller; [`apply`](crate::v1::Manager::constrain_set)
//! routes each field to the files the kernel accepts it in at the given hierarchy level. The
//! write matrix is deliberately explicit: which file is written at which level is part of the
//! engine's contract, not an implementation detail.

use std::fmt;

use log::debug;

use crate::{parse, Error, ErrorKind, Result};

use super::{cgroup::Cgroup, registry::ControllerState, ControllerKind, Level};

const CPUS: &str = "cpuset.cpus";
const MEMS: &str = "cpuset.mems";
const EXPECTED_USAGE: &str = "cpuset.expected_usage_in_bytes";

const LIMIT: &str = "memory.limit_in_bytes";
const SOFT_LIMIT: &str = "memory.soft_limit_in_bytes";
const KMEM_LIMIT: &str = "memory.kmem.limit_in_bytes";
const MEMSW_LIMIT: &str = "memory.memsw.limit_in_bytes";
const SWAPPINESS: &str = "memory.swappiness";

const DEVICES_ALLOW: &str = "devices.allow";
const DEVICES_DENY: &str = "devices.deny";

/// Type column of a device rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Character device.
    Char,
    /// Block device.
    Block,
    /// All devices; major/minor are ignored by the kernel.
    All,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Char => "c",
            Self::Block => "b",
            Self::All => "a",
        })
    }
}

/// A device identified the way `devices.allow`/`devices.deny` expect it.
///
/// Rendering appends the full `rwm` access set; the engine grants or revokes whole devices, not
/// individual access modes.
///
/// ```
/// use stepgroup::v1::{DeviceId, DeviceType};
///
/// let nvidia0 = DeviceId::new(DeviceType::Char, 195, 0);
/// assert_eq!(nvidia0.to_string(), "c 195:0 rwm");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    /// Device type column.
    pub kind: DeviceType,
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
}

impl DeviceId {
    /// A device id from its type and numbers.
    pub fn new(kind: DeviceType, major: u32, minor: u32) -> Self {
        Self { kind, major, minor }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{} rwm", self.kind, self.major, self.minor)
    }
}

/// A logical limit for one controller, applied with
/// [`Manager::constrain_set`](crate::v1::Manager::constrain_set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// CPU and memory-node placement.
    Cpuset {
        /// `cpuset.cpus` list, e.g. `"0-3,8"`.
        cpus: String,
        /// `cpuset.mems` list.
        mems: String,
        /// `cpuset.expected_usage_in_bytes`, present on Cray systems only. Selected when the
        /// record is built; the applier carries no platform branch.
        expected_usage_bytes: Option<u64>,
    },

    /// Memory accounting limits. Absent fields are left untouched.
    Memory {
        /// `memory.swappiness`; written at job level only.
        swappiness: Option<u64>,
        /// `memory.limit_in_bytes`.
        limit_bytes: Option<u64>,
        /// `memory.soft_limit_in_bytes`.
        soft_limit_bytes: Option<u64>,
        /// `memory.kmem.limit_in_bytes`.
        kmem_limit_bytes: Option<u64>,
        /// `memory.memsw.limit_in_bytes`; skipped on kernels without swap accounting.
        memsw_limit_bytes: Option<u64>,
    },

    /// One device allow/deny rule.
    Devices {
        /// The device the rule covers.
        device: DeviceId,
        /// `true` writes `devices.allow`, `false` writes `devices.deny`.
        allow: bool,
        /// When set, the rule targets one task's cgroup instead of the level cgroup.
        task_id: Option<u32>,
    },
}

impl Constraint {
    /// A cpuset placement record with no Cray extension.
    pub fn cpuset(cpus: impl Into<String>, mems: impl Into<String>) -> Self {
        Self::Cpuset {
            cpus: cpus.into(),
            mems: mems.into(),
            expected_usage_bytes: None,
        }
    }

    /// A memory record carrying only a hard limit.
    pub fn memory_limit(limit_bytes: u64) -> Self {
        Self::Memory {
            swappiness: None,
            limit_bytes: Some(limit_bytes),
            soft_limit_bytes: None,
            kmem_limit_bytes: None,
            memsw_limit_bytes: None,
        }
    }

    /// A device allow/deny record for a level cgroup.
    pub fn device(device: DeviceId, allow: bool) -> Self {
        Self::Devices {
            device,
            allow,
            task_id: None,
        }
    }

    /// The controller this record belongs to.
    pub fn controller(&self) -> ControllerKind {
        match self {
            Self::Cpuset { .. } => ControllerKind::Cpuset,
            Self::Memory { .. } => ControllerKind::Memory,
            Self::Devices { .. } => ControllerKind::Devices,
        }
    }
}

/// Applies a constraint record to the cgroup of `level` in `state`.
///
/// `memsw_available` comes from the [`MemcgSwap`](super::Feature::MemcgSwap) probe.
pub(crate) fn apply(
    state: &ControllerState,
    level: Level,
    constraint: &Constraint,
    memsw_available: bool,
) -> Result<()> {
    if constraint.controller() != state.kind {
        return Err(Error::new(ErrorKind::Unsupported(state.kind)));
    }

    match constraint {
        Constraint::Cpuset {
            cpus,
            mems,
            expected_usage_bytes,
        } => {
            let cg = level_cg(state, level)?;

            // The kernel rejects attaching pids to a cpuset with empty masks, so a freshly
            // created cgroup inherits its parent's masks before any narrowing write.
            if cpuset_needs_init(cg) {
                inherit_from_parent(cg)?;
            }

            if matches!(level, Level::System | Level::User | Level::Job | Level::Step) {
                cg.write_param(CPUS, cpus)?;
            }
            if matches!(level, Level::User | Level::Job | Level::Step) {
                cg.write_param(MEMS, mems)?;
            }
            if let Some(bytes) = expected_usage_bytes {
                cg.write_param(EXPECTED_USAGE, bytes)?;
            }
            Ok(())
        }

        Constraint::Memory {
            swappiness,
            limit_bytes,
            soft_limit_bytes,
            kmem_limit_bytes,
            memsw_limit_bytes,
        } => {
            let cg = level_cg(state, level)?;

            if let (Level::Job, Some(swappiness)) = (level, swappiness) {
                cg.write_param(SWAPPINESS, swappiness)?;
            }
            if matches!(level, Level::System | Level::Job | Level::Step) {
                if let Some(bytes) = limit_bytes {
                    cg.write_param(LIMIT, bytes)?;
                }
            }
            if matches!(level, Level::Job | Level::Step) {
                if let Some(bytes) = soft_limit_bytes {
                    cg.write_param(SOFT_LIMIT, bytes)?;
                }
                if let Some(bytes) = kmem_limit_bytes {
                    cg.write_param(KMEM_LIMIT, bytes)?;
                }
                if let Some(bytes) = memsw_limit_bytes {
                    if memsw_available {
                        cg.write_param(MEMSW_LIMIT, bytes)?;
                    } else {
                        debug!("kernel lacks swap accounting, skipping memsw limit");
                    }
                }
            }
            Ok(())
        }

        Constraint::Devices {
            device,
            allow,
            task_id,
        } => {
            let file = if *allow { DEVICES_ALLOW } else { DEVICES_DENY };
            match (level, task_id) {
                (Level::Task, Some(id)) => {
                    let task = state
                        .task(*id)
                        .ok_or_else(|| Error::new(ErrorKind::UnknownTask(*id)))?;
                    task.cg.write_param(file, device)
                }
                (Level::Job | Level::Step, _) => level_cg(state, level)?.write_param(file, device),
                _ => Err(Error::new(ErrorKind::Unsupported(state.kind))),
            }
        }
    }
}

/// Reads the cpuset placement back from the cgroup of `level`, trailing newline stripped.
pub(crate) fn read_cpuset(state: &ControllerState, level: Level) -> Result<Constraint> {
    let cg = level_cg(state, level)?;
    let cpus: String = parse::parse(&cg.read_param(CPUS)?, CPUS)?;
    let mems: String = parse::parse(&cg.read_param(MEMS)?, MEMS)?;
    Ok(Constraint::Cpuset {
        cpus,
        mems,
        expected_usage_bytes: None,
    })
}

fn level_cg(state: &ControllerState, level: Level) -> Result<&Cgroup> {
    state
        .level(level)
        .ok_or_else(|| Error::new(ErrorKind::NotInitialized(state.kind)))
}

/// Whether a cpuset cgroup still has empty masks and must inherit before use.
pub(crate) fn cpuset_needs_init(cg: &Cgroup) -> bool {
    match cg.read_param(CPUS) {
        Ok(bytes) => bytes.iter().all(|b| b.is_ascii_whitespace()),
        Err(_) => true,
    }
}

/// Copies `cpuset.cpus` and `cpuset.mems` from the parent into a freshly created cpuset cgroup.
///
/// Levels are created and initialized top-down, so the parent has already been populated by the
/// time a child runs this; an empty parent value is propagated as-is (the mount root always has
/// non-empty masks, so the chain bottoms out there).
pub(crate) fn inherit_from_parent(cg: &Cgroup) -> Result<()> {
    let parent = match cg.parent() {
        Some(parent) => parent,
        None => return Ok(()),
    };

    for key in [CPUS, MEMS] {
        let value: String = parse::parse(&parent.read_param(key)?, key)?;
        cg.write_param(key, value)?;
    }
    Ok(())
}
