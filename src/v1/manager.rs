//! The lifecycle facade: the only boundary non-core code talks to.
//!
//! A [`Manager`] owns the per-controller registry and enforces the ordering contracts:
//! `initialize` before `step_create`, an active step before any step- or task-scoped operation,
//! balanced `step_create`/`step_destroy` with teardown on the last reference. The slurm-level
//! directory is `flock`ed across hierarchy creation and destruction because sibling step daemons
//! race on the shared `uid_*`/`job_*` parents.

use std::fs;

use log::{debug, error, warn};
use nix::unistd::{sysconf, SysconfVar};

use crate::{Error, ErrorKind, Pid, Result};

use super::{
    cgroup::Cgroup,
    constrain, features, find_subsystem_mount, hierarchy, migrate,
    oom::{OomMonitor, OomReport},
    registry::{ControllerState, Registry},
    tasks::{self, AccountingSnapshot},
    Config, Constraint, ControllerKind, Feature, JobSpec, Level,
};

const FREEZER_STATE: &str = "freezer.state";
const CLONE_CHILDREN: &str = "cgroup.clone_children";
const USE_HIERARCHY: &str = "memory.use_hierarchy";

/// Re-reads of `freezer.state` allowed per transition before giving up; freezing is
/// asynchronous and reads `FREEZING` while the kernel walks the tasks.
const FREEZE_RETRIES: u32 = 128;

/// The resource-control engine for one step daemon.
///
/// See the [module documentation](self) for the ordering contracts. The facade itself is
/// single-threaded; the only concurrent piece is the per-step OOM monitor thread, owned here and
/// consumed by [`Manager::stop_oom_mgr`].
#[derive(Debug)]
pub struct Manager {
    config: Config,
    registry: Registry,
    oom: Option<OomMonitor>,
}

impl Manager {
    /// A manager over the given mount configuration. No filesystem access happens until
    /// [`initialize`](Manager::initialize).
    pub fn new(config: Config) -> Self {
        let registry = Registry::new(&config);
        Self {
            config,
            registry,
            oom: None,
        }
    }

    /// The mount configuration this manager drives.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Brings one controller up: verifies the subsystem mount and creates the shared slurm
    /// cgroup all jobs live under. Idempotent; the transition is one-way until [`fini`].
    ///
    /// # Errors
    ///
    /// `NotMounted` when the subsystem hierarchy is absent, `MountFailed` when the slurm cgroup
    /// cannot be set up.
    ///
    /// [`fini`]: Manager::fini
    pub fn initialize(&mut self, kind: ControllerKind) -> Result<()> {
        let mut state = self.registry.state(kind);
        if state.initialized() {
            return Ok(());
        }

        if self.config.is_default_root() {
            let mounts = fs::read_to_string("/proc/mounts")
                .map_err(|e| Error::with_source(ErrorKind::NotMounted(kind), e))?;
            if find_subsystem_mount(&mounts, kind).is_none() {
                return Err(Error::new(ErrorKind::NotMounted(kind)));
            }
        } else if !state.mount.is_dir() {
            return Err(Error::new(ErrorKind::NotMounted(kind)));
        }

        let slurm = Cgroup::new(kind, state.mount.clone(), self.config.slurm_rel());
        slurm
            .instantiate()
            .map_err(|e| Error::with_source(ErrorKind::MountFailed(kind), e))?;
        if let Err(e) = slurm.set_notify_on_release(false) {
            warn!("cannot clear notify_on_release on {}: {}", slurm.path().display(), e);
        }

        match kind {
            ControllerKind::Cpuset => {
                // Children get empty masks on purpose; the engine applies deliberately narrowed
                // masks and must not have the kernel auto-copy the parent's.
                if let Err(e) = slurm.write_param(CLONE_CHILDREN, 0) {
                    warn!("cannot clear {}: {}", CLONE_CHILDREN, e);
                }
                if constrain::cpuset_needs_init(&slurm) {
                    constrain::inherit_from_parent(&slurm)
                        .map_err(|e| Error::with_source(ErrorKind::MountFailed(kind), e))?;
                }
            }
            ControllerKind::Memory => {
                if let Err(e) = slurm.write_param(USE_HIERARCHY, 1) {
                    warn!("cannot enable {}: {}", USE_HIERARCHY, e);
                }
            }
            _ => {}
        }

        state.slurm = Some(slurm);
        debug!("{} controller initialized", kind);
        Ok(())
    }

    /// Creates the daemon-owned system cgroup (`slurm/system`), once per daemon.
    ///
    /// # Errors
    ///
    /// `Unsupported` for the Track, Devices and Cpuacct controllers; `NotInitialized` before
    /// [`initialize`](Manager::initialize).
    pub fn system_create(&mut self, kind: ControllerKind) -> Result<()> {
        require_system_kind(kind)?;
        let mut state = self.registry.state(kind);

        let system = state.slurm_cg()?.child("system");
        system
            .instantiate()
            .map_err(|e| Error::with_source(ErrorKind::CreateFailed(Level::System), e))?;
        if let Err(e) = system.set_notify_on_release(false) {
            warn!("cannot clear notify_on_release on {}: {}", system.path().display(), e);
        }

        if kind == ControllerKind::Cpuset && constrain::cpuset_needs_init(&system) {
            constrain::inherit_from_parent(&system)
                .map_err(|e| Error::with_source(ErrorKind::CreateFailed(Level::System), e))?;
        }

        state.system = Some(system);
        Ok(())
    }

    /// Migrates daemon pids into the system cgroup.
    pub fn system_addto(&mut self, kind: ControllerKind, pids: &[Pid]) -> Result<()> {
        require_system_kind(kind)?;
        let state = self.registry.state(kind);
        let system = state
            .system
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotInitialized(kind)))?;

        for &pid in pids {
            migrate::move_pid(system, pid)?;
        }
        Ok(())
    }

    /// Tears the system cgroup down after moving its pids back to the controller root.
    ///
    /// Never fatal: every failure is logged and the handle is released regardless.
    pub fn system_destroy(&mut self, kind: ControllerKind) {
        let mut state = self.registry.state(kind);
        let system = match state.system.take() {
            Some(system) => system,
            None => return,
        };

        let root = state.root_cg();
        match system.pids() {
            Ok(pids) => {
                for pid in pids {
                    if let Err(e) = migrate::move_pid(&root, pid) {
                        warn!("cannot move pid {} back to {} root: {}", pid, kind, e);
                    }
                }
            }
            Err(e) => warn!("cannot list system cgroup pids: {}", e),
        }

        if let Err(e) = system.delete() {
            warn!("cannot remove system cgroup {}: {}", system.path().display(), e);
        }
    }

    /// Builds (or joins) the step hierarchy `uid_<U>/job_<J>/step_<S>` for one controller and
    /// takes a reference on it.
    ///
    /// Safe against sibling step daemons: the shared slurm directory is `flock`ed for the
    /// duration, and already-existing parent levels are reused. Each successful call must be
    /// balanced by one [`step_destroy`](Manager::step_destroy); only the last reference tears
    /// the directories down.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before [`initialize`](Manager::initialize); `CreateFailed` identifying
    /// the level that could not be instantiated.
    pub fn step_create(&mut self, kind: ControllerKind, job: &JobSpec) -> Result<()> {
        let mut state = self.registry.state(kind);
        state.slurm_cg()?;

        with_slurm_lock(&mut state, |state| {
            let slurm = state.slurm_cg()?;
            let handles = hierarchy::build(slurm, job)?;

            if kind == ControllerKind::Cpuset {
                // Masks propagate top-down: each fresh level copies its parent before any
                // narrowing write, so attachment never hits an empty cpuset.
                for cg in [&handles.user, &handles.job, &handles.step] {
                    if constrain::cpuset_needs_init(cg) {
                        constrain::inherit_from_parent(cg)?;
                    }
                }
            }

            state.user = Some(handles.user);
            state.job = Some(handles.job);
            state.step = Some(handles.step);
            state.step_active_cnt += 1;
            debug!(
                "{} step hierarchy ref taken (count {})",
                kind, state.step_active_cnt
            );
            Ok(())
        })
    }

    /// Attaches processes to the step.
    ///
    /// On the Track controller the calling process itself lands at the job level (the step
    /// daemon must survive step teardown) while every other pid attaches at step level.
    pub fn step_addto(&mut self, kind: ControllerKind, pids: &[Pid]) -> Result<()> {
        let state = self.active_state(kind)?;

        for &pid in pids {
            let dest = if kind == ControllerKind::Track && pid == Pid::this() {
                state.job_cg()?
            } else {
                state.step_cg()?
            };
            migrate::move_pid(dest, pid)?;
        }
        Ok(())
    }

    /// Pids currently attached to the step, read from the Track controller.
    pub fn step_get_pids(&self) -> Result<Vec<Pid>> {
        let state = self.active_state(ControllerKind::Track)?;
        state.step_cg()?.pids()
    }

    /// Whether a pid is attached to this step's Track cgroup.
    pub fn has_pid(&self, pid: Pid) -> bool {
        self.step_get_pids()
            .map(|pids| pids.contains(&pid))
            .unwrap_or(false)
    }

    /// Freezes every task of the step.
    pub fn step_suspend(&mut self) -> Result<()> {
        self.freezer_transition("FROZEN")
    }

    /// Thaws the step after [`step_suspend`](Manager::step_suspend).
    pub fn step_resume(&mut self) -> Result<()> {
        self.freezer_transition("THAWED")
    }

    fn freezer_transition(&mut self, target: &str) -> Result<()> {
        let state = self.active_state(ControllerKind::Track)?;
        let step = state.step_cg()?;

        step.write_param(FREEZER_STATE, target)?;
        for _ in 0..FREEZE_RETRIES {
            let current = step.read_param(FREEZER_STATE)?;
            if String::from_utf8_lossy(&current).trim() == target {
                return Ok(());
            }
            // FREEZING is transient; re-assert the request and read again.
            step.write_param(FREEZER_STATE, target)?;
        }

        warn!(
            "freezer did not reach {} within {} reads",
            target, FREEZE_RETRIES
        );
        Ok(())
    }

    /// Releases one reference on the step hierarchy; the call that drops the count to zero
    /// removes the task and step directories and, best-effort, the job and user parents.
    ///
    /// Calling without a matching [`step_create`](Manager::step_create) logs a warning and
    /// succeeds.
    ///
    /// # Errors
    ///
    /// `Busy` when the step directory itself cannot be removed.
    pub fn step_destroy(&mut self, kind: ControllerKind) -> Result<()> {
        let mut state = self.registry.state(kind);

        if state.step_active_cnt == 0 {
            warn!("step_destroy({}) without an active step", kind);
            return Ok(());
        }

        state.step_active_cnt -= 1;
        if state.step_active_cnt > 0 {
            debug!(
                "{} step hierarchy ref released (count {})",
                kind, state.step_active_cnt
            );
            return Ok(());
        }

        with_slurm_lock(&mut state, |state| {
            tasks::destroy_all(state);

            // The calling process may still sit in the step cgroup; move it to the controller
            // root and wait for the kernel to reflect that, otherwise the rmdir below is
            // guaranteed EBUSY.
            let self_pid = Pid::this();
            if let Ok(step) = state.step_cg() {
                if matches!(step.pids(), Ok(pids) if pids.contains(&self_pid)) {
                    let root = state.root_cg();
                    if let Err(e) = migrate::move_pid(&root, self_pid) {
                        warn!("cannot leave step cgroup: {}", e);
                    }
                    migrate::wait_until_gone(step, self_pid, migrate::WAIT_BUDGET);
                }
            }

            let result = match (state.user.take(), state.job.take(), state.step.take()) {
                (Some(user), Some(job), Some(step)) => {
                    hierarchy::teardown(&hierarchy::StepHandles { user, job, step })
                }
                _ => Ok(()),
            };

            state.clear_step();
            result
        })
    }

    /// Applies a constraint record at a hierarchy level.
    ///
    /// Step-level records require an active step. Writes are routed per the level/file matrix of
    /// the controller; a failed write surfaces as `WriteFailed` and nothing is partially
    /// re-tried.
    pub fn constrain_set(
        &self,
        kind: ControllerKind,
        level: Level,
        constraint: &Constraint,
    ) -> Result<()> {
        let state = self.registry.state(kind);
        if level == Level::Step && state.step_active_cnt == 0 {
            return Err(Error::new(ErrorKind::NotInitialized(kind)));
        }

        let memsw = features::has_feature(&self.config, Feature::MemcgSwap);
        constrain::apply(&state, level, constraint, memsw)
    }

    /// Reads the current cpuset placement back, trailing newlines stripped.
    ///
    /// # Errors
    ///
    /// `Unsupported` for controllers other than Cpuset.
    pub fn constrain_get(&self, kind: ControllerKind, level: Level) -> Result<Constraint> {
        if kind != ControllerKind::Cpuset {
            return Err(Error::new(ErrorKind::Unsupported(kind)));
        }
        let state = self.registry.state(kind);
        constrain::read_cpuset(&state, level)
    }

    /// Arms OOM notification on the step's memory cgroup and spawns the monitor thread.
    ///
    /// One monitor per step: a second call while one is running is a no-op.
    pub fn start_oom_mgr(&mut self) -> Result<()> {
        if self.oom.is_some() {
            warn!("oom monitor already running");
            return Ok(());
        }

        let state = self.active_state(ControllerKind::Memory)?;
        let monitor = OomMonitor::start(state.step_cg()?)?;
        drop(state);
        self.oom = Some(monitor);
        Ok(())
    }

    /// Stops the OOM monitor and reports the step's OOM totals.
    ///
    /// Always produces a report: with no monitor running (never started, or already stopped)
    /// every field is zero.
    pub fn stop_oom_mgr(&mut self) -> OomReport {
        let monitor = match self.oom.take() {
            Some(monitor) => monitor,
            None => return OomReport::default(),
        };

        let state = self.registry.state(ControllerKind::Memory);
        monitor.stop(state.step.as_ref(), state.job.as_ref())
    }

    /// Adds a pid to the task cgroup for `task_id`, creating it on first use. Idempotent per
    /// task id.
    pub fn task_addto(
        &mut self,
        kind: ControllerKind,
        job: &JobSpec,
        pid: Pid,
        task_id: u32,
    ) -> Result<()> {
        let mut state = self.active_state(kind)?;
        tasks::addto(&mut state, job, pid, task_id)
    }

    /// The accounting snapshot of one task, read from its cpuacct and memory task cgroups.
    /// Fields whose source is absent or malformed come back as
    /// [`AccountingSnapshot::UNKNOWN`]; the call itself never fails.
    pub fn task_get_acct_data(&self, task_id: u32) -> AccountingSnapshot {
        let cpuacct = self.registry.state(ControllerKind::Cpuacct);
        let memory = self.registry.state(ControllerKind::Memory);
        tasks::snapshot(cpuacct.task(task_id), memory.task(task_id))
    }

    /// USER_HZ: how many `cpuacct.stat` ticks make one second on this kernel.
    pub fn acct_units(&self) -> u64 {
        match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as u64,
            _ => 100,
        }
    }

    /// Whether the running kernel exposes an optional feature.
    pub fn has_feature(&self, feature: Feature) -> bool {
        features::has_feature(&self.config, feature)
    }

    /// Releases everything still held, in reverse dependency order: the OOM monitor, task
    /// directories, step hierarchies this manager holds the last reference on, system cgroups,
    /// and the controller roots. Tolerant of partial state; failures are logged, not returned.
    pub fn fini(&mut self) {
        if self.oom.is_some() {
            warn!("oom monitor still running at fini");
            let report = self.stop_oom_mgr();
            debug!("discarding oom report at fini: {:?}", report);
        }

        for kind in ControllerKind::ALL {
            let active = {
                let mut state = self.registry.state(kind);
                if state.step_active_cnt > 0 {
                    // Drop every outstanding reference; we are the only consumer left.
                    state.step_active_cnt = 1;
                }
                state.step_active_cnt > 0
            };
            if active {
                if let Err(e) = self.step_destroy(kind) {
                    warn!("cannot tear down {} step hierarchy at fini: {}", kind, e);
                }
            }

            self.system_destroy(kind);

            let mut state = self.registry.state(kind);
            if let Some(slurm) = state.slurm.take() {
                // The slurm cgroup is shared with every other daemon on the host; release the
                // handle without removing the directory.
                drop(slurm);
            }
        }
    }

    fn active_state(
        &self,
        kind: ControllerKind,
    ) -> Result<std::sync::MutexGuard<'_, ControllerState>> {
        let state = self.registry.state(kind);
        if state.step_active_cnt == 0 {
            return Err(Error::new(ErrorKind::NotInitialized(kind)));
        }
        Ok(state)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.oom.is_some() {
            error!("manager dropped with a running oom monitor");
        }
    }
}

fn require_system_kind(kind: ControllerKind) -> Result<()> {
    match kind {
        ControllerKind::Cpuset | ControllerKind::Memory => Ok(()),
        ControllerKind::Track | ControllerKind::Devices | ControllerKind::Cpuacct => {
            Err(Error::new(ErrorKind::Unsupported(kind)))
        }
    }
}

/// Runs `f` with the slurm-level directory `flock`ed, releasing the lock on every path.
fn with_slurm_lock<T>(
    state: &mut ControllerState,
    f: impl FnOnce(&mut ControllerState) -> Result<T>,
) -> Result<T> {
    if let Some(slurm) = state.slurm.as_mut() {
        slurm.lock()?;
    }
    let result = f(state);
    if let Some(slurm) = state.slurm.as_mut() {
        slurm.unlock();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1::{DeviceId, DeviceType, StepId};
    use std::path::Path;

    fn job_spec() -> JobSpec {
        JobSpec {
            uid: 0,
            gid: 0,
            job_id: 42,
            step_id: StepId::Batch,
        }
    }

    /// Removes every regular file under `dir`, recursively, keeping directories.
    ///
    /// A kernel cgroup directory is removable while its pseudo-files exist; the scratch tree is
    /// not. Stripping the files before a teardown assertion restores kernel `rmdir` semantics.
    fn strip_pseudo_files(dir: &Path) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                strip_pseudo_files(&entry.path());
            } else {
                std::fs::remove_file(entry.path()).unwrap();
            }
        }
    }

    /// Lays out `<root>/<subsys>` with the root-level files a kernel would provide.
    fn fake_mount(root: &Path, kind: ControllerKind) {
        let subsys = root.join(kind.to_string());
        std::fs::create_dir_all(&subsys).unwrap();
        if kind == ControllerKind::Cpuset {
            std::fs::write(subsys.join("cpuset.cpus"), "0-7\n").unwrap();
            std::fs::write(subsys.join("cpuset.mems"), "0-1\n").unwrap();
        }
    }

    fn manager(root: &Path, kinds: &[ControllerKind]) -> Manager {
        for &kind in kinds {
            fake_mount(root, kind);
        }
        let mut manager = Manager::new(Config::with_root(root));
        for &kind in kinds {
            manager.initialize(kind).unwrap();
        }
        manager
    }

    #[test]
    fn test_initialize_requires_mount() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = Manager::new(Config::with_root(root.path()));

        let err = manager.initialize(ControllerKind::Memory).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::NotMounted(ControllerKind::Memory));
    }

    #[test]
    fn test_initialize_creates_slurm_cgroup() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path(), &[ControllerKind::Cpuset, ControllerKind::Memory]);

        // Cpuset slurm cgroup inherited the root masks and disabled clone_children.
        let slurm = root.path().join("cpuset/slurm");
        assert_eq!(std::fs::read(slurm.join("cpuset.cpus")).unwrap(), b"0-7");
        assert_eq!(std::fs::read(slurm.join("cgroup.clone_children")).unwrap(), b"0");

        // Memory slurm cgroup accounts hierarchically.
        let slurm = root.path().join("memory/slurm");
        assert_eq!(std::fs::read(slurm.join("memory.use_hierarchy")).unwrap(), b"1");

        drop(manager);
    }

    #[test]
    fn test_step_requires_initialize() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = Manager::new(Config::with_root(root.path()));

        let err = manager
            .step_create(ControllerKind::Memory, &job_spec())
            .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::NotInitialized(ControllerKind::Memory));
    }

    #[test]
    fn test_step_lifecycle_cpuset() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Cpuset]);

        manager.step_create(ControllerKind::Cpuset, &job_spec())?;
        let step = root.path().join("cpuset/slurm/uid_0/job_42/step_batch");
        assert!(step.is_dir());

        // Masks were inherited down the chain, then narrowed by the constraint.
        assert_eq!(std::fs::read(step.join("cpuset.cpus")).unwrap(), b"0-7");
        manager.constrain_set(
            ControllerKind::Cpuset,
            Level::Step,
            &Constraint::cpuset("0-1", "0"),
        )?;
        assert_eq!(std::fs::read(step.join("cpuset.cpus")).unwrap(), b"0-1");
        assert_eq!(std::fs::read(step.join("cpuset.mems")).unwrap(), b"0");

        match manager.constrain_get(ControllerKind::Cpuset, Level::Step)? {
            Constraint::Cpuset { cpus, mems, .. } => {
                assert_eq!(cpus, "0-1");
                assert_eq!(mems, "0");
            }
            other => panic!("unexpected record {:?}", other),
        }

        strip_pseudo_files(root.path());
        manager.step_destroy(ControllerKind::Cpuset)?;
        assert!(!step.exists());
        assert!(!root.path().join("cpuset/slurm/uid_0/job_42").exists());
        assert!(!root.path().join("cpuset/slurm/uid_0").exists());
        assert!(root.path().join("cpuset/slurm").is_dir());
        Ok(())
    }

    #[test]
    fn test_step_refcount_tears_down_on_last() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Memory]);

        // Two facade consumers of the same step.
        manager.step_create(ControllerKind::Memory, &job_spec())?;
        manager.step_create(ControllerKind::Memory, &job_spec())?;

        let step = root.path().join("memory/slurm/uid_0/job_42/step_batch");
        assert!(step.is_dir());

        manager.step_destroy(ControllerKind::Memory)?;
        assert!(step.is_dir());

        strip_pseudo_files(root.path());
        manager.step_destroy(ControllerKind::Memory)?;
        assert!(!step.exists());
        Ok(())
    }

    #[test]
    fn test_step_destroy_without_create_warns_ok() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Memory]);
        manager.step_destroy(ControllerKind::Memory)
    }

    #[test]
    fn test_step_addto_and_get_pids() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Track]);
        manager.step_create(ControllerKind::Track, &job_spec())?;

        manager.step_addto(ControllerKind::Track, &[Pid::from(12345_u32)])?;
        assert_eq!(manager.step_get_pids()?, vec![Pid::from(12345_u32)]);
        assert!(manager.has_pid(Pid::from(12345_u32)));
        assert!(!manager.has_pid(Pid::from(1_u32)));

        // The calling process attaches at job level, not step level.
        manager.step_addto(ControllerKind::Track, &[Pid::this()])?;
        assert!(!manager.has_pid(Pid::this()));
        let job_procs = root
            .path()
            .join("freezer/slurm/uid_0/job_42/cgroup.procs");
        assert!(std::fs::read_to_string(job_procs)
            .unwrap()
            .contains(&Pid::this().to_string()));
        Ok(())
    }

    #[test]
    fn test_suspend_resume() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Track]);
        manager.step_create(ControllerKind::Track, &job_spec())?;

        let state_file = root
            .path()
            .join("freezer/slurm/uid_0/job_42/step_batch/freezer.state");

        manager.step_suspend()?;
        assert_eq!(std::fs::read(&state_file).unwrap(), b"FROZEN");
        manager.step_resume()?;
        assert_eq!(std::fs::read(&state_file).unwrap(), b"THAWED");
        Ok(())
    }

    #[test]
    fn test_memory_constraint_and_oom_report() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Memory]);
        manager.step_create(ControllerKind::Memory, &job_spec())?;

        manager.constrain_set(
            ControllerKind::Memory,
            Level::Step,
            &Constraint::memory_limit(10_485_760),
        )?;
        let step = root.path().join("memory/slurm/uid_0/job_42/step_batch");
        assert_eq!(std::fs::read(step.join("memory.limit_in_bytes")).unwrap(), b"10485760");

        // Arm the monitor against scratch oom files and stop it again.
        std::fs::write(step.join("memory.oom_control"), "oom_kill_disable 0\n").unwrap();
        std::fs::write(step.join("cgroup.event_control"), "").unwrap();
        std::fs::write(step.join("memory.failcnt"), "1\n").unwrap();
        manager.start_oom_mgr()?;
        let report = manager.stop_oom_mgr();
        assert_eq!(report.oom_kill_count, 0);
        assert_eq!(report.step_mem_failcnt, 1);

        strip_pseudo_files(root.path());
        manager.step_destroy(ControllerKind::Memory)
    }

    #[test]
    fn test_stop_oom_mgr_without_start() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Memory]);
        assert_eq!(manager.stop_oom_mgr(), OomReport::default());
    }

    #[test]
    fn test_device_constraint_writes_deny() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Devices]);
        manager.step_create(ControllerKind::Devices, &job_spec())?;

        manager.constrain_set(
            ControllerKind::Devices,
            Level::Step,
            &Constraint::device(DeviceId::new(DeviceType::Char, 10, 200), false),
        )?;

        let deny = root
            .path()
            .join("devices/slurm/uid_0/job_42/step_batch/devices.deny");
        assert_eq!(std::fs::read(deny).unwrap(), b"c 10:200 rwm");
        Ok(())
    }

    #[test]
    fn test_task_addto_and_accounting() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let kinds = [ControllerKind::Cpuacct, ControllerKind::Memory];
        let mut manager = manager(root.path(), &kinds);
        for kind in kinds {
            manager.step_create(kind, &job_spec())?;
            manager.task_addto(kind, &job_spec(), Pid::from(100_u32), 0)?;
        }

        std::fs::write(
            root.path()
                .join("cpuacct/slurm/uid_0/job_42/step_batch/task_0/cpuacct.stat"),
            "user 12345\nsystem 678\n",
        )
        .unwrap();
        std::fs::write(
            root.path()
                .join("memory/slurm/uid_0/job_42/step_batch/task_0/memory.stat"),
            "total_rss 4096\ntotal_cache 0\ntotal_swap 0\ntotal_pgmajfault 2\n",
        )
        .unwrap();

        let snap = manager.task_get_acct_data(0);
        assert_eq!(snap.user_ticks, 12345);
        assert_eq!(snap.system_ticks, 678);
        assert_eq!(snap.total_rss, 4096);
        assert_eq!(snap.total_pgmajfault, 2);
        assert_eq!(snap.total_vmem, 4096);

        assert!(manager.acct_units() > 0);
        Ok(())
    }

    #[test]
    fn test_system_lifecycle() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), &[ControllerKind::Memory]);

        manager.system_create(ControllerKind::Memory)?;
        let system = root.path().join("memory/slurm/system");
        assert!(system.is_dir());

        manager.system_addto(ControllerKind::Memory, &[Pid::from(200_u32)])?;
        assert_eq!(
            std::fs::read_to_string(system.join("cgroup.procs")).unwrap(),
            "200"
        );

        // Never fatal, removes the cgroup when it can.
        strip_pseudo_files(&system);
        manager.system_destroy(ControllerKind::Memory);
        assert!(!system.exists());

        let err = manager.system_create(ControllerKind::Track).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Unsupported(ControllerKind::Track));
        Ok(())
    }

    #[test]
    #[ignore] // needs root and a mounted cgroup v1 hierarchy
    fn test_kernel_step_lifecycle() -> Result<()> {
        use nix::unistd::{Gid, Uid};

        let mut manager = Manager::new(Config::default());
        manager.initialize(ControllerKind::Track)?;

        let job = JobSpec {
            uid: Uid::current().as_raw(),
            gid: Gid::current().as_raw(),
            job_id: 999_942,
            step_id: StepId::Numeric(0),
        };
        manager.step_create(ControllerKind::Track, &job)?;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("command failed");
        let child_pid = Pid::from(&child);
        manager.step_addto(ControllerKind::Track, &[child_pid])?;
        assert!(manager.has_pid(child_pid));

        manager.step_suspend()?;
        manager.step_resume()?;

        child.kill().unwrap();
        child.wait().unwrap();

        manager.step_destroy(ControllerKind::Track)?;
        manager.fini();
        Ok(())
    }

    #[test]
    #[ignore] // needs root, a memory cgroup mount, and enough memory to OOM a child
    fn test_kernel_oom_kill_is_counted() -> Result<()> {
        use nix::unistd::{Gid, Uid};

        let mut manager = Manager::new(Config::default());
        manager.initialize(ControllerKind::Memory)?;

        let job = JobSpec {
            uid: Uid::current().as_raw(),
            gid: Gid::current().as_raw(),
            job_id: 999_943,
            step_id: StepId::Numeric(0),
        };
        manager.step_create(ControllerKind::Memory, &job)?;
        manager.constrain_set(
            ControllerKind::Memory,
            Level::Step,
            &Constraint::memory_limit(10 * 1024 * 1024),
        )?;
        manager.start_oom_mgr()?;

        // The child sleeps long enough to be migrated, then makes 32 MiB resident inside a
        // 10 MiB cgroup and gets killed.
        let mut child = std::process::Command::new("sh")
            .args([
                "-c",
                "sleep 1; x=$(head -c 33554432 /dev/zero | tr '\\0' 'x'); echo $x",
            ])
            .spawn()
            .expect("command failed");
        let child_pid = Pid::from(&child);
        manager.step_addto(ControllerKind::Memory, &[child_pid])?;
        child.wait().unwrap();

        let report = manager.stop_oom_mgr();
        assert!(report.oom_kill_count >= 1);
        assert!(report.step_mem_failcnt >= 1);

        manager.step_destroy(ControllerKind::Memory)?;
        manager.fini();
        Ok(())
    }

    #[test]
    fn test_fini_tolerates_partial_state() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let kinds = [ControllerKind::Track, ControllerKind::Memory];
        let mut manager = manager(root.path(), &kinds);

        manager.step_create(ControllerKind::Memory, &job_spec())?;
        manager.step_create(ControllerKind::Memory, &job_spec())?;
        manager.task_addto(ControllerKind::Memory, &job_spec(), Pid::from(100_u32), 0)?;

        strip_pseudo_files(root.path());
        manager.fini();

        // Both references were released and the whole hierarchy is gone; the shared slurm
        // cgroup stays for other daemons.
        assert!(!root.path().join("memory/slurm/uid_0").exists());
        assert!(root.path().join("memory/slurm").is_dir());

        // fini is terminal: the controller needs a fresh initialize.
        let err = manager
            .step_create(ControllerKind::Memory, &job_spec())
            .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::NotInitialized(ControllerKind::Memory));
        Ok(())
    }
}
