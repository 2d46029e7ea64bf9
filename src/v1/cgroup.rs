//! Handles on cgroup directories and the pseudo-file operations every other module goes through.
//!
//! [`Cgroup`] is a handle on one directory of one controller hierarchy. All kernel traffic of
//! the engine (mkdir/chown/rmdir, parameter reads and writes, `cgroup.procs`, the advisory
//! directory lock) funnels through this module, so a test can point the whole engine at a
//! scratch directory via [`Config`](super::Config).

use std::{
    fmt, fs,
    io::{self, Write as _},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use nix::{
    fcntl::{flock, FlockArg},
    unistd::{chown, Gid, Uid},
};

use crate::{parse, Error, ErrorKind, Pid, Result};

use super::ControllerKind;

const PROCS: &str = "cgroup.procs";
const NOTIFY_ON_RELEASE: &str = "notify_on_release";

/// Handle on one cgroup directory of one controller hierarchy.
///
/// A handle carries the owner applied at [`instantiate`] and, once [`lock`] succeeds, the open
/// descriptor holding the advisory `flock` on the directory. Identity is the absolute path; the
/// kernel object outlives the handle.
///
/// [`instantiate`]: Cgroup::instantiate
/// [`lock`]: Cgroup::lock
#[derive(Debug)]
pub struct Cgroup {
    kind: ControllerKind,
    root: PathBuf,
    rel: PathBuf,
    uid: u32,
    gid: u32,
    lock: Option<fs::File>,
}

impl Cgroup {
    /// Defines a handle rooted at `root` (the subsystem mount) with a name relative to it.
    ///
    /// The handle is root-owned until [`Cgroup::with_owner`] is applied. Defining a handle does
    /// not touch the filesystem.
    pub fn new(kind: ControllerKind, root: impl Into<PathBuf>, rel: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: root.into(),
            rel: rel.into(),
            uid: 0,
            gid: 0,
            lock: None,
        }
    }

    /// Sets the owner `instantiate` applies to the directory.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// The controller this cgroup belongs to.
    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    /// Absolute path of the directory.
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.rel)
    }

    /// Name relative to the subsystem root.
    pub fn rel(&self) -> &Path {
        &self.rel
    }

    /// A root-owned handle on the parent directory, or `None` at the subsystem root.
    pub fn parent(&self) -> Option<Self> {
        let rel = self.rel.parent()?;
        if self.rel.as_os_str().is_empty() {
            return None;
        }
        Some(Self {
            kind: self.kind,
            root: self.root.clone(),
            rel: rel.to_path_buf(),
            uid: 0,
            gid: 0,
            lock: None,
        })
    }

    /// A handle on a direct child, inheriting this handle's owner.
    pub fn child(&self, name: &str) -> Self {
        Self {
            kind: self.kind,
            root: self.root.clone(),
            rel: self.rel.join(name),
            uid: self.uid,
            gid: self.gid,
            lock: None,
        }
    }

    /// Creates the directory and applies the owner.
    ///
    /// An already-existing directory is not an error: sibling steps race on the shared
    /// `uid_*`/`job_*` parents, and whoever loses the `mkdir` race simply reuses the directory.
    pub fn instantiate(&self) -> Result<()> {
        let path = self.path();

        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::write(path, e)),
        }

        if self.uid != 0 || self.gid != 0 {
            chown(
                &path,
                Some(Uid::from_raw(self.uid)),
                Some(Gid::from_raw(self.gid)),
            )
            .map_err(|e| Error::write(&path, io::Error::from_raw_os_error(e as i32)))?;
        }

        Ok(())
    }

    /// Removes the directory.
    ///
    /// `EBUSY` maps to [`ErrorKind::Busy`]; the caller decides whether a busy cgroup is fatal.
    /// An already-removed directory is not an error.
    pub fn delete(&self) -> Result<()> {
        let path = self.path();
        match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                Err(Error::with_source(ErrorKind::Busy { path }, e))
            }
            Err(e) => Err(Error::write(path, e)),
        }
    }

    /// Reads a parameter file, returning the exact bytes the kernel returned (trailing newline
    /// included; callers strip).
    pub fn read_param(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path().join(key);
        fs::read(&path).map_err(|e| Error::read(path, e))
    }

    /// Reads and parses a whitespace-separated list of `u32` from a parameter file.
    pub fn read_u32s(&self, key: &str) -> Result<Vec<u32>> {
        let bytes = self.read_param(key)?;
        parse::parse_vec(&bytes, key)
    }

    /// Reads and parses a whitespace-separated list of `u64` from a parameter file.
    pub fn read_u64s(&self, key: &str) -> Result<Vec<u64>> {
        let bytes = self.read_param(key)?;
        parse::parse_vec(&bytes, key)
    }

    /// Writes a parameter file. The previous contents are replaced.
    pub fn write_param(&self, key: &str, value: impl fmt::Display) -> Result<()> {
        let path = self.path().join(key);
        fs::write(&path, format!("{}", value)).map_err(|e| Error::write(path, e))
    }

    /// Attaches a process by appending its pid to `cgroup.procs`.
    pub fn add_pid(&self, pid: Pid) -> Result<()> {
        let path = self.path().join(PROCS);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::write(&path, e))?;
        write!(file, "{}", pid).map_err(|e| Error::write(path, e))
    }

    /// Reads the pids attached to this cgroup from `cgroup.procs`.
    pub fn pids(&self) -> Result<Vec<Pid>> {
        Ok(self.read_u32s(PROCS)?.into_iter().map(Pid::from).collect())
    }

    /// Sets `notify_on_release`. The engine writes `0` on every cgroup it creates: teardown is
    /// owned by the daemon and must not race the kernel's release agent.
    pub fn set_notify_on_release(&self, enable: bool) -> Result<()> {
        self.write_param(NOTIFY_ON_RELEASE, enable as i32)
    }

    /// Whether a file with the given name exists in this cgroup.
    pub fn file_exists(&self, name: &str) -> bool {
        self.path().join(name).exists()
    }

    /// Takes the advisory exclusive lock on the directory, blocking until the holder releases it.
    ///
    /// The lock is process-wide and not reentrant; it serializes sibling step daemons mutating
    /// the shared parents of the hierarchy.
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }

        let path = self.path();
        let dir = fs::File::open(&path).map_err(|e| Error::read(&path, e))?;
        flock(dir.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| Error::write(&path, io::Error::from_raw_os_error(e as i32)))?;
        self.lock = Some(dir);
        Ok(())
    }

    /// Releases the advisory lock, if held. Closing the descriptor releases the `flock`.
    pub fn unlock(&mut self) {
        self.lock = None;
    }
}

/// Locates the cgroup a pid currently lives in under the given controller.
///
/// Parses `/proc/<pid>/cgroup` and matches on the subsystem-name column only; numeric hierarchy
/// ids are not interpreted. Returns `None` when the pid has no entry for the controller (or no
/// longer exists).
pub fn find_by_pid(root: impl Into<PathBuf>, kind: ControllerKind, pid: Pid) -> Option<Cgroup> {
    let content = fs::read_to_string(format!("/proc/{}/cgroup", pid)).ok()?;
    let rel = parse_proc_cgroup(&content, kind)?;
    Some(Cgroup::new(kind, root, rel))
}

/// Extracts the cgroup path of one controller from `/proc/<pid>/cgroup` contents.
///
/// Each line reads `<hierarchy-id>:<subsys>[,<subsys>...]:<path>`. The leading `/` of the path
/// is stripped so the result is relative to the subsystem root.
pub(crate) fn parse_proc_cgroup(content: &str, kind: ControllerKind) -> Option<PathBuf> {
    let subsys = kind.to_string();
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let _hierarchy_id = fields.next()?;
        let subsystems = fields.next()?;
        let path = fields.next()?;

        if subsystems.split(',').any(|s| s == subsys) {
            return Some(PathBuf::from(path.trim_start_matches('/')));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_cgroup(dir: &Path) -> Cgroup {
        Cgroup::new(ControllerKind::Memory, dir, "slurm/uid_1000/job_42")
    }

    #[test]
    fn test_cgroup_path() {
        let cg = scratch_cgroup(Path::new("/sys/fs/cgroup/memory"));
        assert_eq!(
            cg.path(),
            PathBuf::from("/sys/fs/cgroup/memory/slurm/uid_1000/job_42")
        );
        assert_eq!(cg.rel(), Path::new("slurm/uid_1000/job_42"));
        assert_eq!(cg.child("step_0").rel(), Path::new("slurm/uid_1000/job_42/step_0"));
    }

    #[test]
    fn test_instantiate_delete() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let cg = Cgroup::new(ControllerKind::Memory, root.path(), "job_1");

        cg.instantiate()?;
        assert!(cg.path().is_dir());

        // A second instantiate of the same path is not an error.
        cg.instantiate()?;

        cg.delete()?;
        assert!(!cg.path().exists());

        // Deleting an already-removed directory is not an error either.
        cg.delete()
    }

    #[test]
    fn test_delete_nonempty_is_not_busy() {
        // On a scratch filesystem a populated directory yields ENOTEMPTY, not EBUSY; only EBUSY
        // maps to Busy.
        let root = tempfile::tempdir().unwrap();
        let cg = Cgroup::new(ControllerKind::Memory, root.path(), "job_1");
        cg.instantiate().unwrap();
        fs::create_dir(cg.path().join("step_0")).unwrap();

        let err = cg.delete().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::WriteFailed { .. }));
    }

    #[test]
    fn test_read_write_param() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let cg = Cgroup::new(ControllerKind::Memory, root.path(), "job_1");
        cg.instantiate()?;

        cg.write_param("memory.limit_in_bytes", 10_485_760_u64)?;
        assert_eq!(cg.read_param("memory.limit_in_bytes")?, b"10485760");
        assert_eq!(cg.read_u64s("memory.limit_in_bytes")?, vec![10_485_760]);

        let err = cg.read_param("memory.does_not_exist").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ReadFailed { .. }));

        Ok(())
    }

    #[test]
    fn test_add_pid_appends() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let cg = Cgroup::new(ControllerKind::Track, root.path(), "step_0");
        cg.instantiate()?;
        fs::write(cg.path().join("cgroup.procs"), "").unwrap();

        cg.add_pid(Pid::from(12345_u32))?;
        // A real cgroup.procs renders one pid per line; the scratch file just accretes digits,
        // which is enough to assert the write went through the right file.
        assert_eq!(cg.pids()?, vec![Pid::from(12345_u32)]);

        Ok(())
    }

    #[test]
    fn test_lock_unlock() -> Result<()> {
        let root = tempfile::tempdir().unwrap();
        let mut cg = Cgroup::new(ControllerKind::Memory, root.path(), "slurm");
        cg.instantiate()?;

        cg.lock()?;
        // Re-locking the held lock is a no-op, not a deadlock.
        cg.lock()?;
        cg.unlock();

        Ok(())
    }

    #[test]
    fn test_parse_proc_cgroup() {
        let content = "\
7:freezer:/slurm/uid_1000/job_42/step_batch
4:cpu,cpuacct:/slurm/uid_1000/job_42/step_batch
2:memory:/
1:name=systemd:/user.slice
";
        assert_eq!(
            parse_proc_cgroup(content, ControllerKind::Track),
            Some(PathBuf::from("slurm/uid_1000/job_42/step_batch"))
        );
        assert_eq!(
            parse_proc_cgroup(content, ControllerKind::Cpuacct),
            Some(PathBuf::from("slurm/uid_1000/job_42/step_batch"))
        );
        assert_eq!(parse_proc_cgroup(content, ControllerKind::Memory), Some(PathBuf::new()));
        assert_eq!(parse_proc_cgroup(content, ControllerKind::Devices), None);
    }
}
