//! Per-step out-of-memory event monitoring.
//!
//! The kernel's v1 OOM notification is armed by registering an eventfd against
//! `memory.oom_control` through `cgroup.event_control`. One background thread per step blocks in
//! `poll` on the eventfd and a stop pipe; every wakeup on the eventfd delivers an 8-byte counter
//! of OOM kills since the last read, accumulated under a mutex. The only cancellation path is
//! the stop pipe; the monitor ignores process signals beyond what `poll` itself surfaces.

use std::{
    fs,
    io::Write as _,
    os::unix::io::{AsRawFd, RawFd},
    sync::{Arc, Mutex},
    thread,
};

use log::{debug, error, warn};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    poll::{poll, PollFd, PollFlags},
    sys::eventfd::{eventfd, EfdFlags},
    unistd::{close, pipe2, read, write},
};

use crate::{parse, Error, ErrorKind, Result};

use super::cgroup::Cgroup;

const OOM_CONTROL: &str = "memory.oom_control";
const EVENT_CONTROL: &str = "cgroup.event_control";
const MEM_FAILCNT: &str = "memory.failcnt";
const MEMSW_FAILCNT: &str = "memory.memsw.failcnt";

/// Sentinel written down the stop pipe to end the event loop.
const STOP_OOM: u64 = 0x987_987_987;

/// Out-of-memory totals for one step, produced by [`Manager::stop_oom_mgr`].
///
/// Fail counters are point-in-time snapshots of `memory.failcnt` / `memory.memsw.failcnt` at the
/// step and job levels; a missing counter file reads as zero. `oom_kill_count` is the number of
/// kernel OOM kill events delivered while the monitor ran.
///
/// [`Manager::stop_oom_mgr`]: super::Manager::stop_oom_mgr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OomReport {
    /// `memory.failcnt` of the step cgroup.
    pub step_mem_failcnt: u64,
    /// `memory.memsw.failcnt` of the step cgroup.
    pub step_memsw_failcnt: u64,
    /// `memory.failcnt` of the job cgroup.
    pub job_mem_failcnt: u64,
    /// `memory.memsw.failcnt` of the job cgroup.
    pub job_memsw_failcnt: u64,
    /// OOM kill events observed between start and stop.
    pub oom_kill_count: u64,
}

/// A running OOM monitor: the background thread, the write end of its stop pipe, and the shared
/// kill counter.
///
/// The stop pipe and the join handle live in the same value so the thread can never be
/// abandoned: [`OomMonitor::stop`] is the intended path, and `Drop` performs the same shutdown
/// while flagging the omission as a bug.
#[derive(Debug)]
pub(crate) struct OomMonitor {
    handle: Option<thread::JoinHandle<()>>,
    stop_w: RawFd,
    kill_count: Arc<Mutex<u64>>,
    #[cfg(test)]
    pub(crate) event_fd: RawFd,
}

impl OomMonitor {
    /// Arms OOM notification on the step's memory cgroup and spawns the event loop.
    pub(crate) fn start(step: &Cgroup) -> Result<Self> {
        let oom_setup = |e: std::io::Error| Error::with_source(ErrorKind::OomSetupFailed, e);
        let oom_setup_nix = |e: Errno| {
            Error::with_source(ErrorKind::OomSetupFailed, std::io::Error::from_raw_os_error(e as i32))
        };

        // The oom_control descriptor must stay open for as long as the notification is armed;
        // the event loop holds it until shutdown.
        let control = fs::File::open(step.path().join(OOM_CONTROL)).map_err(oom_setup)?;

        let event_fd = eventfd(0, EfdFlags::EFD_CLOEXEC).map_err(oom_setup_nix)?;

        let mut event_control = fs::OpenOptions::new()
            .write(true)
            .open(step.path().join(EVENT_CONTROL))
            .map_err(|e| {
                let _ = close(event_fd);
                oom_setup(e)
            })?;
        // "<eventfd> <oom_control_fd>", no terminator; the kernel arms on this write.
        write!(event_control, "{} {}", event_fd, control.as_raw_fd()).map_err(|e| {
            let _ = close(event_fd);
            oom_setup(e)
        })?;
        drop(event_control);

        let (stop_r, stop_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| {
            let _ = close(event_fd);
            oom_setup_nix(e)
        })?;

        let kill_count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&kill_count);
        let handle = thread::Builder::new()
            .name("oom-monitor".into())
            .spawn(move || event_loop(event_fd, stop_r, control, &counter))
            .map_err(|e| {
                let _ = close(event_fd);
                let _ = close(stop_r);
                let _ = close(stop_w);
                oom_setup(e)
            })?;

        debug!("oom monitor armed on {}", step.path().display());
        Ok(Self {
            handle: Some(handle),
            stop_w,
            kill_count,
            #[cfg(test)]
            event_fd,
        })
    }

    /// Snapshots the fail counters, shuts the event loop down, and produces the report.
    ///
    /// The counters are read before the monitor stops so a kill arriving during shutdown is
    /// still visible in `failcnt` even when the event races the stop. A stop-write failure means
    /// the loop is already gone; the join still happens and the report is still produced.
    pub(crate) fn stop(mut self, step: Option<&Cgroup>, job: Option<&Cgroup>) -> OomReport {
        let report = OomReport {
            step_mem_failcnt: failcnt(step, MEM_FAILCNT),
            step_memsw_failcnt: failcnt(step, MEMSW_FAILCNT),
            job_mem_failcnt: failcnt(job, MEM_FAILCNT),
            job_memsw_failcnt: failcnt(job, MEMSW_FAILCNT),
            oom_kill_count: 0,
        };

        self.shutdown();

        OomReport {
            oom_kill_count: *lock_count(&self.kill_count),
            ..report
        }
    }

    fn shutdown(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };

        if let Err(e) = write_u64(self.stop_w, STOP_OOM) {
            debug!("oom monitor stop pipe already closed: {}", e);
        }
        if handle.join().is_err() {
            error!("oom monitor thread panicked");
        }
        let _ = close(self.stop_w);
    }
}

impl Drop for OomMonitor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            error!("oom monitor dropped without stop_oom_mgr; shutting it down");
            self.shutdown();
        }
    }
}

fn event_loop(event_fd: RawFd, stop_r: RawFd, control: fs::File, kill_count: &Mutex<u64>) {
    let hangup = PollFlags::POLLHUP
        | PollFlags::POLLERR
        | PollFlags::POLLNVAL
        | PollFlags::from_bits_truncate(libc::POLLRDHUP);

    loop {
        let mut fds = [
            PollFd::new(event_fd, PollFlags::POLLIN | PollFlags::POLLPRI),
            PollFd::new(stop_r, PollFlags::POLLIN | PollFlags::from_bits_truncate(libc::POLLRDHUP)),
        ];

        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("oom monitor poll failed: {}", e);
                break;
            }
        }

        let event_revents = fds[0].revents().unwrap_or(PollFlags::empty());
        let stop_revents = fds[1].revents().unwrap_or(PollFlags::empty());

        // Drain the event counter first so a kill racing the stop is still counted.
        if event_revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
            match read_u64(event_fd) {
                Ok(events) => {
                    *lock_count(kill_count) += events;
                }
                Err(e) => {
                    warn!("oom event read failed: {}", e);
                    break;
                }
            }
        }

        if stop_revents.contains(PollFlags::POLLIN) {
            match read_u64(stop_r) {
                Ok(STOP_OOM) => break,
                Ok(other) => debug!("ignoring non-sentinel stop payload {:#x}", other),
                Err(e) => {
                    warn!("oom stop pipe read failed: {}", e);
                    break;
                }
            }
        }

        if event_revents.intersects(hangup) || stop_revents.intersects(hangup) {
            break;
        }
    }

    let _ = close(event_fd);
    let _ = close(stop_r);
    drop(control);
}

/// Reads one 8-byte little-endian counter, retrying on `EINTR` and reassembling partial reads.
fn read_u64(fd: RawFd) -> nix::Result<u64> {
    let mut buf = [0_u8; 8];
    let mut off = 0;
    while off < buf.len() {
        match read(fd, &mut buf[off..]) {
            Ok(0) => return Err(Errno::EPIPE),
            Ok(n) => off += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(u64::from_le_bytes(buf))
}

/// Writes one 8-byte little-endian value, retrying on `EINTR` and partial writes.
fn write_u64(fd: RawFd, value: u64) -> nix::Result<()> {
    let buf = value.to_le_bytes();
    let mut off = 0;
    while off < buf.len() {
        match write(fd, &buf[off..]) {
            Ok(n) => off += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn failcnt(cg: Option<&Cgroup>, file: &str) -> u64 {
    // A missing counter file (no step, no swap accounting) reads as zero, not as an error.
    cg.and_then(|cg| cg.read_param(file).ok())
        .and_then(|bytes| parse::parse::<u64>(&bytes, file).ok())
        .unwrap_or(0)
}

fn lock_count(count: &Mutex<u64>) -> std::sync::MutexGuard<'_, u64> {
    match count.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
