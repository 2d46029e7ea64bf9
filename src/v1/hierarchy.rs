//! Creation and teardown of the user/job/step levels of one controller hierarchy.

use log::warn;

use crate::{Error, ErrorKind, Result};

use super::{cgroup::Cgroup, JobSpec, Level};

/// Handles returned by a successful [`build`].
#[derive(Debug)]
pub(crate) struct StepHandles {
    pub(crate) user: Cgroup,
    pub(crate) job: Cgroup,
    pub(crate) step: Cgroup,
}

/// Creates `uid_<U>/job_<J>/step_<S>` under the slurm cgroup, in order.
///
/// User and job levels stay root-owned; the step directory is owned by the job's user so the
/// step can manage its own task attachment. On failure the levels this call just created are
/// removed again (best-effort: a level shared with a sibling step is busy and stays), and the
/// failing level is reported. Sibling directories are never touched.
pub(crate) fn build(slurm: &Cgroup, job: &JobSpec) -> Result<StepHandles> {
    let user_cg = slurm.child(&job.user_dir());
    let job_cg = user_cg.child(&job.job_dir());
    let step_cg = job_cg.child(&job.step_dir()).with_owner(job.uid, job.gid);

    let levels = [
        (Level::User, &user_cg),
        (Level::Job, &job_cg),
        (Level::Step, &step_cg),
    ];

    for (i, (level, cg)) in levels.iter().enumerate() {
        if let Err(e) = cg.instantiate() {
            rollback(&levels[..=i]);
            return Err(Error::with_source(ErrorKind::CreateFailed(*level), e));
        }
        if let Err(e) = cg.set_notify_on_release(false) {
            // The kernel default may already be 0; a failed write here must not kill the step.
            warn!("cannot clear notify_on_release on {}: {}", cg.path().display(), e);
        }
    }

    Ok(StepHandles {
        user: user_cg,
        job: job_cg,
        step: step_cg,
    })
}

fn rollback(created: &[(Level, &Cgroup)]) {
    for (_, cg) in created.iter().rev() {
        if let Err(e) = cg.delete() {
            warn!("rollback of {} failed: {}", cg.path().display(), e);
        }
    }
}

/// Removes the step hierarchy, deepest first.
///
/// Only the step directory is a hard failure (`Busy` surfaces to the caller); job and user
/// removal failures are expected while sibling steps of the same job or user still live, and are
/// logged and swallowed.
pub(crate) fn teardown(handles: &StepHandles) -> Result<()> {
    handles.step.delete()?;

    if let Err(e) = handles.job.delete() {
        warn!("leaving job cgroup {} in place: {}", handles.job.path().display(), e);
    }
    if let Err(e) = handles.user.delete() {
        warn!("leaving user cgroup {} in place: {}", handles.user.path().display(), e);
    }

    Ok(())
}
