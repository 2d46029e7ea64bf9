use std::{error::Error as StdError, fmt, path::PathBuf};

use crate::v1::{ControllerKind, Level};

/// Result type returned from this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type that can be returned from this crate, in the [`Result::Err`] variant. The lower-level
/// source of this error can be obtained via `source()` method.
///
/// [`Result::Err`]: https://doc.rust-lang.org/std/result/enum.Result.html#variant.Err
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

/// Kinds of errors that can occur while operating on the cgroup hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An operation required a controller that `initialize` was not called for.
    NotInitialized(ControllerKind),

    /// The subsystem directory for a controller is not mounted.
    NotMounted(ControllerKind),

    /// The controller root could not be set up at `initialize`.
    MountFailed(ControllerKind),

    /// A level of the step hierarchy could not be instantiated on disk. The levels already created
    /// by the same call were rolled back; sibling levels were left alone.
    CreateFailed(Level),

    /// A write to a cgroup pseudo-file was rejected by the kernel.
    WriteFailed {
        /// File the write was addressed to.
        path: PathBuf,
        /// Kernel errno, when the failure came from a system call.
        errno: Option<i32>,
    },

    /// A cgroup pseudo-file could not be opened or read.
    ReadFailed {
        /// File the read was addressed to.
        path: PathBuf,
    },

    /// `rmdir` returned `EBUSY`; the cgroup still holds tasks or kernel-internal references.
    Busy {
        /// The directory that could not be removed.
        path: PathBuf,
    },

    /// A task-level operation referenced a task id with no task cgroup.
    UnknownTask(u32),

    /// The operation is not defined for this controller.
    Unsupported(ControllerKind),

    /// The OOM notification machinery (eventfd / `cgroup.event_control`) could not be armed.
    OomSetupFailed,

    /// A field read from a cgroup pseudo-file did not parse.
    ParseFailed {
        /// File name the contents came from.
        file: String,
        /// The field or key that failed to parse.
        field: String,
    },
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self.source {
            Some(ref x) => Some(&**x),
            None => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::NotInitialized(kind) => {
                write!(f, "controller {} is not initialized", kind)?;
            }
            ErrorKind::NotMounted(kind) => {
                write!(f, "subsystem {} is not mounted", kind)?;
            }
            ErrorKind::MountFailed(kind) => {
                write!(f, "unable to set up the {} controller root", kind)?;
            }
            ErrorKind::CreateFailed(level) => {
                write!(f, "unable to create the {:?}-level cgroup", level)?;
            }
            ErrorKind::WriteFailed { ref path, errno } => {
                write!(f, "unable to write to {}", path.display())?;
                if let Some(errno) = errno {
                    write!(f, " (errno {})", errno)?;
                }
            }
            ErrorKind::ReadFailed { ref path } => {
                write!(f, "unable to read {}", path.display())?;
            }
            ErrorKind::Busy { ref path } => {
                write!(f, "{} is busy", path.display())?;
            }
            ErrorKind::UnknownTask(id) => {
                write!(f, "no task cgroup for task id {}", id)?;
            }
            ErrorKind::Unsupported(kind) => {
                write!(f, "operation is not supported on the {} controller", kind)?;
            }
            ErrorKind::OomSetupFailed => {
                f.write_str("unable to arm OOM event notification")?;
            }
            ErrorKind::ParseFailed { ref file, ref field } => {
                write!(f, "unable to parse field `{}` in {}", field, file)?;
            }
        }

        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }

        Ok(())
    }
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn with_source<E>(kind: ErrorKind, source: E) -> Self
    where
        E: StdError + Sync + Send + 'static,
    {
        Self {
            kind,
            source: Some(Box::new(source)),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::with_source(ErrorKind::ReadFailed { path: path.into() }, source)
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let errno = source.raw_os_error();
        Self::with_source(
            ErrorKind::WriteFailed {
                path: path.into(),
                errno,
            },
            source,
        )
    }

    pub(crate) fn parse(file: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseFailed {
            file: file.into(),
            field: field.into(),
        })
    }
}
