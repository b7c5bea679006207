// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io, path::PathBuf, process::Output, time::Duration};

use nix::errno::Errno;
use strum_macros::Display;

pub type PackerResult<T> = Result<T, PackerError>;

/// How a failed device-mapper task was classified by the kernel's errno.
/// Busy and AlreadyExists are the two conditions that callers may recover
/// from by retrying; everything else is Other.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum TaskFailureKind {
    Busy,
    AlreadyExists,
    Other,
}

impl From<Errno> for TaskFailureKind {
    fn from(errno: Errno) -> TaskFailureKind {
        match errno {
            Errno::EBUSY => TaskFailureKind::Busy,
            Errno::EEXIST => TaskFailureKind::AlreadyExists,
            _ => TaskFailureKind::Other,
        }
    }
}

/// A device-mapper task that did not complete.
#[derive(Debug)]
pub struct TaskError {
    /// The name of the device the task was issued against.
    pub name: String,
    pub kind: TaskFailureKind,
    pub message: String,
}

impl TaskError {
    pub fn new(name: &str, kind: TaskFailureKind, message: String) -> TaskError {
        TaskError {
            name: name.to_owned(),
            kind,
            message,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task on {} failed ({}): {}", self.name, self.kind, self.message)
    }
}

#[derive(Debug)]
pub enum PackerError {
    Msg(String),
    Chained(String, Box<PackerError>),

    /// No loop device node was free to bind.
    NoFreeLoopDevice,
    /// The kernel refused to bind a backing file to the loop node.
    BindFailure {
        loop_path: PathBuf,
        source: Errno,
    },
    /// The device could not be created or its table could not be loaded.
    TaskCreateFailure(TaskError),
    /// A created task failed when it was run.
    TaskRunFailure(TaskError),
    /// udev never confirmed the existence of the device node.
    SyncTimeout {
        name: String,
        waited: Duration,
    },
    /// Every candidate thin id was already in use by the pool.
    Collision {
        first_candidate: u32,
        attempts: usize,
    },
    /// The device remained busy for every removal attempt.
    Busy {
        name: String,
        attempts: u64,
    },
    /// An operation was requested on a thin device in a state that does not
    /// permit it.
    InvalidState {
        id: u32,
        state: String,
        operation: &'static str,
    },
    Config(String),
    BinariesNotFound {
        names: Vec<String>,
        locations: Vec<String>,
    },
    CommandFailure {
        cmd: String,
        output: Output,
    },
    /// Undoing a partially completed operation failed. The error that
    /// caused the undo is retained along with every undo failure.
    RollbackError {
        causal_error: Box<PackerError>,
        rollback_errors: Vec<PackerError>,
    },
    /// Some resources could not be released during teardown.
    Teardown(Vec<PackerError>),

    Io(io::Error),
    Nix(nix::Error),
    DM(devicemapper::DmError),
    Serde(serde_json::Error),
}

impl PackerError {
    /// The classification of a failed device-mapper task, if this error, or
    /// the error it wraps, is one.
    pub fn task_failure_kind(&self) -> Option<TaskFailureKind> {
        match self {
            PackerError::TaskCreateFailure(err) | PackerError::TaskRunFailure(err) => {
                Some(err.kind)
            }
            PackerError::Chained(_, err) => err.task_failure_kind(),
            _ => None,
        }
    }
}

impl fmt::Display for PackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackerError::Msg(s) => write!(f, "{s}"),
            PackerError::Chained(s, err) => write!(f, "{s}; caused by: {err}"),
            PackerError::NoFreeLoopDevice => write!(f, "no free loop device available"),
            PackerError::BindFailure { loop_path, source } => write!(
                f,
                "failed to bind backing file to loop device {}: {}",
                loop_path.display(),
                source
            ),
            PackerError::TaskCreateFailure(err) => write!(f, "failed to create dm task: {err}"),
            PackerError::TaskRunFailure(err) => write!(f, "failed to run dm task: {err}"),
            PackerError::SyncTimeout { name, waited } => write!(
                f,
                "udev did not confirm device node for {name} within {waited:?}"
            ),
            PackerError::Collision {
                first_candidate,
                attempts,
            } => write!(
                f,
                "no unused thin id found in {attempts} attempts starting at {first_candidate}"
            ),
            PackerError::Busy { name, attempts } => {
                write!(f, "device {name} still busy after {attempts} attempts")
            }
            PackerError::InvalidState {
                id,
                state,
                operation,
            } => write!(f, "thin device {id} is {state}; can not {operation} it"),
            PackerError::Config(s) => write!(f, "invalid configuration: {s}"),
            PackerError::BinariesNotFound { names, locations } => write!(
                f,
                "executables not found: [{}], locations searched: [{}]",
                names.join(", "),
                locations.join(", ")
            ),
            PackerError::CommandFailure { cmd, output } => write!(
                f,
                "command {} failed. status: {}, stdout: \"{}\", stderr: \"{}\"",
                cmd,
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
            PackerError::RollbackError {
                causal_error,
                rollback_errors,
            } => {
                write!(f, "{causal_error}; rollback also failed: ")?;
                for (index, err) in rollback_errors.iter().enumerate() {
                    if index > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
            PackerError::Teardown(errs) => {
                write!(f, "teardown left {} resources behind", errs.len())?;
                for err in errs {
                    write!(f, "; {err}")?;
                }
                Ok(())
            }
            PackerError::Io(err) => write!(f, "IO error: {err}"),
            PackerError::Nix(err) => write!(f, "Nix error: {err}"),
            PackerError::DM(err) => write!(f, "DM error: {err}"),
            PackerError::Serde(err) => write!(f, "Serde error: {err}"),
        }
    }
}

impl Error for PackerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PackerError::Chained(_, err) => Some(err),
            PackerError::BindFailure { source, .. } => Some(source),
            PackerError::RollbackError { causal_error, .. } => Some(causal_error),
            PackerError::Io(err) => Some(err),
            PackerError::Nix(err) => Some(err),
            PackerError::DM(err) => Some(err),
            PackerError::Serde(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PackerError {
    fn from(err: io::Error) -> PackerError {
        PackerError::Io(err)
    }
}

impl From<nix::Error> for PackerError {
    fn from(err: nix::Error) -> PackerError {
        PackerError::Nix(err)
    }
}

impl From<devicemapper::DmError> for PackerError {
    fn from(err: devicemapper::DmError) -> PackerError {
        PackerError::DM(err)
    }
}

impl From<serde_json::Error> for PackerError {
    fn from(err: serde_json::Error) -> PackerError {
        PackerError::Serde(err)
    }
}

/// Combine the error that caused an undo with the results of the undo
/// steps. If every step succeeded the causal error is returned unchanged.
/// Undo failures of nested rollbacks are gathered under the first cause.
pub fn rollback<I>(causal_error: PackerError, undo_results: I) -> PackerError
where
    I: IntoIterator<Item = PackerResult<()>>,
{
    let mut rollback_errors: Vec<PackerError> =
        undo_results.into_iter().filter_map(Result::err).collect();
    if rollback_errors.is_empty() {
        return causal_error;
    }
    match causal_error {
        PackerError::RollbackError {
            causal_error,
            rollback_errors: mut earlier,
        } => {
            earlier.append(&mut rollback_errors);
            PackerError::RollbackError {
                causal_error,
                rollback_errors: earlier,
            }
        }
        causal_error => PackerError::RollbackError {
            causal_error: Box::new(causal_error),
            rollback_errors,
        },
    }
}
