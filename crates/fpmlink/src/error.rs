use std::error;
use std::fmt::{self, Display, Formatter};

/// Everything the facade can fail with. The worker-scoped variants and
/// `InterrupterUnavailable` are fatal: the runtime loop should let the
/// sandbox die so the platform replaces it. `DeadlineReached` is
/// per-invocation and is never retried.
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// The worker could not be spawned, or exited before its socket appeared.
    WorkerFailedToStart(String),
    /// The worker's socket never appeared within the readiness window.
    WorkerStartTimeout,
    /// A worker left over from a previous sandbox would not die.
    WorkerReclaimTimeout,
    /// The liveness probe found the worker dead.
    WorkerCrashed,
    /// The worker did not shut down within the grace period.
    WorkerStopFailed,
    /// The deadline interrupter has no running timer to arm.
    InterrupterUnavailable,
    /// The platform deadline is about to expire; the request was aborted.
    DeadlineReached,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::WorkerFailedToStart(msg) => write!(f, "worker failed to start: {msg}"),
            Error::WorkerStartTimeout => {
                write!(f, "worker did not create its socket within the readiness window")
            }
            Error::WorkerReclaimTimeout => {
                write!(f, "leftover worker from a previous instance would not terminate")
            }
            Error::WorkerCrashed => write!(f, "worker is no longer running"),
            Error::WorkerStopFailed => {
                write!(f, "worker did not shut down within the grace period")
            }
            Error::InterrupterUnavailable => {
                write!(f, "deadline interrupter has no running timer thread")
            }
            Error::DeadlineReached => {
                write!(f, "invocation aborted ahead of the platform deadline")
            }
        }
    }
}

impl error::Error for Error {}
