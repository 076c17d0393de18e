use std::io;

use thiserror::Error;

use crate::worker::WorkerError;

/// A specialized `Result` type for loop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type surfaced by the event loop and its notifiers.
///
/// Every failure carries the kind of operation that produced it together
/// with the underlying OS error or message, so callers can report it
/// without re-deriving context.
#[derive(Debug, Error)]
pub enum Error {
    /// The readiness backend itself failed. Returned from
    /// [`loop_once`](crate::EventLoop::loop_once); the loop's watch tables
    /// are left intact.
    #[error("readiness backend failed: {0}")]
    Backend(#[source] io::Error),

    /// A read, write or registration on a watched descriptor returned a
    /// hard error.
    #[error("{op} failed: {source}")]
    Io {
        /// The operation that failed, e.g. `"sysread"`.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `accept` returned something other than a retriable wouldblock.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// `fork` failed, or the child reported a pre-exec failure through its
    /// error pipe.
    #[error("spawn failed: {message} (errno {errno})")]
    Spawn {
        /// Exception text reported by the child; empty for a plain exec
        /// failure.
        message: String,
        /// The child-side `errno`, or 0 when the failure was not a syscall.
        errno: i32,
    },

    /// A worker-pool call could not complete.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// A bounded wait elapsed before the operation completed.
    #[error("operation timed out")]
    TimedOut,
}

impl Error {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Error {
        Error::Io { op, source }
    }

    /// Returns the underlying OS error, if this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Backend(e) | Error::Accept(e) | Error::Io { source: e, .. } => e.raw_os_error(),
            Error::Spawn { errno, .. } if *errno != 0 => Some(*errno),
            _ => None,
        }
    }
}
