//! Readiness backends.
//!
//! A backend is the primitive the loop blocks on: it keeps a set of
//! registered descriptors with per-direction interest, sleeps until one of
//! them becomes ready or a deadline elapses, and reports what fired. The
//! loop drives exactly one backend and is otherwise independent of how
//! readiness is detected, so embedders can supply their own (epoll,
//! kqueue, a GUI toolkit main loop) by implementing [`Backend`].
//!
//! The crate ships [`PollBackend`], a portable implementation on top of
//! `poll(2)`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::{Events, Interest};

mod poll;

pub use self::poll::PollBackend;

/// The backend interface version this crate was built against.
///
/// [`Backend::api_version`] must return at least this value; the loop
/// refuses to construct with an older backend.
pub const BACKEND_API_VERSION: u32 = 1;

/// A readiness-polling primitive the loop can block on.
///
/// Registration is incremental per direction: [`watch_io`] adds the given
/// directions to whatever is already registered for the descriptor, and
/// [`unwatch_io`] removes only the named ones. The backend keeps the
/// union.
///
/// [`watch_io`]: Backend::watch_io
/// [`unwatch_io`]: Backend::unwatch_io
pub trait Backend {
    /// Returns the backend interface version the implementation targets.
    fn api_version(&self) -> u32;

    /// Returns true if the backend can report hangup as a distinct
    /// readiness state.
    fn supports_hangup(&self) -> bool {
        false
    }

    /// Adds `interest` to the directions registered for `fd`.
    fn watch_io(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Removes `which` from the directions registered for `fd`, dropping
    /// the registration entirely when nothing remains. Unknown
    /// descriptors are a no-op.
    fn unwatch_io(&mut self, fd: RawFd, which: Interest) -> io::Result<()>;

    /// Blocks until at least one registered descriptor is ready or
    /// `timeout` elapses, pushing one [`Event`](crate::Event) per ready
    /// descriptor into `events`. `None` blocks indefinitely.
    ///
    /// Interruption by a signal is not an error: implementations return
    /// with whatever (possibly zero) events were gathered, so a signal
    /// proxy poked from the handler is observed on the following turn.
    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()>;
}
