use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::trace;

use crate::event::Ready;
use crate::{Event, Events, Interest, Token};

use super::{Backend, BACKEND_API_VERSION};

/// A portable readiness backend on top of `poll(2)`.
///
/// Registered descriptors are kept in a descriptor-keyed table and
/// rebuilt into a `pollfd` vector on each [`poll`](Backend::poll) call.
/// That is linear in the number of watches, which is the right trade for
/// the watch counts a cooperative loop handles; a kernel-side set such as
/// epoll only pays off once registrations outlive many turns.
#[derive(Debug, Default)]
pub struct PollBackend {
    interests: HashMap<RawFd, Interest>,
    // Scratch vector reused across calls.
    pollfds: Vec<libc::pollfd>,
}

impl PollBackend {
    /// Returns a backend with no registrations.
    pub fn new() -> PollBackend {
        PollBackend::default()
    }

    /// Returns the interest currently registered for `fd`, if any.
    pub fn registered(&self, fd: RawFd) -> Option<Interest> {
        self.interests.get(&fd).copied()
    }

    /// Returns the number of registered descriptors.
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    /// Returns true if no descriptors are registered.
    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}

impl Backend for PollBackend {
    fn api_version(&self) -> u32 {
        BACKEND_API_VERSION
    }

    fn supports_hangup(&self) -> bool {
        true
    }

    fn watch_io(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        trace!("poll backend: watch fd={} interest={:?}", fd, interest);
        match self.interests.get_mut(&fd) {
            Some(cur) => *cur |= interest,
            None => {
                self.interests.insert(fd, interest);
            }
        }
        Ok(())
    }

    fn unwatch_io(&mut self, fd: RawFd, which: Interest) -> io::Result<()> {
        trace!("poll backend: unwatch fd={} which={:?}", fd, which);
        if let Some(cur) = self.interests.get_mut(&fd) {
            match cur.remove(which) {
                Some(rest) => *cur = rest,
                None => {
                    self.interests.remove(&fd);
                }
            }
        }
        Ok(())
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        self.pollfds.clear();
        for (&fd, &interest) in &self.interests {
            self.pollfds.push(libc::pollfd {
                fd,
                events: interest_to_poll(interest),
                revents: 0,
            });
        }

        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying
                // a zero timeout.
                let to = to.checked_add(Duration::from_nanos(999_999)).unwrap_or(to);
                to.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        let n = match syscall!(poll(self.pollfds.as_mut_ptr(), self.pollfds.len() as _, timeout)) {
            Ok(n) => n,
            // A signal landing mid-sleep is an ordinary wakeup; whatever it
            // made readable (a self-pipe, say) is picked up next turn.
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };

        if n > 0 {
            for pollfd in &self.pollfds {
                let ready = revents_to_ready(pollfd.revents);
                if !ready.is_empty() {
                    events.push(Event::new(ready, Token(pollfd.fd as usize)));
                }
            }
        }
        Ok(())
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.is_writable() {
        kind |= libc::POLLOUT;
    }
    // POLLHUP and POLLERR are always reported; nothing to request.
    kind
}

fn revents_to_ready(revents: libc::c_short) -> Ready {
    let mut ready = Ready::EMPTY;
    if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
        ready |= Ready::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if revents & libc::POLLHUP != 0 {
        // The peer is gone; pending bytes are still readable, so surface
        // this as readable too and let the consumer observe EOF.
        ready |= Ready::HANGUP | Ready::READABLE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        // Deliver error states through both directions so whichever
        // callback is installed gets to see the failing syscall.
        ready |= Ready::ERROR | Ready::READABLE | Ready::WRITABLE;
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_union() {
        let mut backend = PollBackend::new();
        backend.watch_io(5, Interest::READABLE).unwrap();
        backend.watch_io(5, Interest::WRITABLE).unwrap();
        assert_eq!(
            backend.registered(5),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        backend.unwatch_io(5, Interest::READABLE).unwrap();
        assert_eq!(backend.registered(5), Some(Interest::WRITABLE));
        backend.unwatch_io(5, Interest::WRITABLE).unwrap();
        assert_eq!(backend.registered(5), None);
        // Unknown descriptors are a no-op.
        backend.unwatch_io(5, Interest::WRITABLE).unwrap();
    }

    #[test]
    fn ready_mapping() {
        let ready = revents_to_ready(libc::POLLIN | libc::POLLHUP);
        assert!(ready.is_readable());
        assert!(ready.is_hangup());
        assert!(!ready.is_writable());

        let ready = revents_to_ready(libc::POLLERR);
        assert!(ready.is_error());
        assert!(ready.is_readable() && ready.is_writable());
    }
}
