//! Readiness events reported by a backend.

use std::fmt;
use std::ops;

use crate::Token;

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const HANGUP: u8 = 0b0100;
const ERROR: u8 = 0b1000;

/// A set of readiness states.
///
/// `Ready` is a set of operations a descriptor is observed to be ready
/// for. Unlike [`Interest`](crate::Interest) it may be empty and it may
/// carry states that were never asked for: `poll`-family primitives
/// report hangup and error conditions regardless of interest.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct Ready(u8);

impl Ready {
    /// The empty set.
    pub const EMPTY: Ready = Ready(0);
    /// Readable readiness.
    pub const READABLE: Ready = Ready(READABLE);
    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);
    /// The peer closed its end.
    pub const HANGUP: Ready = Ready(HANGUP);
    /// The descriptor is in an error state.
    pub const ERROR: Ready = Ready(ERROR);

    /// Returns true if the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the set includes readable readiness.
    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    /// Returns true if the set includes writable readiness.
    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    /// Returns true if the set includes hangup.
    pub fn is_hangup(self) -> bool {
        self.0 & HANGUP != 0
    }

    /// Returns true if the set includes an error state.
    pub fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        for (flag, name) in [
            (READABLE, "READABLE"),
            (WRITABLE, "WRITABLE"),
            (HANGUP, "HANGUP"),
            (ERROR, "ERROR"),
        ] {
            if self.0 & flag != 0 {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}

/// A readiness event: a [`Ready`] state paired with the [`Token`] the
/// descriptor was registered under.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Event {
    ready: Ready,
    token: Token,
}

impl Event {
    /// Creates a new `Event` containing `ready` and `token`.
    pub fn new(ready: Ready, token: Token) -> Event {
        Event { ready, token }
    }

    /// Returns the event's readiness.
    pub fn readiness(&self) -> Ready {
        self.ready
    }

    /// Returns the event's token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Returns true if the event includes readable readiness.
    pub fn is_readable(&self) -> bool {
        self.ready.is_readable()
    }

    /// Returns true if the event includes writable readiness.
    pub fn is_writable(&self) -> bool {
        self.ready.is_writable()
    }

    /// Returns true if the event reports the peer closing its end.
    pub fn is_hangup(&self) -> bool {
        self.ready.is_hangup()
    }

    /// Returns true if the event reports an error state.
    pub fn is_error(&self) -> bool {
        self.ready.is_error()
    }
}

/// A buffer of readiness events filled by [`Backend::poll`].
///
/// The capacity passed to [`with_capacity`] is a sizing hint carried over
/// between turns; backends may push more events than the hint when more
/// descriptors are ready.
///
/// [`Backend::poll`]: crate::Backend::poll
/// [`with_capacity`]: Events::with_capacity
#[derive(Debug, Default)]
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    /// Returns an empty `Events` buffer with the given capacity hint.
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of events in the buffer.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the buffer holds no events.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Clears the buffer.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Appends an event. Intended for backend implementations.
    pub fn push(&mut self, event: Event) {
        self.inner.push(event);
    }

    /// Iterates over the buffered events.
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        self.inner.iter()
    }

    pub(crate) fn get(&self, index: usize) -> Option<Event> {
        self.inner.get(index).copied()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}
