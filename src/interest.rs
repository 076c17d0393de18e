use std::num::NonZeroU8;
use std::{fmt, ops};

const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;
const HANGUP: u8 = 0b100;

/// Interest used when watching a descriptor.
///
/// Interest tells the loop (and, through it, the readiness backend) which
/// directions of readiness to monitor for a descriptor. A watch installed
/// with [`READABLE`] interest will never produce writable events.
///
/// The size of `Option<Interest>` is identical to `Interest` itself.
///
/// [`READABLE`]: Interest::READABLE
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

impl Interest {
    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Interest in the peer closing its end.
    ///
    /// Not every backend can report this; check
    /// [`Backend::supports_hangup`](crate::Backend::supports_hangup)
    /// before requesting it.
    pub const HANGUP: Interest = Interest(unsafe { NonZeroU8::new_unchecked(HANGUP) });

    /// Add together two `Interest`s.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Removes `other` from `self`, returning `None` if nothing is left.
    pub fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    /// Returns true if the value includes read interest.
    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    /// Returns true if the value includes write interest.
    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }

    /// Returns true if the value includes hangup interest.
    pub const fn is_hangup(self) -> bool {
        (self.0.get() & HANGUP) != 0
    }

    /// Returns true if all directions in `other` are present in `self`.
    pub const fn contains(self, other: Interest) -> bool {
        (self.0.get() & other.0.get()) == other.0.get()
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 = (*self | other).0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
            one = true;
        }
        if self.is_hangup() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "HANGUP")?;
            one = true;
        }
        debug_assert!(one, "printing empty interest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_hangup());

        let rd = both.remove(Interest::WRITABLE).unwrap();
        assert_eq!(rd, Interest::READABLE);
        assert!(rd.remove(Interest::READABLE).is_none());
    }

    #[test]
    fn contains() {
        let both = Interest::READABLE.add(Interest::WRITABLE);
        assert!(both.contains(Interest::READABLE));
        assert!(!Interest::READABLE.contains(both));
    }
}
