//! A notifier bound to one or two file descriptors.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use crate::event_loop::EventLoop;
use crate::notifier::{misuse, AsNotifier, Notify, NotifierBase, NotifierRef};
use crate::{Interest, Result};

/// Puts a descriptor into non-blocking mode.
pub(crate) fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}

type ReadyCallback = Box<dyn FnMut(&mut EventLoop, &Handle)>;

/// A notifier with an optional read descriptor and an optional write
/// descriptor (one descriptor may serve as both), plus two interest
/// toggles.
///
/// Setting [`want_readready`] or [`want_writeready`] while the handle is
/// attached immediately installs or removes the corresponding descriptor
/// watch; while detached the flag is remembered and armed on attach.
/// Readiness invokes the `on_read_ready` / `on_write_ready` callbacks.
///
/// The handle owns its descriptors and closes them in [`close`] or on
/// drop of the last clone.
///
/// [`want_readready`]: Handle::want_readready
/// [`want_writeready`]: Handle::want_writeready
/// [`close`]: Handle::close
#[derive(Clone)]
pub struct Handle {
    core: Rc<RefCell<HandleCore>>,
}

pub(crate) struct HandleCore {
    base: NotifierBase,
    self_weak: Weak<RefCell<HandleCore>>,
    read_fd: Option<Rc<OwnedFd>>,
    write_fd: Option<Rc<OwnedFd>>,
    want_read: bool,
    want_write: bool,
    on_read_ready: Option<ReadyCallback>,
    on_write_ready: Option<ReadyCallback>,
}

impl Handle {
    /// Returns a handle with no descriptors bound.
    pub fn new() -> Handle {
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(HandleCore {
                base: NotifierBase::new(),
                self_weak: weak.clone(),
                read_fd: None,
                write_fd: None,
                want_read: false,
                want_write: false,
                on_read_ready: None,
                on_write_ready: None,
            })
        });
        Handle { core }
    }

    /// Binds one descriptor for both directions.
    pub fn set_handle(&self, lp: &mut EventLoop, fd: OwnedFd) -> Result<()> {
        let fd = Rc::new(fd);
        self.replace_fd(lp, Some(fd.clone()), Interest::READABLE)?;
        self.replace_fd(lp, Some(fd), Interest::WRITABLE)
    }

    /// Binds the read-side descriptor.
    pub fn set_read_handle(&self, lp: &mut EventLoop, fd: OwnedFd) -> Result<()> {
        self.replace_fd(lp, Some(Rc::new(fd)), Interest::READABLE)
    }

    /// Binds the write-side descriptor.
    pub fn set_write_handle(&self, lp: &mut EventLoop, fd: OwnedFd) -> Result<()> {
        self.replace_fd(lp, Some(Rc::new(fd)), Interest::WRITABLE)
    }

    fn replace_fd(&self, lp: &mut EventLoop, fd: Option<Rc<OwnedFd>>, dir: Interest) -> Result<()> {
        let rearm = {
            let mut core = self.core.borrow_mut();
            let want = if dir.is_readable() {
                core.want_read
            } else {
                core.want_write
            };
            let armed = core.base.is_attached() && want;
            if armed {
                core.disarm(lp, dir);
            }
            if dir.is_readable() {
                core.read_fd = fd;
            } else {
                core.write_fd = fd;
            }
            armed
        };
        if rearm {
            self.core.borrow_mut().arm(lp, dir)?;
        }
        Ok(())
    }

    /// The raw read descriptor, if bound.
    pub fn read_fd(&self) -> Option<RawFd> {
        self.core.borrow().read_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// The raw write descriptor, if bound.
    pub fn write_fd(&self) -> Option<RawFd> {
        self.core
            .borrow()
            .write_fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
    }

    /// Installs the read-readiness callback.
    pub fn on_read_ready<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop, &Handle) + 'static,
    {
        self.core.borrow_mut().on_read_ready = Some(Box::new(callback));
        self
    }

    /// Installs the write-readiness callback.
    pub fn on_write_ready<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop, &Handle) + 'static,
    {
        self.core.borrow_mut().on_write_ready = Some(Box::new(callback));
        self
    }

    /// Toggles read interest. Requires a bound read descriptor.
    pub fn want_readready(&self, lp: &mut EventLoop, want: bool) -> Result<()> {
        self.set_want(lp, Interest::READABLE, want)
    }

    /// Toggles write interest. Requires a bound write descriptor.
    pub fn want_writeready(&self, lp: &mut EventLoop, want: bool) -> Result<()> {
        self.set_want(lp, Interest::WRITABLE, want)
    }

    fn set_want(&self, lp: &mut EventLoop, dir: Interest, want: bool) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if want {
            let bound = if dir.is_readable() {
                core.read_fd.is_some()
            } else {
                core.write_fd.is_some()
            };
            if !bound {
                return Err(misuse("interest requires a bound descriptor"));
            }
        }
        let flag = if dir.is_readable() {
            &mut core.want_read
        } else {
            &mut core.want_write
        };
        let was = std::mem::replace(flag, want);
        if was == want || !core.base.is_attached() {
            return Ok(());
        }
        if want {
            core.arm(lp, dir)
        } else {
            core.disarm(lp, dir);
            Ok(())
        }
    }

    /// Returns true while the handle is a member of a loop.
    pub fn is_attached(&self) -> bool {
        self.core.borrow().base.is_attached()
    }

    /// Disarms the watches, closes both descriptors and removes the
    /// handle from its parent or loop.
    pub fn close(&self, lp: &mut EventLoop) {
        {
            let mut core = self.core.borrow_mut();
            if core.base.is_attached() {
                core.disarm(lp, Interest::READABLE);
                core.disarm(lp, Interest::WRITABLE);
            }
            core.want_read = false;
            core.want_write = false;
            core.read_fd = None;
            core.write_fd = None;
        }
        lp.orphan(&self.notifier_ref());
    }
}

impl Default for Handle {
    fn default() -> Handle {
        Handle::new()
    }
}

impl HandleCore {
    fn fd_for(&self, dir: Interest) -> Option<RawFd> {
        let fd = if dir.is_readable() {
            self.read_fd.as_ref()
        } else {
            self.write_fd.as_ref()
        };
        fd.map(|fd| fd.as_raw_fd())
    }

    fn arm(&mut self, lp: &mut EventLoop, dir: Interest) -> Result<()> {
        let fd = self
            .fd_for(dir)
            .ok_or_else(|| misuse("interest requires a bound descriptor"))?;
        let weak = self.self_weak.clone();
        if dir.is_readable() {
            lp.watch_io(fd, Interest::READABLE, move |lp| {
                if let Some(core) = weak.upgrade() {
                    HandleCore::ready(&core, lp, Interest::READABLE);
                }
            })
        } else {
            lp.watch_io(fd, Interest::WRITABLE, move |lp| {
                if let Some(core) = weak.upgrade() {
                    HandleCore::ready(&core, lp, Interest::WRITABLE);
                }
            })
        }
    }

    fn disarm(&mut self, lp: &mut EventLoop, dir: Interest) {
        if let Some(fd) = self.fd_for(dir) {
            let _ = lp.unwatch_io(fd, dir);
        }
    }

    fn ready(core: &Rc<RefCell<HandleCore>>, lp: &mut EventLoop, dir: Interest) {
        // The callback is lifted out of the core for the call so it can
        // freely mutate the handle it belongs to.
        let cb = {
            let mut guard = core.borrow_mut();
            if dir.is_readable() {
                guard.on_read_ready.take()
            } else {
                guard.on_write_ready.take()
            }
        };
        let Some(mut cb) = cb else { return };
        let handle = Handle { core: core.clone() };
        cb(lp, &handle);
        let mut guard = core.borrow_mut();
        let slot = if dir.is_readable() {
            &mut guard.on_read_ready
        } else {
            &mut guard.on_write_ready
        };
        if slot.is_none() {
            *slot = Some(cb);
        }
    }
}

impl Notify for HandleCore {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NotifierBase {
        &mut self.base
    }

    fn attached(&mut self, lp: &mut EventLoop) {
        if self.want_read {
            if let Err(e) = self.arm(lp, Interest::READABLE) {
                log::warn!("failed to arm read interest on attach: {}", e);
            }
        }
        if self.want_write {
            if let Err(e) = self.arm(lp, Interest::WRITABLE) {
                log::warn!("failed to arm write interest on attach: {}", e);
            }
        }
    }

    fn detached(&mut self, lp: &mut EventLoop) {
        self.disarm(lp, Interest::READABLE);
        self.disarm(lp, Interest::WRITABLE);
    }
}

impl AsNotifier for Handle {
    fn notifier_ref(&self) -> NotifierRef {
        self.core.clone()
    }
}
