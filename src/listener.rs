//! Accept-loop notifier for listening sockets.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use log::warn;

use crate::event_loop::EventLoop;
use crate::handle::set_nonblock;
use crate::notifier::{AsNotifier, Notify, NotifierBase, NotifierRef};
use crate::stream::Stream;
use crate::{Error, Interest, Result};

type FdAcceptor = Box<dyn FnMut(&mut EventLoop, OwnedFd)>;
type StreamAcceptor = Box<dyn FnMut(&mut EventLoop, Stream)>;
type StreamFactory = Box<dyn FnMut(&mut EventLoop, OwnedFd) -> Result<Stream>>;
type AcceptErrorCallback = Box<dyn FnMut(&mut EventLoop, &Listener, io::Error)>;

enum Acceptor {
    /// Hand over the accepted socket as-is.
    Fd(FdAcceptor),
    /// Wrap the accepted socket in a detached [`Stream`] and hand that
    /// over.
    Stream(StreamAcceptor),
    /// Build the wrapper through a factory; the result is adopted as a
    /// child of the listener.
    Factory(StreamFactory),
}

/// A notifier that accepts connections from a listening socket.
///
/// Each readable event runs a non-blocking accept loop: every accepted
/// socket is delivered through the configured acceptor until the kernel
/// reports wouldblock. Exactly one acceptor variant is configured at a
/// time; installing another replaces it.
///
/// Accept failures other than wouldblock raise `on_accept_error` when
/// configured and are otherwise logged and dropped.
#[derive(Clone)]
pub struct Listener {
    core: Rc<RefCell<ListenerCore>>,
}

pub(crate) struct ListenerCore {
    base: NotifierBase,
    self_weak: Weak<RefCell<ListenerCore>>,
    fd: Option<Rc<OwnedFd>>,
    acceptor: Option<Acceptor>,
    on_accept_error: Option<AcceptErrorCallback>,
}

impl Listener {
    /// Returns a listener with no socket bound.
    pub fn new() -> Listener {
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(ListenerCore {
                base: NotifierBase::new(),
                self_weak: weak.clone(),
                fd: None,
                acceptor: None,
                on_accept_error: None,
            })
        });
        Listener { core }
    }

    /// Binds an already-listening socket and puts it into non-blocking
    /// mode.
    pub fn set_listener(&self, lp: &mut EventLoop, fd: OwnedFd) -> Result<()> {
        set_nonblock(fd.as_raw_fd()).map_err(|e| Error::io("set_nonblock", e))?;
        self.core.borrow_mut().fd = Some(Rc::new(fd));
        self.rearm(lp)
    }

    /// The raw listening descriptor, if bound.
    pub fn listen_fd(&self) -> Option<RawFd> {
        self.core.borrow().fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Delivers each accepted connection as a raw descriptor.
    pub fn on_fd<F>(&self, lp: &mut EventLoop, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, OwnedFd) + 'static,
    {
        self.core.borrow_mut().acceptor = Some(Acceptor::Fd(Box::new(callback)));
        self.rearm(lp)
    }

    /// Delivers each accepted connection wrapped in a detached
    /// [`Stream`]; the callback configures and attaches it.
    pub fn on_stream<F>(&self, lp: &mut EventLoop, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, Stream) + 'static,
    {
        self.core.borrow_mut().acceptor = Some(Acceptor::Stream(Box::new(callback)));
        self.rearm(lp)
    }

    /// Builds the wrapper for each accepted connection through
    /// `factory` and adopts it as a child of this listener, so it
    /// detaches together with the listener.
    pub fn with_factory<F>(&self, lp: &mut EventLoop, factory: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, OwnedFd) -> Result<Stream> + 'static,
    {
        self.core.borrow_mut().acceptor = Some(Acceptor::Factory(Box::new(factory)));
        self.rearm(lp)
    }

    /// Installs the accept-failure callback.
    pub fn on_accept_error<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop, &Listener, io::Error) + 'static,
    {
        self.core.borrow_mut().on_accept_error = Some(Box::new(callback));
        self
    }

    /// Closes the listening socket and removes the listener from its
    /// parent or loop.
    pub fn close(&self, lp: &mut EventLoop) {
        {
            let mut core = self.core.borrow_mut();
            if core.base.is_attached() {
                core.disarm(lp);
            }
            core.fd = None;
        }
        lp.orphan(&self.notifier_ref());
    }

    fn rearm(&self, lp: &mut EventLoop) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.rearm(lp)
    }
}

impl Default for Listener {
    fn default() -> Listener {
        Listener::new()
    }
}

impl AsNotifier for Listener {
    fn notifier_ref(&self) -> NotifierRef {
        self.core.clone()
    }
}

impl ListenerCore {
    fn rearm(&mut self, lp: &mut EventLoop) -> Result<()> {
        if !self.base.is_attached() || self.acceptor.is_none() {
            return Ok(());
        }
        let Some(fd) = self.fd.as_ref().map(|fd| fd.as_raw_fd()) else {
            return Ok(());
        };
        let weak = self.self_weak.clone();
        lp.watch_io(fd, Interest::READABLE, move |lp| {
            if let Some(core) = weak.upgrade() {
                ListenerCore::read_ready(&core, lp);
            }
        })
    }

    fn disarm(&mut self, lp: &mut EventLoop) {
        if let Some(fd) = self.fd.as_ref().map(|fd| fd.as_raw_fd()) {
            let _ = lp.unwatch_io(fd, Interest::READABLE);
        }
    }

    fn read_ready(core: &Rc<RefCell<ListenerCore>>, lp: &mut EventLoop) {
        loop {
            let Some(fd) = core.borrow().fd.as_ref().map(|fd| fd.as_raw_fd()) else {
                return;
            };
            let accepted = match accept_nonblock(fd) {
                Ok(sock) => sock,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    ListenerCore::deliver_error(core, lp, e);
                    return;
                }
            };
            ListenerCore::deliver(core, lp, accepted);
        }
    }

    fn deliver(core: &Rc<RefCell<ListenerCore>>, lp: &mut EventLoop, sock: OwnedFd) {
        let acceptor = core.borrow_mut().acceptor.take();
        let Some(mut acceptor) = acceptor else {
            // No acceptor configured; the socket closes on drop.
            return;
        };
        match &mut acceptor {
            Acceptor::Fd(cb) => cb(lp, sock),
            Acceptor::Stream(cb) => {
                let stream = Stream::new();
                match stream.set_handle(lp, sock) {
                    Ok(()) => cb(lp, stream),
                    Err(e) => warn!("failed to wrap accepted socket: {}", e),
                }
            }
            Acceptor::Factory(build) => match build(lp, sock) {
                Ok(stream) => {
                    let listener = Listener { core: core.clone() };
                    if let Err(e) = lp.add_child(&listener, &stream) {
                        warn!("failed to adopt accepted stream: {}", e);
                    }
                }
                Err(e) => warn!("accept factory failed: {}", e),
            },
        }
        let mut guard = core.borrow_mut();
        if guard.acceptor.is_none() {
            guard.acceptor = Some(acceptor);
        }
    }

    fn deliver_error(core: &Rc<RefCell<ListenerCore>>, lp: &mut EventLoop, err: io::Error) {
        let cb = core.borrow_mut().on_accept_error.take();
        match cb {
            Some(mut cb) => {
                let listener = Listener { core: core.clone() };
                cb(lp, &listener, err);
                let mut guard = core.borrow_mut();
                if guard.on_accept_error.is_none() {
                    guard.on_accept_error = Some(cb);
                }
            }
            None => warn!("unhandled accept error: {}", err),
        }
    }
}

fn accept_nonblock(fd: RawFd) -> io::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let sock = syscall!(accept4(
        fd,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let sock = {
        let sock = syscall!(accept(fd, std::ptr::null_mut(), std::ptr::null_mut()))?;
        if let Err(e) = set_nonblock(sock) {
            unsafe {
                libc::close(sock);
            }
            return Err(e);
        }
        sock
    };

    // SAFETY: `accept` returned a fresh descriptor owned here.
    Ok(unsafe { OwnedFd::from_raw_fd(sock) })
}

impl Notify for ListenerCore {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NotifierBase {
        &mut self.base
    }

    fn attached(&mut self, lp: &mut EventLoop) {
        if let Err(e) = self.rearm(lp) {
            warn!("failed to arm listener on attach: {}", e);
        }
    }

    fn detached(&mut self, lp: &mut EventLoop) {
        self.disarm(lp);
    }
}
