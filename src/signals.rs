//! The async-signal-safe bridge between OS signal delivery and the loop.
//!
//! Signal handlers may run at any point, including while the loop is
//! blocked inside the backend syscall, and may only perform
//! async-signal-safe operations. The proxy uses the self-pipe pattern:
//! the OS handler bumps a per-signal counter and, on the counter's zero
//! to one transition, writes a single byte to a non-blocking pipe whose
//! read end the loop watches. The loop then observes delivery as
//! ordinary readable readiness and dispatches callbacks from its normal
//! cooperative context.
//!
//! The handler performs exactly one atomic increment and at most one
//! `write(2)`; no allocation, locking or re-entrant library calls. If
//! the pipe is momentarily full the write is dropped, which is fine: the
//! read end is already readable and the counters are authoritative.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use log::{trace, warn};

use crate::event_loop::{EventLoop, SignalHandlerId};
use crate::notifier::{AsNotifier, Notify, NotifierBase, NotifierRef};

// Signal numbers are 1..=31 on every supported platform.
const MAX_SIGNUM: usize = 32;

const PENDING_ZERO: AtomicUsize = AtomicUsize::new(0);
static PENDING: [AtomicUsize; MAX_SIGNUM] = [PENDING_ZERO; MAX_SIGNUM];
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static PROXY_LIVE: AtomicBool = AtomicBool::new(false);

/// A POSIX signal, by number.
///
/// The associated constants cover the signals a cooperative loop
/// commonly watches; any other catchable signal can be named through
/// [`from_raw`](Signal::from_raw).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Signal(libc::c_int);

impl Signal {
    /// Terminal hangup.
    pub const HUP: Signal = Signal(libc::SIGHUP);
    /// Keyboard interrupt.
    pub const INT: Signal = Signal(libc::SIGINT);
    /// Quit from keyboard.
    pub const QUIT: Signal = Signal(libc::SIGQUIT);
    /// Broken pipe.
    pub const PIPE: Signal = Signal(libc::SIGPIPE);
    /// Alarm clock.
    pub const ALRM: Signal = Signal(libc::SIGALRM);
    /// Termination request.
    pub const TERM: Signal = Signal(libc::SIGTERM);
    /// User-defined signal 1.
    pub const USR1: Signal = Signal(libc::SIGUSR1);
    /// User-defined signal 2.
    pub const USR2: Signal = Signal(libc::SIGUSR2);
    /// Child stopped or terminated.
    pub const CHLD: Signal = Signal(libc::SIGCHLD);
    /// Continue if stopped.
    pub const CONT: Signal = Signal(libc::SIGCONT);
    /// Window resize.
    pub const WINCH: Signal = Signal(libc::SIGWINCH);

    /// Returns the signal for a raw number, refusing numbers that are
    /// out of range or cannot be caught.
    pub fn from_raw(signo: libc::c_int) -> Option<Signal> {
        if signo <= 0 || signo as usize >= MAX_SIGNUM {
            return None;
        }
        if signo == libc::SIGKILL || signo == libc::SIGSTOP {
            return None;
        }
        Some(Signal(signo))
    }

    /// The raw signal number.
    pub fn raw(self) -> libc::c_int {
        self.0
    }
}

extern "C" fn proxy_handler(signo: libc::c_int) {
    // A syscall made here clobbers errno for the interrupted code unless
    // it is saved and restored around the write.
    let saved_errno = unsafe { *errno_location() };
    if signo > 0 && (signo as usize) < MAX_SIGNUM {
        if PENDING[signo as usize].fetch_add(1, Ordering::AcqRel) == 0 {
            let fd = WAKE_FD.load(Ordering::Acquire);
            if fd >= 0 {
                let byte = signo as u8;
                unsafe {
                    libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
                }
            }
        }
    }
    unsafe {
        *errno_location() = saved_errno;
    }
}

fn errno_location() -> *mut libc::c_int {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        libc::__errno_location()
    }
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        libc::__error()
    }
    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    unsafe {
        libc::__errno()
    }
}

fn new_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            if let Err(e) = set_nonblock_cloexec(*fd) {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(e);
            }
        }
    }

    // SAFETY: the descriptors were just created and are owned here.
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn set_nonblock_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    Ok(())
}

/// The loop-side half of the bridge.
///
/// At most one proxy can exist per process, because the OS handler
/// reaches it through process-wide state. The owning loop watches
/// [`read_fd`](SignalProxy::read_fd) and calls
/// [`drain`](SignalProxy::drain) when it becomes readable. Dropping the
/// proxy restores every saved signal disposition.
pub(crate) struct SignalProxy {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    saved: HashMap<libc::c_int, libc::sigaction>,
}

impl SignalProxy {
    pub(crate) fn new() -> io::Result<SignalProxy> {
        if PROXY_LIVE.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a signal proxy is already installed in this process",
            ));
        }
        let (read_fd, write_fd) = match new_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                PROXY_LIVE.store(false, Ordering::Release);
                return Err(e);
            }
        };
        WAKE_FD.store(write_fd.as_raw_fd(), Ordering::Release);
        Ok(SignalProxy {
            read_fd,
            write_fd,
            saved: HashMap::new(),
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    /// Installs the OS handler for `signal`, remembering the previous
    /// disposition. Installing twice is a no-op.
    pub(crate) fn install(&mut self, signal: Signal) -> io::Result<()> {
        let signo = signal.raw();
        if self.saved.contains_key(&signo) {
            return Ok(());
        }
        let mut new: libc::sigaction = unsafe { mem::zeroed() };
        new.sa_sigaction = proxy_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        new.sa_flags = libc::SA_RESTART;
        unsafe {
            libc::sigemptyset(&mut new.sa_mask);
        }
        let mut old: libc::sigaction = unsafe { mem::zeroed() };
        syscall!(sigaction(signo, &new, &mut old))?;
        self.saved.insert(signo, old);
        trace!("installed proxy handler for signal {}", signo);
        Ok(())
    }

    /// Restores the saved disposition for `signal` and discards any
    /// deliveries not yet drained.
    pub(crate) fn uninstall(&mut self, signal: Signal) {
        let signo = signal.raw();
        if let Some(old) = self.saved.remove(&signo) {
            unsafe {
                libc::sigaction(signo, &old, ptr::null_mut());
            }
            PENDING[signo as usize].store(0, Ordering::Release);
            trace!("restored disposition for signal {}", signo);
        }
    }

    /// Empties the pipe and returns `(signal number, delivery count)`
    /// pairs, in ascending signal order.
    ///
    /// The installed set is blocked while the pipe and counters are
    /// reconciled, so a delivery always lands either in this drain or
    /// cleanly in the next; callbacks run after the mask is restored.
    pub(crate) fn drain(&mut self) -> Vec<(libc::c_int, usize)> {
        let mut set: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
        }
        for &signo in self.saved.keys() {
            unsafe {
                libc::sigaddset(&mut set, signo);
            }
        }
        let mut prev: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigprocmask(libc::SIG_BLOCK, &set, &mut prev);
        }

        let mut buf = [0u8; 256];
        loop {
            match syscall!(read(
                self.read_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        let mut signos: Vec<libc::c_int> = self.saved.keys().copied().collect();
        signos.sort_unstable();
        let mut fired = Vec::new();
        for signo in signos {
            let count = PENDING[signo as usize].swap(0, Ordering::AcqRel);
            if count > 0 {
                fired.push((signo, count));
            }
        }

        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &prev, ptr::null_mut());
        }
        fired
    }
}

impl Drop for SignalProxy {
    fn drop(&mut self) {
        let signos: Vec<libc::c_int> = self.saved.keys().copied().collect();
        for signo in signos {
            if let Some(signal) = Signal::from_raw(signo) {
                self.uninstall(signal);
            }
        }
        WAKE_FD.store(-1, Ordering::Release);
        PROXY_LIVE.store(false, Ordering::Release);
    }
}

/// A notifier that relays one signal to a callback.
///
/// `SignalWatcher` is the tree-attachable face of
/// [`attach_signal`](crate::EventLoop::attach_signal): attaching it to
/// a loop (directly or under a parent) installs a multiplexed handler
/// for its signal, and detaching removes it again.
#[derive(Clone)]
pub struct SignalWatcher {
    core: Rc<RefCell<SignalWatcherCore>>,
}

pub(crate) struct SignalWatcherCore {
    base: NotifierBase,
    self_weak: Weak<RefCell<SignalWatcherCore>>,
    signal: Signal,
    callback: Option<Rc<RefCell<dyn FnMut(&mut EventLoop, Signal)>>>,
    handler: Option<SignalHandlerId>,
}

impl SignalWatcher {
    /// Returns a watcher for `signal`, not yet attached.
    pub fn new(signal: Signal) -> SignalWatcher {
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(SignalWatcherCore {
                base: NotifierBase::new(),
                self_weak: weak.clone(),
                signal,
                callback: None,
                handler: None,
            })
        });
        SignalWatcher { core }
    }

    /// Installs the delivery callback, replacing any previous one.
    pub fn on_signal<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop, Signal) + 'static,
    {
        self.core.borrow_mut().callback = Some(Rc::new(RefCell::new(callback)));
        self
    }

    /// The signal this watcher relays.
    pub fn signal(&self) -> Signal {
        self.core.borrow().signal
    }
}

impl Notify for SignalWatcherCore {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NotifierBase {
        &mut self.base
    }

    fn attached(&mut self, lp: &mut EventLoop) {
        let weak = self.self_weak.clone();
        let signal = self.signal;
        match lp.attach_signal(signal, move |lp| {
            let Some(core) = weak.upgrade() else { return };
            let cb = core.borrow().callback.clone();
            if let Some(cb) = cb {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    f(lp, signal);
                }
            }
        }) {
            Ok(id) => self.handler = Some(id),
            Err(e) => warn!("failed to attach signal watcher: {}", e),
        }
    }

    fn detached(&mut self, lp: &mut EventLoop) {
        if let Some(id) = self.handler.take() {
            lp.detach_signal(self.signal, id);
        }
    }
}

impl AsNotifier for SignalWatcher {
    fn notifier_ref(&self) -> NotifierRef {
        self.core.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::Signal;

    #[test]
    fn from_raw_validates() {
        assert_eq!(Signal::from_raw(libc::SIGHUP), Some(Signal::HUP));
        assert_eq!(Signal::from_raw(0), None);
        assert_eq!(Signal::from_raw(libc::SIGKILL), None);
        assert_eq!(Signal::from_raw(libc::SIGSTOP), None);
        assert_eq!(Signal::from_raw(64), None);
    }
}
