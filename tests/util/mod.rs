// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, Once, PoisonError};
use std::time::{Duration, Instant};

use coio::EventLoop;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn init_with_loop() -> EventLoop {
    init();
    EventLoop::new().expect("unable to create event loop")
}

/// Serializes tests that install the process-wide signal proxy.
pub fn proxy_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A plain blocking pipe as `(read, write)`.
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [-1 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// A stream socketpair as `(ours, theirs)`.
pub fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [-1 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Writes all of `bytes` to a blocking descriptor.
pub fn write_fd(fd: &OwnedFd, bytes: &[u8]) {
    use std::os::unix::io::AsRawFd;
    let mut sent = 0;
    while sent < bytes.len() {
        let n = unsafe {
            libc::write(
                fd.as_raw_fd(),
                bytes[sent..].as_ptr() as *const libc::c_void,
                bytes.len() - sent,
            )
        };
        assert!(n > 0, "write failed: {}", std::io::Error::last_os_error());
        sent += n as usize;
    }
}

/// Drives the loop until `done` reports true, panicking after five
/// seconds.
pub fn run_until(lp: &mut EventLoop, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "test watchdog expired");
        lp.loop_once(Some(Duration::from_millis(25)))
            .expect("loop turn failed");
    }
}
