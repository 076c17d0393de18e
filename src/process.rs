//! Child-process management: fork/exec with descriptor plumbing, an
//! error-reporting pipe, and a high-level wrapper that captures stdio.

use std::cell::RefCell;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::event_loop::EventLoop;
use crate::notifier::{AsNotifier, Notify, NotifierBase, NotifierRef};
use crate::stream::{Consume, Stream};
use crate::{Error, Result};

/// Exit code used when a child fails before or inside its code block.
const FAILURE_EXIT_CODE: i32 = 255;

/// A raw platform wait status with derived accessors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitStatus(i32);

impl WaitStatus {
    /// Wraps a raw status as returned by `waitpid`.
    pub fn from_raw(raw: i32) -> WaitStatus {
        WaitStatus(raw)
    }

    /// The raw platform status.
    pub fn raw(self) -> i32 {
        self.0
    }

    /// Returns true if the child exited normally.
    pub fn is_exited(self) -> bool {
        libc::WIFEXITED(self.0)
    }

    /// The exit code, when the child exited normally.
    pub fn exit_status(self) -> Option<i32> {
        if self.is_exited() {
            Some(libc::WEXITSTATUS(self.0))
        } else {
            None
        }
    }

    /// Returns true if the child was terminated by a signal.
    pub fn is_signalled(self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    /// The terminating signal, when there was one.
    pub fn term_sig(self) -> Option<i32> {
        if self.is_signalled() {
            Some(libc::WTERMSIG(self.0))
        } else {
            None
        }
    }
}

/// How to open a path in an [`FdOp::Open`] operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Read only.
    Read,
    /// Write, truncating.
    Write,
    /// Write, appending.
    Append,
    /// Read and write.
    ReadWrite,
}

impl OpenMode {
    fn flags(self) -> libc::c_int {
        match self {
            OpenMode::Read => libc::O_RDONLY,
            OpenMode::Write => libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            OpenMode::Append => libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            OpenMode::ReadWrite => libc::O_RDWR | libc::O_CREAT,
        }
    }
}

/// One per-descriptor operation applied in the child, post-fork and
/// pre-exec, in the order given.
#[derive(Clone, Debug)]
pub enum FdOp {
    /// Close the descriptor.
    Close,
    /// Leave the descriptor open through the closing sweep.
    Keep,
    /// Duplicate another descriptor onto this one.
    Dup(RawFd),
    /// Open a path onto this descriptor.
    Open(OpenMode, PathBuf),
}

/// The descriptor and environment plumbing applied in a spawned child.
///
/// Operations run in the order they were added; descriptors not
/// mentioned, other than stdin, stdout and stderr, are closed before
/// the child body runs.
#[derive(Clone, Debug, Default)]
pub struct SpawnSetup {
    ops: Vec<(RawFd, FdOp)>,
    env: Option<Vec<(OsString, OsString)>>,
    reset_signals: bool,
}

impl SpawnSetup {
    /// An empty setup: stdio inherited, everything else closed.
    pub fn new() -> SpawnSetup {
        SpawnSetup::default()
    }

    /// Adds an operation for descriptor `n`.
    pub fn fd(mut self, n: RawFd, op: FdOp) -> Self {
        self.ops.push((n, op));
        self
    }

    /// Shorthand for descriptor 0.
    pub fn stdin(self, op: FdOp) -> Self {
        self.fd(0, op)
    }

    /// Shorthand for descriptor 1.
    pub fn stdout(self, op: FdOp) -> Self {
        self.fd(1, op)
    }

    /// Shorthand for descriptor 2.
    pub fn stderr(self, op: FdOp) -> Self {
        self.fd(2, op)
    }

    /// Replaces the child's environment.
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Resets every catchable signal to its default disposition in the
    /// child before the body runs.
    pub fn reset_signals(mut self, reset: bool) -> Self {
        self.reset_signals = reset;
        self
    }
}

/// A program and arguments to execute.
#[derive(Clone, Debug)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
}

impl Command {
    /// Starts a command naming the program to run.
    pub fn new(program: impl AsRef<OsStr>) -> Command {
        Command {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Command {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }
}

/// What a spawned child runs.
pub enum SpawnTarget {
    /// Exec a program.
    Exec(Command),
    /// Run a code block; its return value becomes the exit code.
    Code(Box<dyn FnOnce() -> i32>),
}

/// The structured outcome of a failed spawn, delivered to
/// `on_exception`.
#[derive(Debug)]
pub struct SpawnFailure {
    /// Exception text reported by the child; empty when the failure was
    /// a bare syscall such as a missing program.
    pub message: String,
    /// The child-side errno, or 0 when not a syscall failure.
    pub errno: i32,
    /// The wait status, once known.
    pub status: Option<WaitStatus>,
}

// Exec data is prepared before forking so the child only performs
// syscalls on the way to exec.
struct PreparedExec {
    program: CString,
    args: Vec<CString>,
}

impl PreparedExec {
    fn new(command: &Command) -> Result<PreparedExec> {
        let program = cstring(&command.program)?;
        let mut args = Vec::with_capacity(command.args.len() + 1);
        args.push(program.clone());
        for arg in &command.args {
            args.push(cstring(arg)?);
        }
        Ok(PreparedExec { program, args })
    }
}

fn cstring(os: &OsStr) -> Result<CString> {
    CString::new(os.as_bytes()).map_err(|_| {
        Error::io(
            "spawn",
            io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL in argument"),
        )
    })
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            let flags = syscall!(fcntl(*fd, libc::F_GETFD))?;
            syscall!(fcntl(*fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
        }
    }

    // SAFETY: the descriptors were just created and are owned here.
    unsafe {
        Ok((
            OwnedFd::from_raw_fd(fds[0]),
            OwnedFd::from_raw_fd(fds[1]),
        ))
    }
}

struct SpawnState {
    payload: Vec<u8>,
    pipe_done: bool,
    status: Option<WaitStatus>,
    on_finish: Option<Box<dyn FnOnce(&mut EventLoop, WaitStatus)>>,
    on_exception: Option<Box<dyn FnOnce(&mut EventLoop, SpawnFailure)>>,
}

impl SpawnState {
    /// Delivery waits for both the error pipe reaching end of stream
    /// and the wait status, in whichever order they arrive.
    fn maybe_deliver(state: &Rc<RefCell<SpawnState>>, lp: &mut EventLoop) {
        let ready = {
            let guard = state.borrow();
            guard.pipe_done && guard.status.is_some()
        };
        if !ready {
            return;
        }
        let (payload, status, on_finish, on_exception) = {
            let mut guard = state.borrow_mut();
            (
                std::mem::take(&mut guard.payload),
                guard.status.expect("status checked above"),
                guard.on_finish.take(),
                guard.on_exception.take(),
            )
        };
        if payload.len() >= 4 {
            let errno = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let message = String::from_utf8_lossy(&payload[4..]).into_owned();
            if let Some(cb) = on_exception {
                cb(
                    lp,
                    SpawnFailure {
                        message,
                        errno,
                        status: Some(status),
                    },
                );
            }
        } else if let Some(cb) = on_finish {
            cb(lp, status);
        }
    }
}

/// Forks and runs `target` with the descriptor plumbing in `setup`.
///
/// The parent keeps a close-on-exec error pipe: a child that fails
/// before exec, or whose code block panics, writes its errno and
/// exception text there just before exiting with status 255. The
/// terminal callback fires only after both the pipe has reached end of
/// stream and the wait status has been collected, so exactly one of
/// `on_finish` and `on_exception` runs.
pub fn spawn<FOk, FErr>(
    lp: &mut EventLoop,
    target: SpawnTarget,
    setup: SpawnSetup,
    on_finish: FOk,
    on_exception: FErr,
) -> Result<libc::pid_t>
where
    FOk: FnOnce(&mut EventLoop, WaitStatus) + 'static,
    FErr: FnOnce(&mut EventLoop, SpawnFailure) + 'static,
{
    let prepared = match &target {
        SpawnTarget::Exec(command) => Some(PreparedExec::new(command)?),
        SpawnTarget::Code(_) => None,
    };
    let (err_rd, err_wr) = cloexec_pipe().map_err(|e| Error::io("pipe", e))?;

    let pid = syscall!(fork()).map_err(|e| Error::Spawn {
        message: format!("fork failed: {}", e),
        errno: e.raw_os_error().unwrap_or(0),
    })?;

    if pid == 0 {
        drop(err_rd);
        child_main(target, prepared, setup, err_wr);
    }

    drop(err_wr);
    debug!("spawned child pid={}", pid);

    let state = Rc::new(RefCell::new(SpawnState {
        payload: Vec::new(),
        pipe_done: false,
        status: None,
        on_finish: Some(Box::new(on_finish)),
        on_exception: Some(Box::new(on_exception)),
    }));

    let pipe_stream = Stream::new();
    let pipe_state = state.clone();
    pipe_stream.set_consumer(lp, move |lp, _stream, buf, eof| {
        {
            let mut guard = pipe_state.borrow_mut();
            guard.payload.extend_from_slice(buf);
            buf.clear();
            if eof {
                guard.pipe_done = true;
            }
        }
        if eof {
            SpawnState::maybe_deliver(&pipe_state, lp);
        }
        Consume::Stop
    })?;
    pipe_stream.set_read_handle(lp, err_rd)?;
    lp.add(&pipe_stream)?;

    let wait_state = state.clone();
    lp.watch_child(pid, move |lp, _pid, status| {
        wait_state.borrow_mut().status = Some(status);
        SpawnState::maybe_deliver(&wait_state, lp);
    })?;

    Ok(pid)
}

fn report_and_exit(err_fd: RawFd, errno: i32, message: &str) -> ! {
    let mut payload = errno.to_ne_bytes().to_vec();
    payload.extend_from_slice(message.as_bytes());
    let mut written = 0;
    while written < payload.len() {
        let n = unsafe {
            libc::write(
                err_fd,
                payload[written..].as_ptr() as *const libc::c_void,
                payload.len() - written,
            )
        };
        if n <= 0 {
            break;
        }
        written += n as usize;
    }
    unsafe { libc::_exit(FAILURE_EXIT_CODE) }
}

fn child_main(
    target: SpawnTarget,
    prepared: Option<PreparedExec>,
    setup: SpawnSetup,
    err_wr: OwnedFd,
) -> ! {
    let mut err_fd = err_wr.into_raw_fd();

    if setup.reset_signals {
        for signo in 1..32 {
            if signo == libc::SIGKILL || signo == libc::SIGSTOP {
                continue;
            }
            unsafe {
                libc::signal(signo, libc::SIG_DFL);
            }
        }
    }

    // The error pipe must survive the plumbing; move it above the
    // highest target descriptor if any operation wants its slot.
    let max_target = setup.ops.iter().map(|(n, _)| *n).max().unwrap_or(2).max(2);
    if setup.ops.iter().any(|(n, _)| *n == err_fd) {
        match syscall!(fcntl(err_fd, libc::F_DUPFD_CLOEXEC, max_target + 1)) {
            Ok(moved) => err_fd = moved,
            Err(e) => report_and_exit(err_fd, e.raw_os_error().unwrap_or(0), "fcntl"),
        }
    }

    for (n, op) in &setup.ops {
        let result = match op {
            FdOp::Close => syscall!(close(*n)).map(|_| ()),
            FdOp::Keep => Ok(()),
            FdOp::Dup(src) => syscall!(dup2(*src, *n)).map(|_| ()),
            FdOp::Open(mode, path) => match CString::new(path.as_os_str().as_bytes()) {
                Ok(cpath) => syscall!(open(cpath.as_ptr(), mode.flags(), 0o666)).and_then(|fd| {
                    if fd == *n {
                        return Ok(());
                    }
                    let moved = syscall!(dup2(fd, *n)).map(|_| ());
                    unsafe {
                        libc::close(fd);
                    }
                    moved
                }),
                Err(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "bad path")),
            },
        };
        if let Err(e) = result {
            report_and_exit(err_fd, e.raw_os_error().unwrap_or(0), "fd setup");
        }
    }

    // Close everything not plumbed or kept. Stdio survives unless an
    // operation said otherwise; the error pipe closes itself on exec.
    let limit = {
        let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        if max <= 0 {
            1024
        } else {
            max.min(65_536) as RawFd
        }
    };
    for fd in 3..limit {
        if fd == err_fd {
            continue;
        }
        let retained = setup
            .ops
            .iter()
            .any(|(n, op)| *n == fd && !matches!(op, FdOp::Close));
        if !retained {
            unsafe {
                libc::close(fd);
            }
        }
    }

    if let Some(vars) = &setup.env {
        let existing: Vec<OsString> = std::env::vars_os().map(|(k, _)| k).collect();
        for key in existing {
            std::env::remove_var(&key);
        }
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
    }

    match target {
        SpawnTarget::Exec(_) => {
            let prepared = prepared.expect("exec target was prepared before fork");
            let mut argv: Vec<*const libc::c_char> =
                prepared.args.iter().map(|arg| arg.as_ptr()).collect();
            argv.push(std::ptr::null());
            unsafe {
                libc::execvp(prepared.program.as_ptr(), argv.as_ptr());
            }
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            report_and_exit(err_fd, errno, "");
        }
        SpawnTarget::Code(body) => match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(code) => unsafe { libc::_exit(code) },
            Err(payload) => {
                let message = panic_message(&payload);
                report_and_exit(err_fd, 0, &message);
            }
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "child code block panicked".to_string()
    }
}

/// What to feed a wrapped child's stdin.
pub enum StdinMode {
    /// Leave descriptor 0 as inherited.
    Inherit,
    /// Open `/dev/null` on descriptor 0.
    DevNull,
    /// Pipe the given bytes in, then close.
    Bytes(Vec<u8>),
}

/// What to do with a wrapped child's stdout or stderr.
pub enum CaptureMode {
    /// Leave the descriptor as inherited.
    Inherit,
    /// Open `/dev/null` on the descriptor.
    DevNull,
    /// Pipe the output back and collect it into a buffer.
    Capture,
}

/// Everything a completed [`Process`] produced.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// The raw wait status with derived accessors.
    pub status: WaitStatus,
    /// Captured stdout, empty unless requested.
    pub stdout: Vec<u8>,
    /// Captured stderr, empty unless requested.
    pub stderr: Vec<u8>,
}

type FinishCallback = Box<dyn FnOnce(&mut EventLoop, ProcessOutcome)>;
type ExceptionCallback = Box<dyn FnOnce(&mut EventLoop, SpawnFailure)>;

/// A notifier wrapping one child process with buffered stdio.
///
/// Attaching the process to a loop launches it on the following turn:
/// stdio is plumbed according to the configured modes, captured output
/// is collected through child streams, and once the child has been
/// reaped *and* every capture stream has drained, `on_finish` receives
/// the [`ProcessOutcome`]. Spawn failures arrive through
/// `on_exception` instead.
#[derive(Clone)]
pub struct Process {
    core: Rc<RefCell<ProcessCore>>,
}

pub(crate) struct ProcessCore {
    base: NotifierBase,
    self_weak: Weak<RefCell<ProcessCore>>,
    target: Option<SpawnTarget>,
    setup: Option<SpawnSetup>,
    stdin: StdinMode,
    stdout: CaptureMode,
    stderr: CaptureMode,
    on_finish: Option<FinishCallback>,
    on_exception: Option<ExceptionCallback>,
    pid: Option<libc::pid_t>,
    status: Option<WaitStatus>,
    stdout_buf: Rc<RefCell<Vec<u8>>>,
    stderr_buf: Rc<RefCell<Vec<u8>>>,
    // Child exit plus one per capture stream still draining.
    outstanding: usize,
    failed: bool,
}

impl Process {
    /// Returns a process that will run `target` when attached.
    pub fn new(target: SpawnTarget) -> Process {
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(ProcessCore {
                base: NotifierBase::new(),
                self_weak: weak.clone(),
                target: Some(target),
                setup: Some(SpawnSetup::new()),
                stdin: StdinMode::Inherit,
                stdout: CaptureMode::Inherit,
                stderr: CaptureMode::Inherit,
                on_finish: None,
                on_exception: None,
                pid: None,
                status: None,
                stdout_buf: Rc::new(RefCell::new(Vec::new())),
                stderr_buf: Rc::new(RefCell::new(Vec::new())),
                outstanding: 0,
                failed: false,
            })
        });
        Process { core }
    }

    /// Shorthand for a process that execs `command`.
    pub fn exec(command: Command) -> Process {
        Process::new(SpawnTarget::Exec(command))
    }

    /// Shorthand for a process running a code block.
    pub fn code<F>(body: F) -> Process
    where
        F: FnOnce() -> i32 + 'static,
    {
        Process::new(SpawnTarget::Code(Box::new(body)))
    }

    /// Replaces the descriptor and environment plumbing.
    pub fn setup(&self, setup: SpawnSetup) -> &Self {
        self.core.borrow_mut().setup = Some(setup);
        self
    }

    /// Configures stdin handling.
    pub fn stdin(&self, mode: StdinMode) -> &Self {
        self.core.borrow_mut().stdin = mode;
        self
    }

    /// Configures stdout handling.
    pub fn stdout(&self, mode: CaptureMode) -> &Self {
        self.core.borrow_mut().stdout = mode;
        self
    }

    /// Configures stderr handling.
    pub fn stderr(&self, mode: CaptureMode) -> &Self {
        self.core.borrow_mut().stderr = mode;
        self
    }

    /// Installs the completion callback.
    pub fn on_finish<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&mut EventLoop, ProcessOutcome) + 'static,
    {
        self.core.borrow_mut().on_finish = Some(Box::new(callback));
        self
    }

    /// Installs the spawn-failure callback.
    pub fn on_exception<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&mut EventLoop, SpawnFailure) + 'static,
    {
        self.core.borrow_mut().on_exception = Some(Box::new(callback));
        self
    }

    /// The child's pid once launched.
    pub fn pid(&self) -> Option<libc::pid_t> {
        self.core.borrow().pid
    }

    /// Sends `signal` to the child.
    pub fn kill(&self, signal: libc::c_int) -> Result<()> {
        let pid = self
            .core
            .borrow()
            .pid
            .ok_or_else(|| crate::notifier::misuse("process has not been launched"))?;
        syscall!(kill(pid, signal))
            .map(|_| ())
            .map_err(|e| Error::io("kill", e))
    }
}

impl AsNotifier for Process {
    fn notifier_ref(&self) -> NotifierRef {
        self.core.clone()
    }
}

impl ProcessCore {
    fn launch(core: &Rc<RefCell<ProcessCore>>, lp: &mut EventLoop) {
        let (target, mut setup, stdin, stdout, stderr) = {
            let mut guard = core.borrow_mut();
            let Some(target) = guard.target.take() else {
                return;
            };
            let setup = guard.setup.take().unwrap_or_default();
            (
                target,
                setup,
                std::mem::replace(&mut guard.stdin, StdinMode::Inherit),
                std::mem::replace(&mut guard.stdout, CaptureMode::Inherit),
                std::mem::replace(&mut guard.stderr, CaptureMode::Inherit),
            )
        };

        // Plumbing first, so every pipe end is still open at fork time.
        let mut stdin_feed: Option<(OwnedFd, Vec<u8>)> = None;
        let mut keep_until_fork: Vec<OwnedFd> = Vec::new();
        let mut captures: Vec<(OwnedFd, Rc<RefCell<Vec<u8>>>)> = Vec::new();

        match stdin {
            StdinMode::Inherit => {}
            StdinMode::DevNull => {
                setup = setup.stdin(FdOp::Open(OpenMode::Read, "/dev/null".into()));
            }
            StdinMode::Bytes(bytes) => match cloexec_pipe() {
                Ok((rd, wr)) => {
                    setup = setup.stdin(FdOp::Dup(rd.as_raw_fd()));
                    stdin_feed = Some((wr, bytes));
                    keep_until_fork.push(rd);
                }
                Err(e) => {
                    ProcessCore::fail(core, lp, Error::io("pipe", e));
                    return;
                }
            },
        }

        for (fd_num, mode, buf) in [
            (1, stdout, core.borrow().stdout_buf.clone()),
            (2, stderr, core.borrow().stderr_buf.clone()),
        ] {
            match mode {
                CaptureMode::Inherit => {}
                CaptureMode::DevNull => {
                    setup = setup.fd(fd_num, FdOp::Open(OpenMode::Write, "/dev/null".into()));
                }
                CaptureMode::Capture => match cloexec_pipe() {
                    Ok((rd, wr)) => {
                        setup = setup.fd(fd_num, FdOp::Dup(wr.as_raw_fd()));
                        captures.push((rd, buf));
                        keep_until_fork.push(wr);
                    }
                    Err(e) => {
                        ProcessCore::fail(core, lp, Error::io("pipe", e));
                        return;
                    }
                },
            }
        }

        core.borrow_mut().outstanding = 1 + captures.len();

        let finish_weak = core.borrow().self_weak.clone();
        let except_weak = core.borrow().self_weak.clone();
        let pid = spawn(
            lp,
            target,
            setup,
            move |lp, status| {
                if let Some(core) = finish_weak.upgrade() {
                    core.borrow_mut().status = Some(status);
                    ProcessCore::settle(&core, lp);
                }
            },
            move |lp, failure| {
                if let Some(core) = except_weak.upgrade() {
                    ProcessCore::fail(&core, lp, failure);
                }
            },
        );

        // The child holds its own copies now.
        drop(keep_until_fork);

        let pid = match pid {
            Ok(pid) => pid,
            Err(Error::Spawn { message, errno }) => {
                ProcessCore::fail(
                    core,
                    lp,
                    SpawnFailure {
                        message,
                        errno,
                        status: None,
                    },
                );
                return;
            }
            Err(e) => {
                ProcessCore::fail(core, lp, e);
                return;
            }
        };
        core.borrow_mut().pid = Some(pid);

        if let Some((wr, bytes)) = stdin_feed {
            let feed = Stream::new();
            let launched = (|| {
                feed.set_write_handle(lp, wr)?;
                lp.add(&feed)?;
                feed.write(lp, &bytes)
            })();
            match launched {
                Ok(()) => feed.close_when_empty(lp),
                Err(e) => warn!("failed to feed child stdin: {}", e),
            }
        }

        for (rd, buf) in captures {
            let capture = Stream::new();
            let weak = core.borrow().self_weak.clone();
            // Settling on close rather than on end-of-stream covers the
            // error path too; the stream closes itself either way.
            capture.on_closed(move |lp, _stream| {
                if let Some(core) = weak.upgrade() {
                    ProcessCore::settle(&core, lp);
                }
            });
            let wired = (|| {
                capture.set_consumer(lp, move |_lp, _stream, data, _eof| {
                    buf.borrow_mut().extend_from_slice(data);
                    data.clear();
                    Consume::Stop
                })?;
                capture.set_read_handle(lp, rd)?;
                lp.add(&capture).map(|_| ())
            })();
            if let Err(e) = wired {
                warn!("failed to wire capture stream: {}", e);
                ProcessCore::settle(core, lp);
            }
        }
    }

    /// One completion source reported in; deliver once all have.
    fn settle(core: &Rc<RefCell<ProcessCore>>, lp: &mut EventLoop) {
        let ready = {
            let mut guard = core.borrow_mut();
            if guard.failed {
                return;
            }
            guard.outstanding = guard.outstanding.saturating_sub(1);
            guard.outstanding == 0 && guard.status.is_some()
        };
        if !ready {
            return;
        }
        let (cb, outcome) = {
            let mut guard = core.borrow_mut();
            let outcome = ProcessOutcome {
                status: guard.status.expect("status checked above"),
                stdout: std::mem::take(&mut *guard.stdout_buf.borrow_mut()),
                stderr: std::mem::take(&mut *guard.stderr_buf.borrow_mut()),
            };
            (guard.on_finish.take(), outcome)
        };
        if let Some(cb) = cb {
            cb(lp, outcome);
        }
        let node: NotifierRef = core.clone();
        lp.orphan(&node);
    }

    fn fail(core: &Rc<RefCell<ProcessCore>>, lp: &mut EventLoop, failure: impl IntoSpawnFailure) {
        let cb = {
            let mut guard = core.borrow_mut();
            if guard.failed {
                return;
            }
            guard.failed = true;
            guard.on_exception.take()
        };
        let failure = failure.into_spawn_failure();
        match cb {
            Some(cb) => cb(lp, failure),
            None => warn!("unhandled spawn failure: {} (errno {})", failure.message, failure.errno),
        }
        let node: NotifierRef = core.clone();
        lp.orphan(&node);
    }
}

trait IntoSpawnFailure {
    fn into_spawn_failure(self) -> SpawnFailure;
}

impl IntoSpawnFailure for SpawnFailure {
    fn into_spawn_failure(self) -> SpawnFailure {
        self
    }
}

impl IntoSpawnFailure for Error {
    fn into_spawn_failure(self) -> SpawnFailure {
        match self {
            Error::Spawn { message, errno } => SpawnFailure {
                message,
                errno,
                status: None,
            },
            other => SpawnFailure {
                message: other.to_string(),
                errno: other.raw_os_error().unwrap_or(0),
                status: None,
            },
        }
    }
}

impl Notify for ProcessCore {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NotifierBase {
        &mut self.base
    }

    fn attached(&mut self, lp: &mut EventLoop) {
        // Launch on the next turn; the tree walk holding this node is
        // still in progress.
        let weak = self.self_weak.clone();
        lp.watch_idle(move |lp| {
            if let Some(core) = weak.upgrade() {
                ProcessCore::launch(&core, lp);
            }
        });
    }

    fn detached(&mut self, _lp: &mut EventLoop) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_accessors() {
        // A normal exit with code 3 on Linux-style encoding.
        let status = WaitStatus::from_raw(3 << 8);
        assert!(status.is_exited());
        assert_eq!(status.exit_status(), Some(3));
        assert!(!status.is_signalled());
        assert_eq!(status.term_sig(), None);
    }

    #[test]
    fn setup_builder_orders_ops() {
        let setup = SpawnSetup::new()
            .stdin(FdOp::Close)
            .fd(7, FdOp::Keep)
            .stdout(FdOp::Dup(7));
        assert_eq!(setup.ops.len(), 3);
        assert!(matches!(setup.ops[0], (0, FdOp::Close)));
        assert!(matches!(setup.ops[1], (7, FdOp::Keep)));
        assert!(matches!(setup.ops[2], (1, FdOp::Dup(7))));
    }
}
