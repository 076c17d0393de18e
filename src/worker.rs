//! A pool of worker subprocesses running one function over framed RPC.
//!
//! Each worker is a forked child that reads length-prefixed call frames
//! from its link, applies the shared function, and writes a return or
//! exception frame back. The parent side watches each link with a
//! [`Stream`] and keeps a per-worker queue of pending calls, so replies
//! on one worker always match calls in order; ordering across workers
//! is not promised.
//!
//! Frame layout: host-endian `u32` total length, one tag octet (`c`
//! call, `r` return, `e` exception), host-endian `u32` call id, then
//! the marshalled payload.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::event_loop::EventLoop;
use crate::future::LoopFuture;
use crate::marshal::Marshaller;
use crate::process::{spawn, FdOp, SpawnSetup, SpawnTarget};
use crate::stream::{Consume, Stream};
use crate::{Error, Result};

const TAG_CALL: u8 = b'c';
const TAG_RETURN: u8 = b'r';
const TAG_EXCEPTION: u8 = b'e';

/// Why a worker call came back without a result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WorkerCause {
    /// The worker function raised; the exception text is attached.
    Exception,
    /// The worker process exited.
    Exit,
    /// The worker's link closed.
    Closed,
    /// The worker was retired after an earlier exception.
    Die,
    /// The pool was shut down.
    Shutdown,
}

/// The error outcome of a worker call.
#[derive(Clone, Debug)]
pub struct WorkerError {
    /// What happened to the call.
    pub cause: WorkerCause,
    /// The exception text, when the cause carries one.
    pub message: Option<String>,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "worker call failed ({:?})", self.cause)?;
        if let Some(message) = &self.message {
            write!(fmt, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkerError {}

impl WorkerError {
    fn new(cause: WorkerCause) -> WorkerError {
        WorkerError {
            cause,
            message: None,
        }
    }

    fn exception(message: String) -> WorkerError {
        WorkerError {
            cause: WorkerCause::Exception,
            message: Some(message),
        }
    }
}

/// How each worker's RPC link is built.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transport {
    /// One bidirectional socketpair.
    Socket,
    /// Two pipes.
    Pipe,
    /// Prefer a socketpair, fall back to pipes.
    Auto,
}

/// Policy for a [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Target concurrency: workers are spawned on demand up to this
    /// count; further calls queue.
    pub workers: usize,
    /// Link construction, see [`Transport`].
    pub transport: Transport,
    /// Retire a worker after it reports an uncaught exception.
    pub exit_on_die: bool,
    /// Leave signal dispositions alone in new workers. When false they
    /// are reset to their defaults.
    pub keep_signals: bool,
    /// Per-call time limit; an overdue call fails with
    /// [`Error::TimedOut`] and its eventual reply is discarded.
    pub call_timeout: Option<Duration>,
    /// Extra descriptor and environment plumbing for each new worker.
    pub setup: Option<SpawnSetup>,
}

impl Default for WorkerConfig {
    fn default() -> WorkerConfig {
        WorkerConfig {
            workers: 1,
            transport: Transport::Auto,
            exit_on_die: false,
            keep_signals: false,
            call_timeout: None,
            setup: None,
        }
    }
}

/// The function a pool's workers run, shared across the fork.
pub type WorkerFn<M> = Rc<
    dyn Fn(
        Vec<<M as Marshaller>::Value>,
    ) -> std::result::Result<Vec<<M as Marshaller>::Value>, String>,
>;

type ResultCallback<M> =
    Box<dyn FnOnce(&mut EventLoop, Result<Vec<<M as Marshaller>::Value>>)>;

struct Frame {
    tag: u8,
    id: u32,
    payload: Vec<u8>,
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let len = (1 + 4 + frame.payload.len()) as u32;
    let mut out = Vec::with_capacity(4 + len as usize);
    out.extend_from_slice(&len.to_ne_bytes());
    out.push(frame.tag);
    out.extend_from_slice(&frame.id.to_ne_bytes());
    out.extend_from_slice(&frame.payload);
    out
}

/// Removes and returns one complete frame from the front of `buf`, or
/// `None` while it is still partial.
fn decode_frame(buf: &mut Vec<u8>) -> io::Result<Option<Frame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < 5 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame shorter than its header",
        ));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let tag = buf[4];
    let id = u32::from_ne_bytes([buf[5], buf[6], buf[7], buf[8]]);
    let payload = buf[9..4 + len].to_vec();
    buf.drain(..4 + len);
    Ok(Some(Frame { tag, id, payload }))
}

struct PendingCall<M: Marshaller> {
    id: u32,
    // Taken on timeout; the entry stays queued so later replies still
    // match in order.
    callback: Option<ResultCallback<M>>,
}

struct Worker<M: Marshaller> {
    pid: libc::pid_t,
    stream: Stream,
    pending: VecDeque<PendingCall<M>>,
}

struct PoolCore<M: Marshaller> {
    marshaller: M,
    func: WorkerFn<M>,
    config: WorkerConfig,
    workers: Vec<Worker<M>>,
    next_call_id: u32,
    waitq: VecDeque<(Vec<M::Value>, ResultCallback<M>)>,
    shutting_down: bool,
}

/// A pool of worker subprocesses answering calls to one function.
///
/// [`call`](WorkerPool::call) picks an idle worker, spawns a new one
/// while under the configured count, or queues the request pool-wide.
/// Workers that die take their in-flight calls with them: each pending
/// callback receives an error outcome tagged with the cause.
pub struct WorkerPool<M: Marshaller> {
    core: Rc<RefCell<PoolCore<M>>>,
}

impl<M: Marshaller> Clone for WorkerPool<M> {
    fn clone(&self) -> Self {
        WorkerPool {
            core: self.core.clone(),
        }
    }
}

impl<M: Marshaller> WorkerPool<M> {
    /// Returns a pool running `func` in its workers. Nothing is spawned
    /// until the first call.
    pub fn new<F>(marshaller: M, config: WorkerConfig, func: F) -> WorkerPool<M>
    where
        F: Fn(Vec<M::Value>) -> std::result::Result<Vec<M::Value>, String> + 'static,
    {
        WorkerPool {
            core: Rc::new(RefCell::new(PoolCore {
                marshaller,
                func: Rc::new(func),
                config,
                workers: Vec::new(),
                next_call_id: 1,
                waitq: VecDeque::new(),
                shutting_down: false,
            })),
        }
    }

    /// Dispatches one call; `on_result` receives the return list or the
    /// error outcome.
    pub fn call<F>(&self, lp: &mut EventLoop, args: Vec<M::Value>, on_result: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop, Result<Vec<M::Value>>) + 'static,
    {
        PoolCore::submit(&self.core, lp, args, Box::new(on_result))
    }

    /// Like [`call`](WorkerPool::call), completing a [`LoopFuture`]
    /// instead of running a callback.
    pub fn call_future(&self, lp: &mut EventLoop, args: Vec<M::Value>) -> LoopFuture<Vec<M::Value>> {
        let future = LoopFuture::new();
        let completer = future.clone();
        if let Err(e) = self.call(lp, args, move |_lp, result| completer.complete(result)) {
            future.complete(Err(e));
        }
        future
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.core.borrow().workers.len()
    }

    /// Number of calls waiting for a worker.
    pub fn queued_calls(&self) -> usize {
        self.core.borrow().waitq.len()
    }

    /// Fails queued and in-flight calls with a shutdown outcome and
    /// closes every worker's link so it observes end of input and
    /// exits.
    pub fn shutdown(&self, lp: &mut EventLoop) {
        PoolCore::shutdown(&self.core, lp);
    }
}

impl<M: Marshaller> PoolCore<M> {
    fn submit(
        core: &Rc<RefCell<PoolCore<M>>>,
        lp: &mut EventLoop,
        args: Vec<M::Value>,
        callback: ResultCallback<M>,
    ) -> Result<()> {
        if core.borrow().shutting_down {
            callback(lp, Err(WorkerError::new(WorkerCause::Shutdown).into()));
            return Ok(());
        }

        let idle = core
            .borrow()
            .workers
            .iter()
            .position(|w| w.pending.is_empty());
        if let Some(index) = idle {
            return PoolCore::dispatch(core, lp, index, args, callback);
        }

        let may_grow = {
            let guard = core.borrow();
            guard.workers.len() < guard.config.workers.max(1)
        };
        if may_grow {
            let index = PoolCore::spawn_worker(core, lp)?;
            return PoolCore::dispatch(core, lp, index, args, callback);
        }

        core.borrow_mut().waitq.push_back((args, callback));
        Ok(())
    }

    fn dispatch(
        core: &Rc<RefCell<PoolCore<M>>>,
        lp: &mut EventLoop,
        index: usize,
        args: Vec<M::Value>,
        callback: ResultCallback<M>,
    ) -> Result<()> {
        let (frame, id, pid, stream, timeout) = {
            let mut guard = core.borrow_mut();
            let id = guard.next_call_id;
            guard.next_call_id = guard.next_call_id.wrapping_add(1);
            let payload = guard.marshaller.marshall_args(&args)?;
            let worker = &guard.workers[index];
            (
                encode_frame(&Frame {
                    tag: TAG_CALL,
                    id,
                    payload,
                }),
                id,
                worker.pid,
                worker.stream.clone(),
                guard.config.call_timeout,
            )
        };

        stream.write(lp, &frame)?;
        {
            let mut guard = core.borrow_mut();
            if let Some(worker) = guard.workers.iter_mut().find(|w| w.pid == pid) {
                worker.pending.push_back(PendingCall {
                    id,
                    callback: Some(callback),
                });
            }
        }

        if let Some(timeout) = timeout {
            let weak = Rc::downgrade(core);
            lp.watch_time_after(timeout, move |lp| {
                PoolCore::expire_call(&weak, lp, pid, id);
            });
        }
        Ok(())
    }

    fn expire_call(weak: &Weak<RefCell<PoolCore<M>>>, lp: &mut EventLoop, pid: libc::pid_t, id: u32) {
        let Some(core) = weak.upgrade() else { return };
        let callback = {
            let mut guard = core.borrow_mut();
            guard
                .workers
                .iter_mut()
                .find(|w| w.pid == pid)
                .and_then(|w| w.pending.iter_mut().find(|p| p.id == id))
                .and_then(|p| p.callback.take())
        };
        if let Some(callback) = callback {
            debug!("worker call {} timed out", id);
            callback(lp, Err(Error::TimedOut));
        }
    }

    fn spawn_worker(core: &Rc<RefCell<PoolCore<M>>>, lp: &mut EventLoop) -> Result<usize> {
        let (transport, keep_signals, extra_setup) = {
            let guard = core.borrow();
            (
                guard.config.transport,
                guard.config.keep_signals,
                guard.config.setup.clone(),
            )
        };

        let link = WorkerLink::new(transport).map_err(|e| Error::io("worker link", e))?;
        let (child_in, child_out) = link.child_fds();

        let mut setup = extra_setup
            .unwrap_or_default()
            .fd(child_in, FdOp::Keep)
            .reset_signals(!keep_signals);
        if child_out != child_in {
            setup = setup.fd(child_out, FdOp::Keep);
        }

        let (marshaller, func) = {
            let guard = core.borrow();
            (guard.marshaller.clone(), guard.func.clone())
        };
        let body = move || worker_child_main(marshaller, func, child_in, child_out);

        // The pid is only known once `spawn` returns; the exit
        // callbacks read it through this cell.
        let pid_cell = Rc::new(std::cell::Cell::new(0 as libc::pid_t));
        let exit_weak = Rc::downgrade(core);
        let exit_pid = pid_cell.clone();
        let except_weak = Rc::downgrade(core);
        let except_pid = pid_cell.clone();
        let pid = spawn(
            lp,
            SpawnTarget::Code(Box::new(body)),
            setup,
            move |lp, status| {
                debug!("worker exited: {:?}", status);
                if let Some(core) = exit_weak.upgrade() {
                    PoolCore::retire_worker(&core, lp, Some(exit_pid.get()), WorkerCause::Exit);
                }
            },
            move |lp, failure| {
                warn!("worker failed to start: {}", failure.message);
                if let Some(core) = except_weak.upgrade() {
                    PoolCore::retire_worker(&core, lp, Some(except_pid.get()), WorkerCause::Exit);
                }
            },
        )?;
        pid_cell.set(pid);

        let stream = Stream::new();
        let weak = Rc::downgrade(core);
        stream.set_consumer(lp, move |lp, _stream, buf, eof| {
            if eof {
                PoolCore::retire_worker_by_pid(&weak, lp, pid, WorkerCause::Closed);
                return Consume::Stop;
            }
            match decode_frame(buf) {
                Ok(Some(frame)) => {
                    PoolCore::handle_frame(&weak, lp, pid, frame);
                    Consume::Again
                }
                Ok(None) => Consume::Stop,
                Err(e) => {
                    warn!("worker {} sent a malformed frame: {}", pid, e);
                    PoolCore::retire_worker_by_pid(&weak, lp, pid, WorkerCause::Closed);
                    Consume::Stop
                }
            }
        })?;
        link.wire_parent(lp, &stream)?;
        lp.add(&stream)?;

        let mut guard = core.borrow_mut();
        guard.workers.push(Worker {
            pid,
            stream,
            pending: VecDeque::new(),
        });
        debug!("worker pid={} started ({} live)", pid, guard.workers.len());
        Ok(guard.workers.len() - 1)
    }

    fn handle_frame(
        weak: &Weak<RefCell<PoolCore<M>>>,
        lp: &mut EventLoop,
        pid: libc::pid_t,
        frame: Frame,
    ) {
        let Some(core) = weak.upgrade() else { return };

        let (entry, marshaller, exit_on_die) = {
            let mut guard = core.borrow_mut();
            let marshaller = guard.marshaller.clone();
            let exit_on_die = guard.config.exit_on_die;
            let entry = guard.workers.iter_mut().find(|w| w.pid == pid).and_then(|w| {
                let front_matches = w.pending.front().map_or(false, |front| front.id == frame.id);
                if front_matches {
                    w.pending.pop_front()
                } else {
                    // Out-of-order replies should not happen over an
                    // ordered link; recover by id.
                    let at = w.pending.iter().position(|p| p.id == frame.id)?;
                    warn!("worker {} replied out of order (call {})", pid, frame.id);
                    w.pending.remove(at)
                }
            });
            (entry, marshaller, exit_on_die)
        };

        let Some(entry) = entry else {
            debug!("dropping reply for unknown call {}", frame.id);
            return;
        };

        let mut retire = false;
        let outcome: Result<Vec<M::Value>> = match frame.tag {
            TAG_RETURN => marshaller.unmarshall_ret(&frame.payload),
            TAG_EXCEPTION => {
                retire = exit_on_die;
                Err(WorkerError::exception(
                    String::from_utf8_lossy(&frame.payload).into_owned(),
                )
                .into())
            }
            other => {
                warn!("worker {} sent unexpected tag {:?}", pid, other as char);
                Err(WorkerError::new(WorkerCause::Closed).into())
            }
        };

        if let Some(callback) = entry.callback {
            callback(lp, outcome);
        }

        if retire {
            PoolCore::retire_worker(&core, lp, Some(pid), WorkerCause::Die);
        }
        PoolCore::pump(&core, lp);
    }

    /// Removes a worker and fails everything still queued on it.
    fn retire_worker(
        core: &Rc<RefCell<PoolCore<M>>>,
        lp: &mut EventLoop,
        pid: Option<libc::pid_t>,
        cause: WorkerCause,
    ) {
        let removed = {
            let mut guard = core.borrow_mut();
            let index = match pid {
                Some(pid) => guard.workers.iter().position(|w| w.pid == pid),
                None => None,
            };
            index.map(|i| guard.workers.remove(i))
        };
        let Some(mut worker) = removed else { return };
        debug!("retiring worker pid={} ({:?})", worker.pid, cause);
        worker.stream.close(lp);
        for pending in worker.pending.drain(..) {
            if let Some(callback) = pending.callback {
                callback(lp, Err(WorkerError::new(cause).into()));
            }
        }
        PoolCore::pump(core, lp);
    }

    fn retire_worker_by_pid(
        weak: &Weak<RefCell<PoolCore<M>>>,
        lp: &mut EventLoop,
        pid: libc::pid_t,
        cause: WorkerCause,
    ) {
        if let Some(core) = weak.upgrade() {
            PoolCore::retire_worker(&core, lp, Some(pid), cause);
        }
    }

    /// Feeds queued calls to idle capacity.
    fn pump(core: &Rc<RefCell<PoolCore<M>>>, lp: &mut EventLoop) {
        loop {
            let next = {
                let mut guard = core.borrow_mut();
                if guard.shutting_down || guard.waitq.is_empty() {
                    return;
                }
                let has_idle = guard.workers.iter().any(|w| w.pending.is_empty());
                let may_grow = guard.workers.len() < guard.config.workers.max(1);
                if !has_idle && !may_grow {
                    return;
                }
                guard.waitq.pop_front()
            };
            let Some((args, callback)) = next else { return };
            if let Err(e) = PoolCore::submit(core, lp, args, callback) {
                warn!("failed to dispatch queued worker call: {}", e);
            }
        }
    }

    fn shutdown(core: &Rc<RefCell<PoolCore<M>>>, lp: &mut EventLoop) {
        let (workers, waitq) = {
            let mut guard = core.borrow_mut();
            if guard.shutting_down {
                return;
            }
            guard.shutting_down = true;
            (
                std::mem::take(&mut guard.workers),
                std::mem::take(&mut guard.waitq),
            )
        };
        for mut worker in workers {
            // Closing the link is the stop signal: the worker sees end
            // of input and exits; the loop reaps it.
            worker.stream.close(lp);
            for pending in worker.pending.drain(..) {
                if let Some(callback) = pending.callback {
                    callback(lp, Err(WorkerError::new(WorkerCause::Shutdown).into()));
                }
            }
        }
        for (_args, callback) in waitq {
            callback(lp, Err(WorkerError::new(WorkerCause::Shutdown).into()));
        }
    }
}

enum WorkerLink {
    Socket {
        parent: OwnedFd,
        child: OwnedFd,
    },
    Pipes {
        parent_read: OwnedFd,
        parent_write: OwnedFd,
        child_read: OwnedFd,
        child_write: OwnedFd,
    },
}

impl WorkerLink {
    fn new(transport: Transport) -> io::Result<WorkerLink> {
        match transport {
            Transport::Socket => WorkerLink::socketpair(),
            Transport::Pipe => WorkerLink::pipes(),
            Transport::Auto => WorkerLink::socketpair().or_else(|_| WorkerLink::pipes()),
        }
    }

    fn socketpair() -> io::Result<WorkerLink> {
        let mut fds = [-1 as RawFd; 2];
        syscall!(socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM,
            0,
            fds.as_mut_ptr(),
        ))?;
        // SAFETY: both descriptors were just created and are owned here.
        unsafe {
            Ok(WorkerLink::Socket {
                parent: OwnedFd::from_raw_fd(fds[0]),
                child: OwnedFd::from_raw_fd(fds[1]),
            })
        }
    }

    fn pipes() -> io::Result<WorkerLink> {
        let mut to_child = [-1 as RawFd; 2];
        syscall!(pipe(to_child.as_mut_ptr()))?;
        let mut from_child = [-1 as RawFd; 2];
        if let Err(e) = syscall!(pipe(from_child.as_mut_ptr())) {
            unsafe {
                libc::close(to_child[0]);
                libc::close(to_child[1]);
            }
            return Err(e);
        }
        // SAFETY: all four descriptors were just created and are owned
        // here.
        unsafe {
            Ok(WorkerLink::Pipes {
                parent_read: OwnedFd::from_raw_fd(from_child[0]),
                parent_write: OwnedFd::from_raw_fd(to_child[1]),
                child_read: OwnedFd::from_raw_fd(to_child[0]),
                child_write: OwnedFd::from_raw_fd(from_child[1]),
            })
        }
    }

    /// The child's (input, output) descriptors, as raw numbers the
    /// forked body will use.
    fn child_fds(&self) -> (RawFd, RawFd) {
        match self {
            WorkerLink::Socket { child, .. } => (child.as_raw_fd(), child.as_raw_fd()),
            WorkerLink::Pipes {
                child_read,
                child_write,
                ..
            } => (child_read.as_raw_fd(), child_write.as_raw_fd()),
        }
    }

    /// Hands the parent-side descriptors to the worker stream,
    /// consuming the link; the child-side ends close here in the
    /// parent, after the fork has copied them.
    fn wire_parent(self, lp: &mut EventLoop, stream: &Stream) -> Result<()> {
        match self {
            WorkerLink::Socket { parent, child } => {
                drop(child);
                stream.set_handle(lp, parent)
            }
            WorkerLink::Pipes {
                parent_read,
                parent_write,
                child_read,
                child_write,
            } => {
                drop(child_read);
                drop(child_write);
                stream.set_read_handle(lp, parent_read)?;
                stream.set_write_handle(lp, parent_write)
            }
        }
    }
}

// === worker-side main loop, runs in the forked child ===

fn read_exact_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<bool> {
    let mut got = 0;
    while got < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[got..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - got,
            )
        };
        if n == 0 {
            if got == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "link closed mid-frame",
            ));
        }
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        got += n as usize;
    }
    Ok(true)
}

fn write_all_fd(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[sent..].as_ptr() as *const libc::c_void,
                buf.len() - sent,
            )
        };
        if n <= 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        sent += n as usize;
    }
    Ok(())
}

/// The body every worker runs: read a call frame, apply the function,
/// write the reply, until the input reaches end of stream.
fn worker_child_main<M: Marshaller>(marshaller: M, func: WorkerFn<M>, fd_in: RawFd, fd_out: RawFd) -> i32 {
    loop {
        let mut header = [0u8; 4];
        match read_exact_fd(fd_in, &mut header) {
            Ok(true) => {}
            Ok(false) => return 0,
            Err(_) => return 1,
        }
        let len = u32::from_ne_bytes(header) as usize;
        if len < 5 {
            return 1;
        }
        let mut body = vec![0u8; len];
        match read_exact_fd(fd_in, &mut body) {
            Ok(true) => {}
            _ => return 1,
        }
        if body[0] != TAG_CALL {
            return 1;
        }
        let id = u32::from_ne_bytes([body[1], body[2], body[3], body[4]]);

        let reply = match marshaller.unmarshall_args(&body[5..]) {
            Ok(args) => match func(args) {
                Ok(ret) => match marshaller.marshall_ret(&ret) {
                    Ok(payload) => Frame {
                        tag: TAG_RETURN,
                        id,
                        payload,
                    },
                    Err(e) => Frame {
                        tag: TAG_EXCEPTION,
                        id,
                        payload: e.to_string().into_bytes(),
                    },
                },
                Err(message) => Frame {
                    tag: TAG_EXCEPTION,
                    id,
                    payload: message.into_bytes(),
                },
            },
            Err(e) => Frame {
                tag: TAG_EXCEPTION,
                id,
                payload: e.to_string().into_bytes(),
            },
        };

        if write_all_fd(fd_out, &encode_frame(&reply)).is_err() {
            return 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame {
            tag: TAG_CALL,
            id: 7,
            payload: b"payload".to_vec(),
        };
        let mut wire = encode_frame(&frame);
        let decoded = decode_frame(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.tag, TAG_CALL);
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.payload, b"payload");
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_frame_waits() {
        let frame = Frame {
            tag: TAG_RETURN,
            id: 1,
            payload: vec![0; 32],
        };
        let wire = encode_frame(&frame);
        let mut partial = wire[..wire.len() - 1].to_vec();
        assert!(decode_frame(&mut partial).unwrap().is_none());
        partial.push(wire[wire.len() - 1]);
        assert!(decode_frame(&mut partial).unwrap().is_some());
    }

    #[test]
    fn undersized_frame_is_rejected() {
        let mut wire = 2u32.to_ne_bytes().to_vec();
        wire.extend_from_slice(&[0, 0]);
        assert!(decode_frame(&mut wire).is_err());
    }
}
