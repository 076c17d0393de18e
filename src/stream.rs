//! Buffered byte streams with a re-entrant consumer callback.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use log::warn;

use crate::event_loop::EventLoop;
use crate::handle::set_nonblock;
use crate::notifier::{misuse, AsNotifier, Notify, NotifierBase, NotifierRef};
use crate::{Error, Interest, Result};

/// What a consumer wants done after inspecting the receive buffer.
pub enum Consume {
    /// No more progress is possible now; do not call again until more
    /// bytes arrive or end of stream is seen.
    Stop,
    /// Call again immediately, in case further complete units remain in
    /// the buffer.
    Again,
    /// Swap in a new active consumer and run it immediately, even on an
    /// empty buffer. The configured consumer stays saved.
    Replace(Consumer),
    /// Drop the active replacement and rerun the configured consumer
    /// immediately.
    Restore,
}

/// The incoming-data callback of a [`Stream`].
///
/// It receives the receive buffer and may drain any prefix of it; the
/// `eof` flag is true once the peer has closed. The return value
/// controls re-entry, see [`Consume`].
pub type Consumer = Box<dyn FnMut(&mut EventLoop, &Stream, &mut Vec<u8>, bool) -> Consume>;

type StreamEvent = Box<dyn FnMut(&mut EventLoop, &Stream)>;
type StreamErrorCallback = Box<dyn FnMut(&mut EventLoop, &Stream, &Error)>;

enum ActiveSlot {
    Configured,
    Shadow,
}

/// A buffered byte stream over non-blocking descriptors.
///
/// The read side couples readiness to the consumer callback: each
/// readable event reads one chunk, appends it to the receive buffer and
/// runs the active consumer until it stops making progress. The write
/// side buffers outgoing bytes and drains them as the descriptor
/// accepts them, dropping write interest when the buffer empties.
///
/// Wouldblock is never an error on either side; any other errno is
/// routed to the matching error callback, or closes the stream when
/// none is configured.
#[derive(Clone)]
pub struct Stream {
    core: Rc<RefCell<StreamCore>>,
}

pub(crate) struct StreamCore {
    base: NotifierBase,
    self_weak: Weak<RefCell<StreamCore>>,
    read_fd: Option<Rc<OwnedFd>>,
    write_fd: Option<Rc<OwnedFd>>,
    recvbuff: Vec<u8>,
    sendbuff: Vec<u8>,
    consumer: Option<Consumer>,
    shadow: Option<Consumer>,
    on_read_error: Option<StreamErrorCallback>,
    on_write_error: Option<StreamErrorCallback>,
    on_outgoing_empty: Option<StreamEvent>,
    on_closed: Option<StreamEvent>,
    read_chunk: Option<usize>,
    write_chunk: Option<usize>,
    want_write: bool,
    close_pending: bool,
    closed: bool,
}

impl Stream {
    /// Returns a stream with no descriptors bound.
    pub fn new() -> Stream {
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(StreamCore {
                base: NotifierBase::new(),
                self_weak: weak.clone(),
                read_fd: None,
                write_fd: None,
                recvbuff: Vec::new(),
                sendbuff: Vec::new(),
                consumer: None,
                shadow: None,
                on_read_error: None,
                on_write_error: None,
                on_outgoing_empty: None,
                on_closed: None,
                read_chunk: None,
                write_chunk: None,
                want_write: false,
                close_pending: false,
                closed: false,
            })
        });
        Stream { core }
    }

    /// Binds one descriptor for both directions and puts it into
    /// non-blocking mode.
    pub fn set_handle(&self, lp: &mut EventLoop, fd: OwnedFd) -> Result<()> {
        set_nonblock(fd.as_raw_fd()).map_err(|e| Error::io("set_nonblock", e))?;
        let fd = Rc::new(fd);
        {
            let mut core = self.core.borrow_mut();
            core.read_fd = Some(fd.clone());
            core.write_fd = Some(fd);
        }
        self.rearm(lp)
    }

    /// Binds the read-side descriptor and puts it into non-blocking
    /// mode.
    pub fn set_read_handle(&self, lp: &mut EventLoop, fd: OwnedFd) -> Result<()> {
        set_nonblock(fd.as_raw_fd()).map_err(|e| Error::io("set_nonblock", e))?;
        self.core.borrow_mut().read_fd = Some(Rc::new(fd));
        self.rearm(lp)
    }

    /// Binds the write-side descriptor and puts it into non-blocking
    /// mode.
    pub fn set_write_handle(&self, lp: &mut EventLoop, fd: OwnedFd) -> Result<()> {
        set_nonblock(fd.as_raw_fd()).map_err(|e| Error::io("set_nonblock", e))?;
        self.core.borrow_mut().write_fd = Some(Rc::new(fd));
        self.rearm(lp)
    }

    /// Installs the configured consumer, replacing any previous one, and
    /// arms read interest when the stream is attached.
    pub fn set_consumer<F>(&self, lp: &mut EventLoop, consumer: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, &Stream, &mut Vec<u8>, bool) -> Consume + 'static,
    {
        self.core.borrow_mut().consumer = Some(Box::new(consumer));
        self.rearm(lp)
    }

    /// Overrides the per-read chunk size for this stream.
    pub fn set_read_chunk(&self, bytes: usize) {
        self.core.borrow_mut().read_chunk = Some(bytes);
    }

    /// Overrides the per-write chunk size for this stream.
    pub fn set_write_chunk(&self, bytes: usize) {
        self.core.borrow_mut().write_chunk = Some(bytes);
    }

    /// Installs the read-side error callback.
    pub fn on_read_error<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop, &Stream, &Error) + 'static,
    {
        self.core.borrow_mut().on_read_error = Some(Box::new(callback));
        self
    }

    /// Installs the write-side error callback.
    pub fn on_write_error<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop, &Stream, &Error) + 'static,
    {
        self.core.borrow_mut().on_write_error = Some(Box::new(callback));
        self
    }

    /// Installs the callback fired whenever the outgoing buffer drains.
    pub fn on_outgoing_empty<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop, &Stream) + 'static,
    {
        self.core.borrow_mut().on_outgoing_empty = Some(Box::new(callback));
        self
    }

    /// Installs the callback fired once when the stream closes.
    pub fn on_closed<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop, &Stream) + 'static,
    {
        self.core.borrow_mut().on_closed = Some(Box::new(callback));
        self
    }

    /// Queues `data` for transmission and arms write interest. Safe to
    /// call from any callback, including the stream's own consumer.
    pub fn write(&self, lp: &mut EventLoop, data: &[u8]) -> Result<()> {
        {
            let mut core = self.core.borrow_mut();
            if core.closed || core.close_pending {
                return Err(misuse("stream is closed or closing"));
            }
            core.sendbuff.extend_from_slice(data);
        }
        self.rearm(lp)
    }

    /// Bytes queued and not yet transmitted.
    pub fn pending_out(&self) -> usize {
        self.core.borrow().sendbuff.len()
    }

    /// Returns true once the stream has closed.
    pub fn is_closed(&self) -> bool {
        self.core.borrow().closed
    }

    /// Returns true while the stream is a member of a loop.
    pub fn is_attached(&self) -> bool {
        self.core.borrow().base.is_attached()
    }

    /// Closes immediately: pending outgoing bytes are discarded, both
    /// descriptors are closed and the stream leaves its parent or loop.
    pub fn close(&self, lp: &mut EventLoop) {
        StreamCore::do_close(&self.core, lp);
    }

    /// Closes once the outgoing buffer has drained; closes now when it
    /// is already empty. Further writes are refused.
    pub fn close_when_empty(&self, lp: &mut EventLoop) {
        let now = {
            let mut core = self.core.borrow_mut();
            if core.closed {
                return;
            }
            if core.sendbuff.is_empty() {
                true
            } else {
                core.close_pending = true;
                false
            }
        };
        if now {
            self.close(lp);
        }
    }

    /// Re-derives which directions should be armed and updates the
    /// watches accordingly. Read interest follows "attached, bound and
    /// consuming"; write interest follows "attached, bound and bytes
    /// pending".
    fn rearm(&self, lp: &mut EventLoop) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.rearm(lp)
    }
}

impl Default for Stream {
    fn default() -> Stream {
        Stream::new()
    }
}

impl AsNotifier for Stream {
    fn notifier_ref(&self) -> NotifierRef {
        self.core.clone()
    }
}

impl StreamCore {
    pub(crate) fn from_core(core: &Rc<RefCell<StreamCore>>) -> Stream {
        Stream { core: core.clone() }
    }

    fn rearm(&mut self, lp: &mut EventLoop) -> Result<()> {
        if !self.base.is_attached() || self.closed {
            return Ok(());
        }
        if let Some(fd) = self.read_fd.as_ref().map(|fd| fd.as_raw_fd()) {
            if self.consumer.is_some() || self.shadow.is_some() {
                let weak = self.self_weak.clone();
                lp.watch_io(fd, Interest::READABLE, move |lp| {
                    if let Some(core) = weak.upgrade() {
                        StreamCore::read_ready(&core, lp);
                    }
                })?;
            }
        }
        if let Some(fd) = self.write_fd.as_ref().map(|fd| fd.as_raw_fd()) {
            if !self.sendbuff.is_empty() && !self.want_write {
                self.want_write = true;
                let weak = self.self_weak.clone();
                lp.watch_io(fd, Interest::WRITABLE, move |lp| {
                    if let Some(core) = weak.upgrade() {
                        StreamCore::write_ready(&core, lp);
                    }
                })?;
            }
        }
        Ok(())
    }

    fn disarm(&mut self, lp: &mut EventLoop) {
        if let Some(fd) = self.read_fd.as_ref().map(|fd| fd.as_raw_fd()) {
            let _ = lp.unwatch_io(fd, Interest::READABLE);
        }
        if let Some(fd) = self.write_fd.as_ref().map(|fd| fd.as_raw_fd()) {
            let _ = lp.unwatch_io(fd, Interest::WRITABLE);
        }
        self.want_write = false;
    }

    fn read_ready(core: &Rc<RefCell<StreamCore>>, lp: &mut EventLoop) {
        let (fd, chunk) = {
            let guard = core.borrow();
            if guard.closed {
                return;
            }
            let Some(fd) = guard.read_fd.as_ref().map(|fd| fd.as_raw_fd()) else {
                return;
            };
            (fd, guard.read_chunk.unwrap_or(lp.config().read_chunk_size))
        };

        let mut chunkbuf = vec![0u8; chunk.max(1)];
        let n = loop {
            match syscall!(read(
                fd,
                chunkbuf.as_mut_ptr() as *mut libc::c_void,
                chunkbuf.len(),
            )) {
                Ok(n) => break n as usize,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    StreamCore::deliver_error(core, lp, Interest::READABLE, Error::io("sysread", e));
                    return;
                }
            }
        };

        let eof = n == 0;
        if !eof {
            core.borrow_mut().recvbuff.extend_from_slice(&chunkbuf[..n]);
        }

        StreamCore::run_consumers(core, lp, eof);

        if eof {
            StreamCore::do_close(core, lp);
        }
    }

    /// Runs the active consumer until it reports no further progress,
    /// following replace and restore verdicts as they come.
    fn run_consumers(core: &Rc<RefCell<StreamCore>>, lp: &mut EventLoop, eof: bool) {
        loop {
            let (mut cb, slot) = {
                let mut guard = core.borrow_mut();
                if guard.closed {
                    return;
                }
                if let Some(cb) = guard.shadow.take() {
                    (cb, ActiveSlot::Shadow)
                } else if let Some(cb) = guard.consumer.take() {
                    (cb, ActiveSlot::Configured)
                } else {
                    return;
                }
            };

            let mut buf = mem::take(&mut core.borrow_mut().recvbuff);
            let len_before = buf.len();
            let stream = StreamCore::from_core(core);
            let verdict = cb(lp, &stream, &mut buf, eof);
            let len_after = buf.len();
            {
                let mut guard = core.borrow_mut();
                if guard.recvbuff.is_empty() {
                    guard.recvbuff = buf;
                } else {
                    // The consumer's leftover prefix stays in front of
                    // anything that landed meanwhile.
                    buf.extend_from_slice(&guard.recvbuff);
                    guard.recvbuff = buf;
                }
            }

            let restore = |core: &Rc<RefCell<StreamCore>>, cb: Consumer, slot: &ActiveSlot| {
                let mut guard = core.borrow_mut();
                let dest = match slot {
                    ActiveSlot::Shadow => &mut guard.shadow,
                    ActiveSlot::Configured => &mut guard.consumer,
                };
                if dest.is_none() {
                    *dest = Some(cb);
                }
            };

            match verdict {
                Consume::Stop => {
                    restore(core, cb, &slot);
                    return;
                }
                Consume::Again => {
                    restore(core, cb, &slot);
                    if len_after == len_before {
                        // No progress; wait for more bytes or end of
                        // stream.
                        return;
                    }
                    if core.borrow().recvbuff.is_empty() && !eof {
                        return;
                    }
                }
                Consume::Replace(new_cb) => {
                    if let ActiveSlot::Configured = slot {
                        restore(core, cb, &slot);
                    }
                    let mut guard = core.borrow_mut();
                    guard.shadow = Some(new_cb);
                }
                Consume::Restore => {
                    if let ActiveSlot::Configured = slot {
                        restore(core, cb, &slot);
                    }
                    // A shadow verdict drops the replacement; the
                    // configured consumer runs on the next iteration.
                }
            }
        }
    }

    fn write_ready(core: &Rc<RefCell<StreamCore>>, lp: &mut EventLoop) {
        loop {
            let mut guard = core.borrow_mut();
            if guard.closed {
                return;
            }
            let Some(fd) = guard.write_fd.as_ref().map(|fd| fd.as_raw_fd()) else {
                return;
            };
            if guard.sendbuff.is_empty() {
                break;
            }
            let chunk = guard.write_chunk.unwrap_or(lp.config().write_chunk_size);
            let n = guard.sendbuff.len().min(chunk.max(1));
            match syscall!(write(
                fd,
                guard.sendbuff.as_ptr() as *const libc::c_void,
                n,
            )) {
                Ok(written) => {
                    guard.sendbuff.drain(..written as usize);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    drop(guard);
                    StreamCore::deliver_error(
                        core,
                        lp,
                        Interest::WRITABLE,
                        Error::io("syswrite", e),
                    );
                    return;
                }
            }
        }

        // Drained: drop write interest, report, then honour a deferred
        // close.
        let close_pending = {
            let mut guard = core.borrow_mut();
            guard.want_write = false;
            if let Some(fd) = guard.write_fd.as_ref().map(|fd| fd.as_raw_fd()) {
                let _ = lp.unwatch_io(fd, Interest::WRITABLE);
            }
            guard.close_pending
        };

        let cb = core.borrow_mut().on_outgoing_empty.take();
        if let Some(mut cb) = cb {
            let stream = StreamCore::from_core(core);
            cb(lp, &stream);
            let mut guard = core.borrow_mut();
            if guard.on_outgoing_empty.is_none() {
                guard.on_outgoing_empty = Some(cb);
            }
        }

        if close_pending {
            StreamCore::do_close(core, lp);
        }
    }

    fn deliver_error(core: &Rc<RefCell<StreamCore>>, lp: &mut EventLoop, dir: Interest, err: Error) {
        let cb = {
            let mut guard = core.borrow_mut();
            if dir.is_readable() {
                guard.on_read_error.take()
            } else {
                guard.on_write_error.take()
            }
        };
        match cb {
            Some(mut cb) => {
                let stream = StreamCore::from_core(core);
                cb(lp, &stream, &err);
                let mut guard = core.borrow_mut();
                let slot = if dir.is_readable() {
                    &mut guard.on_read_error
                } else {
                    &mut guard.on_write_error
                };
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
            None => {
                warn!("unhandled stream error, closing: {}", err);
                StreamCore::do_close(core, lp);
            }
        }
    }

    fn do_close(core: &Rc<RefCell<StreamCore>>, lp: &mut EventLoop) {
        {
            let mut guard = core.borrow_mut();
            if guard.closed {
                return;
            }
            guard.closed = true;
            if guard.base.is_attached() {
                guard.disarm(lp);
            }
            guard.read_fd = None;
            guard.write_fd = None;
            guard.sendbuff.clear();
            guard.close_pending = false;
        }
        let cb = core.borrow_mut().on_closed.take();
        if let Some(mut cb) = cb {
            let stream = StreamCore::from_core(core);
            cb(lp, &stream);
        }
        let node: NotifierRef = core.clone();
        lp.orphan(&node);
    }
}

impl Notify for StreamCore {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NotifierBase {
        &mut self.base
    }

    fn attached(&mut self, lp: &mut EventLoop) {
        if let Err(e) = self.rearm(lp) {
            warn!("failed to arm stream on attach: {}", e);
        }
    }

    fn detached(&mut self, lp: &mut EventLoop) {
        self.disarm(lp);
    }
}
