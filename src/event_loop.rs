//! The loop dispatcher.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::backend::{Backend, PollBackend, BACKEND_API_VERSION};
use crate::notifier::{self, misuse, AsNotifier, LoopId, NotifierId, NotifierRef};
use crate::process::WaitStatus;
use crate::signals::{Signal, SignalProxy};
use crate::timer::{TimeoutId, TimerQueue};
use crate::{Error, Event, Events, Interest, Result};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SHARED: RefCell<Option<Rc<RefCell<EventLoop>>>> = RefCell::new(None);
}

/// Runtime tunables for an [`EventLoop`].
#[derive(Copy, Clone, Debug)]
pub struct LoopConfig {
    /// Upper bound on one backend sleep while a signal proxy is
    /// installed. Narrows the window between a handler check and the
    /// blocking syscall.
    pub signal_wait_cap: Duration,

    /// How many bytes a stream reads from its descriptor per readiness
    /// event.
    pub read_chunk_size: usize,

    /// How many bytes a stream writes per `syswrite` while draining its
    /// outgoing buffer.
    pub write_chunk_size: usize,

    /// Sizing hint for the readiness event buffer.
    pub events_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> LoopConfig {
        LoopConfig {
            signal_wait_cap: Duration::from_secs(1),
            read_chunk_size: 8 * 1024,
            write_chunk_size: 8 * 1024,
            events_capacity: 1024,
        }
    }
}

// Repeated callbacks are shared so a watch can be replaced or removed
// while an invocation of the old callback is still on the stack.
pub(crate) type SharedCallback = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;
type IdleCallback = Box<dyn FnOnce(&mut EventLoop)>;
type ChildCallback = Box<dyn FnMut(&mut EventLoop, libc::pid_t, WaitStatus)>;

/// Cancellation handle for an idle deferral.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct IdleId(u64);

/// Cancellation handle for a multiplexed signal callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SignalHandlerId(u64);

#[derive(Default)]
struct IoWatch {
    on_read: Option<SharedCallback>,
    on_write: Option<SharedCallback>,
    on_hangup: Option<SharedCallback>,
}

impl IoWatch {
    fn interest(&self) -> Option<Interest> {
        let mut interest: Option<Interest> = None;
        let mut push = |dir: Interest| {
            interest = Some(match interest {
                Some(cur) => dir.add(cur),
                None => dir,
            });
        };
        if self.on_read.is_some() {
            push(Interest::READABLE);
        }
        if self.on_write.is_some() {
            push(Interest::WRITABLE);
        }
        if self.on_hangup.is_some() {
            push(Interest::HANGUP);
        }
        interest
    }

    fn slot(&self, dir: Interest) -> Option<&SharedCallback> {
        if dir == Interest::READABLE {
            self.on_read.as_ref()
        } else if dir == Interest::WRITABLE {
            self.on_write.as_ref()
        } else {
            self.on_hangup.as_ref()
        }
    }
}

enum SignalSlot {
    /// One low-level callback, replaced wholesale by `watch_signal`.
    Single(SharedCallback),
    /// The signal is multiplexed through `attach_signal` handlers.
    Mux,
}

struct RunFrame {
    stopped: bool,
    result: Option<Box<dyn Any>>,
}

/// The single-threaded cooperative dispatcher.
///
/// An `EventLoop` owns a readiness [`Backend`], the timer queue, the idle
/// deferral list, the signal proxy and the child-watch table, and drives
/// them one *turn* at a time: sleep on the backend up to the effective
/// deadline, run the I/O callbacks the kernel reported, fire due timers,
/// then drain the idle deferrals that were pending when the turn began.
///
/// All callbacks receive `&mut EventLoop` and run to completion on the
/// calling thread; the only re-entrancy is an explicit nested
/// [`run`](EventLoop::run).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use coio::EventLoop;
///
/// let mut lp = EventLoop::new().unwrap();
/// lp.watch_time_after(Duration::from_millis(1), |lp| lp.stop(42i32));
/// let result = lp.run().unwrap();
/// assert_eq!(*result.downcast::<i32>().unwrap(), 42);
/// ```
pub struct EventLoop {
    id: LoopId,
    config: LoopConfig,
    backend: Box<dyn Backend>,
    events: Events,

    notifiers: HashMap<NotifierId, NotifierRef>,
    next_notifier_id: u64,

    iowatches: HashMap<RawFd, IoWatch>,
    timequeue: TimerQueue,
    deferrals: Vec<(IdleId, IdleCallback)>,
    next_idle_id: u64,

    sigproxy: Option<SignalProxy>,
    sigwatch: HashMap<libc::c_int, SignalSlot>,
    sigattached: HashMap<libc::c_int, Vec<(SignalHandlerId, SharedCallback)>>,
    next_signal_handler_id: u64,
    sigchld_handler: Option<SignalHandlerId>,

    childwatches: HashMap<libc::pid_t, ChildCallback>,
    wildcard_child: Option<ChildCallback>,
    unclaimed_children: HashMap<libc::pid_t, WaitStatus>,

    run_frames: Vec<RunFrame>,
}

impl EventLoop {
    /// Returns a loop over the default [`PollBackend`].
    pub fn new() -> Result<EventLoop> {
        EventLoop::with_config(LoopConfig::default())
    }

    /// Returns a loop with explicit tunables.
    pub fn with_config(config: LoopConfig) -> Result<EventLoop> {
        EventLoop::with_backend(Box::new(PollBackend::new()), config)
    }

    /// Returns a loop driving a caller-supplied backend.
    pub fn with_backend(backend: Box<dyn Backend>, config: LoopConfig) -> Result<EventLoop> {
        if backend.api_version() < BACKEND_API_VERSION {
            return Err(Error::io(
                "backend",
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!(
                        "backend api version {} is older than required {}",
                        backend.api_version(),
                        BACKEND_API_VERSION
                    ),
                ),
            ));
        }
        let events = Events::with_capacity(config.events_capacity);
        Ok(EventLoop {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            config,
            backend,
            events,
            notifiers: HashMap::new(),
            next_notifier_id: 1,
            iowatches: HashMap::new(),
            timequeue: TimerQueue::new(),
            deferrals: Vec::new(),
            next_idle_id: 1,
            sigproxy: None,
            sigwatch: HashMap::new(),
            sigattached: HashMap::new(),
            next_signal_handler_id: 1,
            sigchld_handler: None,
            childwatches: HashMap::new(),
            wildcard_child: None,
            unclaimed_children: HashMap::new(),
            run_frames: Vec::new(),
        })
    }

    /// Returns the thread's cached loop, creating it on first use.
    ///
    /// Most programs want exactly one loop; this is the constructor for
    /// them. Code that needs several loops, or a non-default backend,
    /// uses [`new`](EventLoop::new) or
    /// [`with_backend`](EventLoop::with_backend) instead.
    pub fn shared() -> Result<Rc<RefCell<EventLoop>>> {
        SHARED.with(|cell| {
            let mut slot = cell.borrow_mut();
            if let Some(lp) = &*slot {
                return Ok(lp.clone());
            }
            let lp = Rc::new(RefCell::new(EventLoop::new()?));
            *slot = Some(lp.clone());
            Ok(lp)
        })
    }

    /// The loop's tunables.
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    // === notifier membership ===

    /// Adds a detached root notifier (and its whole subtree) to the loop.
    pub fn add(&mut self, notifier: &impl AsNotifier) -> Result<NotifierId> {
        let node = notifier.notifier_ref();
        {
            let guard = node.borrow();
            let base = guard.base();
            if base.is_attached() {
                return Err(misuse("notifier is already attached to a loop"));
            }
            if base.has_parent() {
                return Err(misuse("notifier has a parent; add its root instead"));
            }
        }
        let id = NotifierId(self.next_notifier_id);
        self.next_notifier_id += 1;
        node.borrow_mut().base_mut().root_id = Some(id);
        self.notifiers.insert(id, node.clone());
        notifier::attach_tree(self, &node, self.id);
        trace!("added root notifier {:?}", id);
        Ok(id)
    }

    /// Removes a root notifier and its subtree from the loop.
    pub fn remove(&mut self, notifier: &impl AsNotifier) -> Result<()> {
        let node = notifier.notifier_ref();
        let (root_id, loop_id) = {
            let guard = node.borrow();
            (guard.base().root_id, guard.base().loop_id)
        };
        let id = root_id.ok_or_else(|| misuse("notifier is not a root member of a loop"))?;
        if loop_id != Some(self.id) {
            return Err(misuse("notifier belongs to a different loop"));
        }
        let node = self
            .notifiers
            .remove(&id)
            .ok_or_else(|| misuse("notifier is not a member of this loop"))?;
        node.borrow_mut().base_mut().root_id = None;
        notifier::detach_tree(self, &node);
        trace!("removed root notifier {:?}", id);
        Ok(())
    }

    /// Links `child` underneath `parent`, attaching it if the parent is
    /// attached.
    pub fn add_child(&mut self, parent: &impl AsNotifier, child: &impl AsNotifier) -> Result<()> {
        let p = parent.notifier_ref();
        let c = child.notifier_ref();
        if Rc::ptr_eq(&p, &c) {
            return Err(misuse("a notifier cannot adopt itself"));
        }
        {
            let guard = c.borrow();
            let base = guard.base();
            if base.is_attached() || base.has_parent() {
                return Err(misuse("child is already attached or parented"));
            }
        }
        let parent_loop = p.borrow().base().loop_id;
        if let Some(lid) = parent_loop {
            if lid != self.id {
                return Err(misuse("parent belongs to a different loop"));
            }
        }
        p.borrow_mut().base_mut().children.push(c.clone());
        c.borrow_mut().base_mut().parent = Some(Rc::downgrade(&p));
        if parent_loop.is_some() {
            notifier::attach_tree(self, &c, self.id);
        }
        Ok(())
    }

    /// Unlinks `child` from `parent`, detaching its subtree first when
    /// attached.
    pub fn remove_child(
        &mut self,
        parent: &impl AsNotifier,
        child: &impl AsNotifier,
    ) -> Result<()> {
        let p = parent.notifier_ref();
        let c = child.notifier_ref();
        self.remove_child_ref(&p, &c)
    }

    fn remove_child_ref(&mut self, p: &NotifierRef, c: &NotifierRef) -> Result<()> {
        let is_child = {
            let guard = c.borrow();
            guard
                .base()
                .parent
                .as_ref()
                .and_then(|w| w.upgrade())
                .map_or(false, |actual| Rc::ptr_eq(&actual, p))
        };
        if !is_child {
            return Err(misuse("notifier is not a child of that parent"));
        }
        if c.borrow().base().is_attached() {
            notifier::detach_tree(self, c);
        }
        p.borrow_mut()
            .base_mut()
            .children
            .retain(|n| !Rc::ptr_eq(n, c));
        c.borrow_mut().base_mut().parent = None;
        Ok(())
    }

    /// Detaches `node` from whatever holds it: its parent if it has one,
    /// the root table otherwise. Used by notifiers that remove themselves
    /// on close.
    pub(crate) fn orphan(&mut self, node: &NotifierRef) {
        let parent = node
            .borrow()
            .base()
            .parent
            .as_ref()
            .and_then(|w| w.upgrade());
        if let Some(parent) = parent {
            let _ = self.remove_child_ref(&parent, node);
            return;
        }
        let root_id = node.borrow().base().root_id;
        if let Some(id) = root_id {
            if let Some(node) = self.notifiers.remove(&id) {
                node.borrow_mut().base_mut().root_id = None;
                notifier::detach_tree(self, &node);
            }
        }
    }

    /// Number of root notifiers currently attached.
    pub fn notifier_count(&self) -> usize {
        self.notifiers.len()
    }

    // === descriptor watches ===

    /// Installs `callback` for every direction named in `interest` on
    /// `fd`, replacing whatever was installed for those directions.
    /// Directions not named keep their existing callback.
    ///
    /// Fails when hangup interest is requested on a backend that cannot
    /// report it.
    pub fn watch_io<F>(&mut self, fd: RawFd, interest: Interest, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        if interest.is_hangup() && !self.backend.supports_hangup() {
            return Err(Error::io(
                "watch_io",
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    "backend cannot report hangup readiness",
                ),
            ));
        }

        let prev = self.iowatches.get(&fd).and_then(IoWatch::interest);
        let added = match prev {
            Some(p) => interest.remove(p),
            None => Some(interest),
        };
        if let Some(added) = added {
            self.backend.watch_io(fd, added).map_err(Error::Backend)?;
        }

        let cb: SharedCallback = Rc::new(RefCell::new(callback));
        let watch = self.iowatches.entry(fd).or_default();
        if interest.is_readable() {
            watch.on_read = Some(cb.clone());
        }
        if interest.is_writable() {
            watch.on_write = Some(cb.clone());
        }
        if interest.is_hangup() {
            watch.on_hangup = Some(cb);
        }
        trace!("watching fd={} interest={:?}", fd, interest);
        Ok(())
    }

    /// Removes the directions named in `which` from the watch on `fd`.
    /// Unknown descriptors or directions are a no-op; the watch entry is
    /// released once its last direction is cleared.
    pub fn unwatch_io(&mut self, fd: RawFd, which: Interest) -> Result<()> {
        let Some(watch) = self.iowatches.get_mut(&fd) else {
            return Ok(());
        };
        let prev = watch.interest();
        if which.is_readable() {
            watch.on_read = None;
        }
        if which.is_writable() {
            watch.on_write = None;
        }
        if which.is_hangup() {
            watch.on_hangup = None;
        }
        let now = watch.interest();
        if now.is_none() {
            self.iowatches.remove(&fd);
        }
        let removed = match (prev, now) {
            (Some(p), Some(n)) => p.remove(n),
            (Some(p), None) => Some(p),
            (None, _) => None,
        };
        if let Some(removed) = removed {
            self.backend
                .unwatch_io(fd, removed)
                .map_err(Error::Backend)?;
            trace!("unwatched fd={} which={:?}", fd, removed);
        }
        Ok(())
    }

    /// The directions currently watched on `fd`, if any.
    pub fn io_interest(&self, fd: RawFd) -> Option<Interest> {
        self.iowatches.get(&fd).and_then(IoWatch::interest)
    }

    // === timers ===

    /// Schedules `callback` to run once `at` is reached.
    pub fn watch_time_at<F>(&mut self, at: Instant, callback: F) -> TimeoutId
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.timequeue.enqueue(at, Box::new(callback))
    }

    /// Schedules `callback` to run `delay` from now.
    pub fn watch_time_after<F>(&mut self, delay: Duration, callback: F) -> TimeoutId
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.watch_time_at(Instant::now() + delay, callback)
    }

    /// Schedules `callback` to run `delay` after the caller's `now`.
    pub fn watch_time_after_from<F>(
        &mut self,
        now: Instant,
        delay: Duration,
        callback: F,
    ) -> TimeoutId
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.watch_time_at(now + delay, callback)
    }

    /// Cancels a pending timer; unknown ids are a no-op.
    pub fn unwatch_time(&mut self, id: TimeoutId) {
        self.timequeue.cancel(id);
    }

    /// Returns true while the timer has neither fired nor been cancelled.
    pub fn time_pending(&self, id: TimeoutId) -> bool {
        self.timequeue.is_pending(id)
    }

    /// Number of pending timers.
    pub fn timer_count(&self) -> usize {
        self.timequeue.len()
    }

    // === idle deferrals ===

    /// Schedules `callback` to run after the next readiness turn.
    /// Installing from within a deferral pushes the new one to the turn
    /// after.
    pub fn watch_idle<F>(&mut self, callback: F) -> IdleId
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        let id = IdleId(self.next_idle_id);
        self.next_idle_id += 1;
        self.deferrals.push((id, Box::new(callback)));
        id
    }

    /// Cancels a pending deferral. One that has already been snapshotted
    /// into the current drain is past cancelling.
    pub fn unwatch_idle(&mut self, id: IdleId) {
        self.deferrals.retain(|(pending, _)| *pending != id);
    }

    /// Number of deferrals pending for the next turn.
    pub fn idle_count(&self) -> usize {
        self.deferrals.len()
    }

    // === signals ===

    /// Installs the low-level callback for `signal`, replacing any
    /// previous one. Fails while the signal is multiplexed through
    /// [`attach_signal`](EventLoop::attach_signal).
    pub fn watch_signal<F>(&mut self, signal: Signal, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        if let Some(SignalSlot::Mux) = self.sigwatch.get(&signal.raw()) {
            return Err(misuse("signal is multiplexed; use attach_signal"));
        }
        self.proxy_install(signal)?;
        self.sigwatch.insert(
            signal.raw(),
            SignalSlot::Single(Rc::new(RefCell::new(callback))),
        );
        Ok(())
    }

    /// Removes the low-level watch for `signal` and restores the prior
    /// disposition. A multiplexed signal is left alone.
    pub fn unwatch_signal(&mut self, signal: Signal) {
        match self.sigwatch.get(&signal.raw()) {
            Some(SignalSlot::Single(_)) => {
                self.sigwatch.remove(&signal.raw());
                self.proxy_uninstall(signal);
            }
            Some(SignalSlot::Mux) => {
                warn!(
                    "unwatch_signal({:?}) ignored: signal is multiplexed",
                    signal
                );
            }
            None => {}
        }
    }

    /// Adds `callback` to the multiplexed handler list for `signal`.
    /// Any number of handlers can share one signal; each fires once per
    /// observed delivery.
    pub fn attach_signal<F>(&mut self, signal: Signal, callback: F) -> Result<SignalHandlerId>
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        match self.sigwatch.get(&signal.raw()) {
            Some(SignalSlot::Single(_)) => {
                return Err(misuse("signal already has a low-level watch"));
            }
            Some(SignalSlot::Mux) => {}
            None => {
                self.proxy_install(signal)?;
                self.sigwatch.insert(signal.raw(), SignalSlot::Mux);
            }
        }
        let id = SignalHandlerId(self.next_signal_handler_id);
        self.next_signal_handler_id += 1;
        self.sigattached
            .entry(signal.raw())
            .or_default()
            .push((id, Rc::new(RefCell::new(callback))));
        Ok(id)
    }

    /// Removes one multiplexed handler; the last removal releases the
    /// signal entirely.
    pub fn detach_signal(&mut self, signal: Signal, id: SignalHandlerId) {
        let mut emptied = false;
        if let Some(handlers) = self.sigattached.get_mut(&signal.raw()) {
            handlers.retain(|(hid, _)| *hid != id);
            emptied = handlers.is_empty();
        }
        if emptied {
            self.sigattached.remove(&signal.raw());
            if matches!(self.sigwatch.get(&signal.raw()), Some(SignalSlot::Mux)) {
                self.sigwatch.remove(&signal.raw());
            }
            self.proxy_uninstall(signal);
        }
    }

    fn proxy_install(&mut self, signal: Signal) -> Result<()> {
        if self.sigproxy.is_none() {
            let proxy = SignalProxy::new().map_err(|e| Error::io("signal proxy", e))?;
            let fd = proxy.read_fd();
            self.sigproxy = Some(proxy);
            if let Err(e) = self.watch_io(fd, Interest::READABLE, |lp| lp.drain_signals()) {
                self.sigproxy = None;
                return Err(e);
            }
        }
        self.sigproxy
            .as_mut()
            .expect("proxy installed above")
            .install(signal)
            .map_err(|e| Error::io("sigaction", e))
    }

    fn proxy_uninstall(&mut self, signal: Signal) {
        let Some(proxy) = self.sigproxy.as_mut() else {
            return;
        };
        proxy.uninstall(signal);
        if proxy.is_empty() {
            let fd = proxy.read_fd();
            self.sigproxy = None;
            let _ = self.unwatch_io(fd, Interest::READABLE);
        }
    }

    /// Empties the proxy pipe and dispatches every delivery recorded
    /// since the previous drain.
    fn drain_signals(&mut self) {
        let Some(proxy) = self.sigproxy.as_mut() else {
            return;
        };
        let fired = proxy.drain();
        for (signo, count) in fired {
            trace!("signal {} delivered {} time(s)", signo, count);
            match self.sigwatch.get(&signo) {
                Some(SignalSlot::Single(cb)) => {
                    let cb = cb.clone();
                    for _ in 0..count {
                        if !self.sigwatch.contains_key(&signo) {
                            break;
                        }
                        if let Ok(mut f) = cb.try_borrow_mut() {
                            f(self);
                        }
                    }
                }
                Some(SignalSlot::Mux) => {
                    let handlers = self.sigattached.get(&signo).cloned().unwrap_or_default();
                    for _ in 0..count {
                        for (id, cb) in &handlers {
                            let still_attached = self
                                .sigattached
                                .get(&signo)
                                .map_or(false, |hs| hs.iter().any(|(hid, _)| hid == id));
                            if !still_attached {
                                continue;
                            }
                            if let Ok(mut f) = cb.try_borrow_mut() {
                                f(self);
                            }
                        }
                    }
                }
                None => {}
            }
        }
    }

    // === child watches ===

    /// Watches for the exit of `pid`. Pid 0 installs the wildcard
    /// handler, which stays resident and receives every reaped child that
    /// has no specific handler; a specific handler fires once and is
    /// removed.
    ///
    /// A child that has already exited is handled: its status is picked
    /// up immediately and the callback is scheduled through the idle
    /// list, so it still runs on a later turn.
    pub fn watch_child<F>(&mut self, pid: libc::pid_t, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop, libc::pid_t, WaitStatus) + 'static,
    {
        if pid == 0 {
            self.wildcard_child = Some(Box::new(callback));
            return self.ensure_sigchld();
        }

        // The handler goes in before the probe below, so an exit landing
        // between the two still raises a delivery.
        self.ensure_sigchld()?;

        if let Some(status) = self.unclaimed_children.remove(&pid) {
            let mut callback = callback;
            self.watch_idle(move |lp| callback(lp, pid, status));
            return Ok(());
        }

        // The child may have exited before this watch was installed, in
        // which case no further SIGCHLD is coming for it.
        let mut raw = 0;
        match syscall!(waitpid(pid, &mut raw, libc::WNOHANG)) {
            Ok(p) if p == pid => {
                let status = WaitStatus::from_raw(raw);
                let mut callback = callback;
                self.watch_idle(move |lp| callback(lp, pid, status));
                Ok(())
            }
            _ => {
                self.childwatches.insert(pid, Box::new(callback));
                Ok(())
            }
        }
    }

    /// Drops the handler for `pid` (0 drops the wildcard handler).
    pub fn unwatch_child(&mut self, pid: libc::pid_t) {
        if pid == 0 {
            self.wildcard_child = None;
        } else {
            self.childwatches.remove(&pid);
        }
    }

    /// Number of specific-pid handlers currently installed.
    pub fn child_watch_count(&self) -> usize {
        self.childwatches.len()
    }

    /// Returns true while a wildcard child handler is installed.
    pub fn has_wildcard_child_watch(&self) -> bool {
        self.wildcard_child.is_some()
    }

    fn ensure_sigchld(&mut self) -> Result<()> {
        if self.sigchld_handler.is_none() {
            let id = self.attach_signal(Signal::CHLD, |lp| lp.reap_children())?;
            self.sigchld_handler = Some(id);
        }
        Ok(())
    }

    /// Reaps exited children without blocking and dispatches their
    /// statuses. Harmless to call when nothing has exited.
    pub fn reap_children(&mut self) {
        loop {
            let mut raw = 0;
            let pid = unsafe { libc::waitpid(-1, &mut raw, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            debug!("reaped child pid={}", pid);
            self.deliver_child_status(pid, WaitStatus::from_raw(raw));
        }
    }

    fn deliver_child_status(&mut self, pid: libc::pid_t, status: WaitStatus) {
        if let Some(mut cb) = self.childwatches.remove(&pid) {
            cb(self, pid, status);
        } else if let Some(mut cb) = self.wildcard_child.take() {
            cb(self, pid, status);
            if self.wildcard_child.is_none() {
                self.wildcard_child = Some(cb);
            }
        } else {
            self.unclaimed_children.insert(pid, status);
        }
    }

    // === turns ===

    /// Runs one turn: sleep on the backend up to the effective deadline,
    /// dispatch reported I/O, fire due timers, then drain the deferrals
    /// that were already pending when the turn began.
    ///
    /// The effective deadline is the smallest of the caller's `timeout`,
    /// the next timer deadline, zero when deferrals are pending, and the
    /// configured signal wait cap while a signal proxy is installed.
    pub fn loop_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let seq_limit = self.timequeue.seq_watermark();
        let timeout = self.effective_timeout(timeout);
        trace!("turn: sleeping up to {:?}", timeout);

        let mut events = mem::take(&mut self.events);
        let res = self.backend.poll(&mut events, timeout);
        if let Err(e) = res {
            self.events = events;
            return Err(Error::Backend(e));
        }

        let mut i = 0;
        while let Some(event) = events.get(i) {
            self.dispatch_io(event);
            i += 1;
        }
        self.events = events;

        self.fire_timers(seq_limit);
        self.run_deferrals();
        Ok(())
    }

    /// Runs turns until [`stop`](EventLoop::stop) is called, returning
    /// the value it supplied. Nesting is allowed: a callback may call
    /// `run` again, and `stop` always finishes the innermost `run`.
    pub fn run(&mut self) -> Result<Box<dyn Any>> {
        self.run_frames.push(RunFrame {
            stopped: false,
            result: None,
        });
        let depth = self.run_frames.len();
        loop {
            if self.run_frames[depth - 1].stopped {
                let frame = self.run_frames.pop().expect("run frame vanished");
                return Ok(frame.result.unwrap_or_else(|| Box::new(())));
            }
            if let Err(e) = self.loop_once(None) {
                self.run_frames.pop();
                return Err(e);
            }
        }
    }

    /// Like [`run`](EventLoop::run), discarding the stop value.
    pub fn loop_forever(&mut self) -> Result<()> {
        self.run().map(|_| ())
    }

    /// Finishes the innermost [`run`](EventLoop::run), handing it
    /// `result`. Outside of `run` this is a no-op.
    pub fn stop<T: Any>(&mut self, result: T) {
        match self.run_frames.last_mut() {
            Some(frame) => {
                frame.stopped = true;
                frame.result = Some(Box::new(result));
            }
            None => debug!("stop called outside run"),
        }
    }

    /// Discards every watch inherited across a `fork`, restores signal
    /// dispositions, and gives the loop a fresh backend. For use in a
    /// child process that wants a loop of its own; the parent's
    /// registrations must never dispatch there.
    pub fn post_fork(&mut self) {
        self.iowatches.clear();
        self.timequeue = TimerQueue::new();
        self.deferrals.clear();
        self.sigwatch.clear();
        self.sigattached.clear();
        self.sigchld_handler = None;
        self.sigproxy = None;
        self.childwatches.clear();
        self.wildcard_child = None;
        self.unclaimed_children.clear();
        self.notifiers.clear();
        self.run_frames.clear();
        self.events.clear();
        self.backend = Box::new(PollBackend::new());
    }

    fn effective_timeout(&mut self, user: Option<Duration>) -> Option<Duration> {
        let mut timeout = user;
        if let Some(deadline) = self.timequeue.next_deadline() {
            let until = deadline.saturating_duration_since(Instant::now());
            timeout = Some(timeout.map_or(until, |t| t.min(until)));
        }
        if self.sigproxy.is_some() {
            let cap = self.config.signal_wait_cap;
            timeout = Some(timeout.map_or(cap, |t| t.min(cap)));
        }
        if !self.deferrals.is_empty() {
            timeout = Some(Duration::ZERO);
        }
        timeout
    }

    fn dispatch_io(&mut self, event: Event) {
        let fd = usize::from(event.token()) as RawFd;
        if event.is_readable() {
            self.invoke_io(fd, Interest::READABLE);
        }
        if event.is_writable() {
            self.invoke_io(fd, Interest::WRITABLE);
        }
        if event.is_hangup() {
            self.invoke_io(fd, Interest::HANGUP);
        }
    }

    fn invoke_io(&mut self, fd: RawFd, dir: Interest) {
        // Re-fetched per direction: a callback that cancels its sibling
        // within the same turn must win.
        let cb = self
            .iowatches
            .get(&fd)
            .and_then(|watch| watch.slot(dir))
            .cloned();
        if let Some(cb) = cb {
            if let Ok(mut f) = cb.try_borrow_mut() {
                f(self);
            }
        }
    }

    fn fire_timers(&mut self, seq_limit: u64) {
        let now = Instant::now();
        while let Some(callback) = self.timequeue.pop_due(now, seq_limit) {
            callback(self);
        }
    }

    fn run_deferrals(&mut self) {
        // Snapshot so a deferral installing another one defers it to the
        // next turn.
        let batch = mem::take(&mut self.deferrals);
        for (_, callback) in batch {
            callback(self);
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("id", &self.id)
            .field("notifiers", &self.notifiers.len())
            .field("iowatches", &self.iowatches.len())
            .field("timers", &self.timequeue.len())
            .field("deferrals", &self.deferrals.len())
            .finish()
    }
}
