//! The ordered timer queue and the countdown notifier built on it.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::trace;

use crate::event_loop::EventLoop;
use crate::notifier::{AsNotifier, Notify, NotifierBase, NotifierRef};
use crate::Result;

pub(crate) type TimerCallback = Box<dyn FnOnce(&mut EventLoop)>;

/// An opaque handle to a pending timer, suitable for cancellation.
///
/// Returned by the `watch_time` family on [`EventLoop`]. A timer fires at
/// most once; re-arming produces a fresh id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimeoutId(u64);

struct Entry {
    deadline: Instant,
    seq: u64,
    id: u64,
    callback: TimerCallback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        // Reversed so the `BinaryHeap` max-heap yields the earliest
        // deadline first; equal deadlines fall back to insertion order.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Min-heap of timer deadlines.
///
/// Cancellation is logical: the id is dropped from the live set and the
/// heap entry is skipped when it surfaces. `next_deadline` prunes dead
/// entries from the top so the reported deadline is always a live one.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Entry>,
    live: HashSet<u64>,
    next_id: u64,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, deadline: Instant, callback: TimerCallback) -> TimeoutId {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(id);
        self.heap.push(Entry {
            deadline,
            seq,
            id,
            callback,
        });
        trace!("enqueued timer id={} seq={}", id, seq);
        TimeoutId(id)
    }

    /// Cancels a pending timer. Unknown or already-fired ids are a no-op.
    pub(crate) fn cancel(&mut self, id: TimeoutId) -> bool {
        self.live.remove(&id.0)
    }

    pub(crate) fn is_pending(&self, id: TimeoutId) -> bool {
        self.live.contains(&id.0)
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    /// The deadline the backend sleep must not overshoot, if any timer is
    /// pending.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.live.contains(&top.id) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Sequence watermark; entries enqueued from now on compare `>=` it.
    pub(crate) fn seq_watermark(&self) -> u64 {
        self.next_seq
    }

    /// Pops the next timer that is due at `now` and predates the
    /// `seq_limit` watermark. Timers installed during the current turn
    /// stay queued for the next one even when their deadline is already
    /// in the past.
    pub(crate) fn pop_due(&mut self, now: Instant, seq_limit: u64) -> Option<TimerCallback> {
        loop {
            let fire = match self.heap.peek() {
                Some(top) if !self.live.contains(&top.id) => false,
                Some(top) => {
                    if top.deadline > now || top.seq >= seq_limit {
                        return None;
                    }
                    true
                }
                None => return None,
            };
            let entry = self.heap.pop().expect("peeked entry vanished");
            if fire {
                self.live.remove(&entry.id);
                return Some(entry.callback);
            }
        }
    }
}

/// A re-armable countdown attached to the notifier tree.
///
/// `Countdown` wraps a single pending timer: [`start`] arms it for the
/// configured delay, [`stop`] cancels it, and expiry invokes the
/// `on_expire` callback. Detaching from the loop cancels any pending
/// countdown, so a stopped or removed instance leaves nothing behind in
/// the timer queue.
///
/// [`start`]: Countdown::start
/// [`stop`]: Countdown::stop
#[derive(Clone)]
pub struct Countdown {
    core: Rc<RefCell<CountdownCore>>,
}

pub(crate) struct CountdownCore {
    base: NotifierBase,
    self_weak: Weak<RefCell<CountdownCore>>,
    delay: Duration,
    on_expire: Option<Rc<RefCell<dyn FnMut(&mut EventLoop)>>>,
    pending: Option<TimeoutId>,
}

impl Countdown {
    /// Returns a countdown with the given delay, not yet started.
    pub fn new(delay: Duration) -> Countdown {
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(CountdownCore {
                base: NotifierBase::new(),
                self_weak: weak.clone(),
                delay,
                on_expire: None,
                pending: None,
            })
        });
        Countdown { core }
    }

    /// Installs the expiry callback, replacing any previous one.
    pub fn on_expire<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        self.core.borrow_mut().on_expire = Some(Rc::new(RefCell::new(callback)));
        self
    }

    /// Changes the delay used by subsequent starts.
    pub fn set_delay(&self, delay: Duration) {
        self.core.borrow_mut().delay = delay;
    }

    /// Returns true if the countdown is currently armed.
    pub fn is_running(&self) -> bool {
        self.core.borrow().pending.is_some()
    }

    /// Arms the countdown. A running countdown is restarted from now.
    pub fn start(&self, lp: &mut EventLoop) -> Result<()> {
        self.stop(lp);
        let weak = self.core.borrow().self_weak.clone();
        let delay = self.core.borrow().delay;
        let id = lp.watch_time_after(delay, move |lp| {
            let Some(core) = weak.upgrade() else { return };
            core.borrow_mut().pending = None;
            let cb = core.borrow().on_expire.clone();
            if let Some(cb) = cb {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    f(lp);
                }
            }
        });
        self.core.borrow_mut().pending = Some(id);
        Ok(())
    }

    /// Cancels a pending countdown; a stopped countdown is a no-op.
    pub fn stop(&self, lp: &mut EventLoop) {
        if let Some(id) = self.core.borrow_mut().pending.take() {
            lp.unwatch_time(id);
        }
    }

    /// Stops and starts in one step.
    pub fn reset(&self, lp: &mut EventLoop) -> Result<()> {
        self.start(lp)
    }
}

impl AsNotifier for Countdown {
    fn notifier_ref(&self) -> NotifierRef {
        self.core.clone()
    }
}

impl Notify for CountdownCore {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NotifierBase {
        &mut self.base
    }

    fn attached(&mut self, _lp: &mut EventLoop) {}

    fn detached(&mut self, lp: &mut EventLoop) {
        if let Some(id) = self.pending.take() {
            lp.unwatch_time(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop() -> TimerCallback {
        Box::new(|_| {})
    }

    #[test]
    fn deadline_order_with_fifo_ties() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let a = queue.enqueue(now + Duration::from_millis(10), nop());
        let _b = queue.enqueue(now + Duration::from_millis(5), nop());
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(5)));

        queue.cancel(a);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(5)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut queue = TimerQueue::new();
        let id = queue.enqueue(Instant::now(), nop());
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn pop_due_respects_watermark() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.enqueue(now - Duration::from_millis(1), nop());
        let limit = queue.seq_watermark();
        // Enqueued after the watermark: due, but held for the next turn.
        queue.enqueue(now - Duration::from_millis(1), nop());

        assert!(queue.pop_due(now, limit).is_some());
        assert!(queue.pop_due(now, limit).is_none());
        assert_eq!(queue.len(), 1);
    }
}
