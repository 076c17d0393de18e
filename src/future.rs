//! A completion handle driven by the loop.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::event_loop::EventLoop;
use crate::{Error, Result};

/// A slot that some loop-driven operation will eventually fill.
///
/// Waiting is not an OS primitive here: [`block_until_ready`] simply
/// drives [`loop_once`](EventLoop::loop_once) until the slot is filled,
/// so every other watch keeps dispatching meanwhile. Clones share the
/// slot; whichever side holds the producer end calls
/// [`complete`](LoopFuture::complete) exactly once, later completions
/// are ignored.
///
/// [`block_until_ready`]: LoopFuture::block_until_ready
pub struct LoopFuture<T> {
    state: Rc<RefCell<Option<Result<T>>>>,
}

impl<T> Clone for LoopFuture<T> {
    fn clone(&self) -> Self {
        LoopFuture {
            state: self.state.clone(),
        }
    }
}

impl<T: 'static> LoopFuture<T> {
    /// Returns an unfilled slot.
    pub fn new() -> LoopFuture<T> {
        LoopFuture {
            state: Rc::new(RefCell::new(None)),
        }
    }

    /// Fills the slot. The first completion wins.
    pub fn complete(&self, result: Result<T>) {
        let mut slot = self.state.borrow_mut();
        if slot.is_none() {
            *slot = Some(result);
        }
    }

    /// Returns true once the slot is filled.
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Takes the result if the slot is filled.
    pub fn try_take(&self) -> Option<Result<T>> {
        self.state.borrow_mut().take()
    }

    /// Drives the loop until the slot fills, then takes the result.
    pub fn block_until_ready(&self, lp: &mut EventLoop) -> Result<T> {
        while !self.is_ready() {
            lp.loop_once(None)?;
        }
        self.try_take().expect("slot checked above")
    }

    /// Like [`block_until_ready`](LoopFuture::block_until_ready), but
    /// gives up with [`Error::TimedOut`] once `timeout` elapses.
    pub fn block_with_timeout(&self, lp: &mut EventLoop, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        while !self.is_ready() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimedOut);
            }
            lp.loop_once(Some(deadline - now))?;
        }
        self.try_take().expect("slot checked above")
    }
}

impl<T: 'static> Default for LoopFuture<T> {
    fn default() -> Self {
        LoopFuture::new()
    }
}
