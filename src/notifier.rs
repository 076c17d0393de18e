//! The notifier object tree.
//!
//! User-level objects (streams, listeners, countdowns, signal watchers,
//! processes) are notifiers: polymorphic nodes that can be attached to an
//! [`EventLoop`] either directly (a *root*) or underneath another notifier
//! (a *child*). Attaching a node attaches its whole subtree and lets each
//! node arm its loop resources; detaching reverses that.
//!
//! A notifier belongs to at most one loop at a time, and is either a root
//! or has a parent, never both. Moving a notifier requires removing it
//! first.

use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};

use crate::event_loop::EventLoop;
use crate::Error;

/// Identity of a root notifier within its loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NotifierId(pub(crate) u64);

pub(crate) type LoopId = u64;

/// A shared reference to a notifier node.
pub type NotifierRef = Rc<RefCell<dyn Notify>>;

/// State common to every notifier node.
pub struct NotifierBase {
    pub(crate) parent: Option<Weak<RefCell<dyn Notify>>>,
    pub(crate) children: Vec<NotifierRef>,
    pub(crate) loop_id: Option<LoopId>,
    pub(crate) root_id: Option<NotifierId>,
}

impl NotifierBase {
    /// Returns detached base state.
    pub fn new() -> NotifierBase {
        NotifierBase {
            parent: None,
            children: Vec::new(),
            loop_id: None,
            root_id: None,
        }
    }

    /// Returns true while the node is a member of a loop.
    pub fn is_attached(&self) -> bool {
        self.loop_id.is_some()
    }

    /// Returns true if the node sits under a parent notifier.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }
}

impl Default for NotifierBase {
    fn default() -> NotifierBase {
        NotifierBase::new()
    }
}

/// A node in the notifier tree.
///
/// Implementations keep their common state in a [`NotifierBase`] and arm
/// or disarm their loop resources in [`attached`]/[`detached`]. Both hooks
/// receive the loop and run exactly once per membership change; the
/// subtree is walked by the loop itself.
///
/// [`attached`]: Notify::attached
/// [`detached`]: Notify::detached
pub trait Notify: 'static {
    /// The node's common state.
    fn base(&self) -> &NotifierBase;

    /// Mutable access to the node's common state.
    fn base_mut(&mut self) -> &mut NotifierBase;

    /// Called when the node becomes a member of `lp`.
    fn attached(&mut self, lp: &mut EventLoop);

    /// Called when the node leaves `lp`.
    fn detached(&mut self, lp: &mut EventLoop);
}

/// Conversion from a public handle type to its notifier node.
pub trait AsNotifier {
    /// The node backing this handle.
    fn notifier_ref(&self) -> NotifierRef;
}

impl AsNotifier for NotifierRef {
    fn notifier_ref(&self) -> NotifierRef {
        self.clone()
    }
}

pub(crate) fn misuse(msg: &str) -> Error {
    Error::io(
        "notifier",
        io::Error::new(io::ErrorKind::InvalidInput, msg.to_string()),
    )
}

/// Marks `node` and all its descendants as members of the loop and lets
/// each arm its resources, parents before children.
pub(crate) fn attach_tree(lp: &mut EventLoop, node: &NotifierRef, loop_id: LoopId) {
    {
        let mut guard = node.borrow_mut();
        guard.base_mut().loop_id = Some(loop_id);
        guard.attached(lp);
    }
    let children: Vec<NotifierRef> = node.borrow().base().children.clone();
    for child in &children {
        attach_tree(lp, child, loop_id);
    }
}

/// Reverse of [`attach_tree`]: children disarm first, then the node.
pub(crate) fn detach_tree(lp: &mut EventLoop, node: &NotifierRef) {
    let children: Vec<NotifierRef> = node.borrow().base().children.clone();
    for child in children.iter().rev() {
        detach_tree(lp, child);
    }
    let mut guard = node.borrow_mut();
    guard.detached(lp);
    guard.base_mut().loop_id = None;
}
