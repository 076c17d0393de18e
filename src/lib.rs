//! Single-threaded cooperative event loop and non-blocking I/O.
//!
//! Coio multiplexes many concurrent activities over one thread of
//! control: byte streams on file descriptors, timers, POSIX signals,
//! child processes, and blocking work off-loaded to worker
//! subprocesses. Interest is registered with a readiness-polling
//! [`Backend`]; the [`EventLoop`] blocks on it and dispatches callbacks
//! as the kernel reports events.
//!
//! # Getting started
//!
//! User-level objects are *notifiers*: [`Stream`], [`Listener`],
//! [`Countdown`], [`SignalWatcher`] and [`Process`] all attach to a
//! loop (directly, or as children of another notifier) and arm their
//! descriptor watches while attached. The loop itself also exposes the
//! raw watch surface (`watch_io`, `watch_time`, `watch_idle`,
//! `watch_signal`, `watch_child`) the notifiers are built on.
//!
//! ```no_run
//! use coio::{Consume, EventLoop, Stream};
//! use std::os::unix::io::OwnedFd;
//!
//! fn watch_lines(lp: &mut EventLoop, fd: OwnedFd) -> coio::Result<()> {
//!     let stream = Stream::new();
//!     stream.set_consumer(lp, |_lp, _stream, buf, _eof| {
//!         match buf.iter().position(|&b| b == b'\n') {
//!             Some(at) => {
//!                 let line: Vec<u8> = buf.drain(..=at).collect();
//!                 println!("line: {}", String::from_utf8_lossy(&line));
//!                 Consume::Again
//!             }
//!             None => Consume::Stop,
//!         }
//!     })?;
//!     stream.set_read_handle(lp, fd)?;
//!     lp.add(&stream)?;
//!     Ok(())
//! }
//! ```
//!
//! # Scheduling model
//!
//! Strictly single-threaded and cooperative. Callbacks receive
//! `&mut EventLoop` and run to completion; the only suspension point is
//! inside [`EventLoop::loop_once`], in the backend call. Within one
//! turn, I/O callbacks run before due timers, which run before the idle
//! deferrals that were pending when the turn began.

#![cfg(unix)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

mod backend;
mod error;
mod event;
mod event_loop;
mod future;
mod handle;
mod interest;
mod listener;
mod marshal;
mod notifier;
mod process;
mod signals;
mod stream;
mod timer;
mod token;
mod worker;

pub use backend::{Backend, PollBackend, BACKEND_API_VERSION};
pub use error::{Error, Result};
pub use event::{Event, Events, Ready};
pub use event_loop::{EventLoop, IdleId, LoopConfig, SignalHandlerId};
pub use future::LoopFuture;
pub use handle::Handle;
pub use interest::Interest;
pub use listener::Listener;
pub use marshal::{FlatMarshaller, Marshaller, StorableMarshaller};
pub use notifier::{AsNotifier, Notify, NotifierBase, NotifierId, NotifierRef};
pub use process::{
    spawn, CaptureMode, Command, FdOp, OpenMode, Process, ProcessOutcome, SpawnFailure,
    SpawnSetup, SpawnTarget, StdinMode, WaitStatus,
};
pub use signals::{Signal, SignalWatcher};
pub use stream::{Consume, Consumer, Stream};
pub use timer::{Countdown, TimeoutId};
pub use token::Token;
pub use worker::{Transport, WorkerCause, WorkerConfig, WorkerError, WorkerFn, WorkerPool};
