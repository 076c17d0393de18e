use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use coio::{Countdown, EventLoop, Interest};

mod util;
use util::{init_with_loop, pipe, run_until, socketpair, write_fd};

fn recorder() -> Rc<RefCell<Vec<&'static str>>> {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn timers_fire_in_deadline_order_with_fifo_ties() {
    let mut lp = init_with_loop();
    let log = recorder();

    let now = Instant::now();
    for (name, ms) in [("a", 10u64), ("b", 20), ("c", 20), ("d", 30)] {
        let log = log.clone();
        lp.watch_time_after_from(now, Duration::from_millis(ms), move |_lp| {
            log.borrow_mut().push(name);
        });
    }

    run_until(&mut lp, || log.borrow().len() == 4);
    assert_eq!(*log.borrow(), vec!["a", "b", "c", "d"]);
    assert_eq!(lp.timer_count(), 0);
}

#[test]
fn cancelled_timer_never_fires() {
    let mut lp = init_with_loop();
    let fired = Rc::new(RefCell::new(false));

    let flag = fired.clone();
    let id = lp.watch_time_after(Duration::from_millis(5), move |_lp| {
        *flag.borrow_mut() = true;
    });
    assert!(lp.time_pending(id));
    lp.unwatch_time(id);
    assert!(!lp.time_pending(id));
    // Cancelling again is a no-op.
    lp.unwatch_time(id);

    std::thread::sleep(Duration::from_millis(10));
    lp.loop_once(Some(Duration::ZERO)).unwrap();
    assert!(!*fired.borrow());
    assert_eq!(lp.timer_count(), 0);
}

#[test]
fn zero_delay_timer_from_callback_waits_for_next_turn() {
    let mut lp = init_with_loop();
    let log = recorder();

    let outer = log.clone();
    lp.watch_time_after(Duration::from_millis(1), move |lp| {
        outer.borrow_mut().push("first");
        let inner = outer.clone();
        lp.watch_time_after(Duration::ZERO, move |_lp| {
            inner.borrow_mut().push("second");
        });
    });

    std::thread::sleep(Duration::from_millis(5));
    lp.loop_once(Some(Duration::ZERO)).unwrap();
    assert_eq!(*log.borrow(), vec!["first"]);

    lp.loop_once(Some(Duration::ZERO)).unwrap();
    assert_eq!(*log.borrow(), vec!["first", "second"]);
}

#[test]
fn watch_io_then_unwatch_restores_the_table() {
    let mut lp = init_with_loop();
    let (rd, _wr) = pipe();
    let fd = rd.as_raw_fd();

    assert_eq!(lp.io_interest(fd), None);
    lp.watch_io(fd, Interest::READABLE, |_lp| {}).unwrap();
    assert_eq!(lp.io_interest(fd), Some(Interest::READABLE));
    lp.watch_io(fd, Interest::WRITABLE, |_lp| {}).unwrap();
    assert_eq!(
        lp.io_interest(fd),
        Some(Interest::READABLE | Interest::WRITABLE)
    );

    lp.unwatch_io(fd, Interest::READABLE).unwrap();
    assert_eq!(lp.io_interest(fd), Some(Interest::WRITABLE));
    lp.unwatch_io(fd, Interest::WRITABLE).unwrap();
    assert_eq!(lp.io_interest(fd), None);
    // Unknown descriptors and directions are no-ops.
    lp.unwatch_io(fd, Interest::READABLE).unwrap();
}

#[test]
fn readable_descriptor_dispatches_callback() {
    let mut lp = init_with_loop();
    let (rd, wr) = pipe();
    let fd = rd.as_raw_fd();
    let hits = Rc::new(RefCell::new(0));

    let counter = hits.clone();
    lp.watch_io(fd, Interest::READABLE, move |_lp| {
        *counter.borrow_mut() += 1;
    })
    .unwrap();

    write_fd(&wr, b"x");
    run_until(&mut lp, || *hits.borrow() > 0);
}

#[test]
fn cancelling_the_sibling_direction_is_observed_within_the_turn() {
    let mut lp = init_with_loop();
    let (ours, theirs) = socketpair();
    let fd = ours.as_raw_fd();
    let log = recorder();

    // With peer data pending, our end reports readable and writable in
    // one event.
    write_fd(&theirs, b"ping");

    let read_log = log.clone();
    lp.watch_io(fd, Interest::READABLE, move |lp| {
        read_log.borrow_mut().push("read");
        lp.unwatch_io(fd, Interest::WRITABLE).unwrap();
    })
    .unwrap();
    let write_log = log.clone();
    lp.watch_io(fd, Interest::WRITABLE, move |_lp| {
        write_log.borrow_mut().push("write");
    })
    .unwrap();

    run_until(&mut lp, || !log.borrow().is_empty());
    assert_eq!(*log.borrow(), vec!["read"]);
    assert_eq!(lp.io_interest(fd), Some(Interest::READABLE));
}

#[test]
fn idle_deferrals_run_after_the_next_turn_only() {
    let mut lp = init_with_loop();
    let log = recorder();

    let outer = log.clone();
    lp.watch_idle(move |lp| {
        outer.borrow_mut().push("first");
        let inner = outer.clone();
        lp.watch_idle(move |_lp| {
            inner.borrow_mut().push("second");
        });
    });
    assert_eq!(lp.idle_count(), 1);

    lp.loop_once(Some(Duration::ZERO)).unwrap();
    assert_eq!(*log.borrow(), vec!["first"]);
    assert_eq!(lp.idle_count(), 1);

    lp.loop_once(Some(Duration::ZERO)).unwrap();
    assert_eq!(*log.borrow(), vec!["first", "second"]);
    assert_eq!(lp.idle_count(), 0);
}

#[test]
fn cancelled_idle_deferral_does_not_run() {
    let mut lp = init_with_loop();
    let fired = Rc::new(RefCell::new(false));

    let flag = fired.clone();
    let id = lp.watch_idle(move |_lp| {
        *flag.borrow_mut() = true;
    });
    lp.unwatch_idle(id);

    lp.loop_once(Some(Duration::ZERO)).unwrap();
    assert!(!*fired.borrow());
}

#[test]
fn stop_finishes_the_innermost_run() {
    let mut lp = init_with_loop();

    lp.watch_time_after(Duration::from_millis(1), |lp| {
        // Nest a whole run inside a callback, then stop both.
        lp.watch_time_after(Duration::from_millis(1), |lp| lp.stop("inner"));
        let inner = lp.run().unwrap();
        assert_eq!(*inner.downcast::<&str>().unwrap(), "inner");
        lp.stop(17i32);
    });

    let outer = lp.run().unwrap();
    assert_eq!(*outer.downcast::<i32>().unwrap(), 17);
}

#[test]
fn countdown_start_and_stop_leave_no_residue() {
    let mut lp = init_with_loop();
    let fired = Rc::new(RefCell::new(0));

    let countdown = Countdown::new(Duration::from_millis(5));
    let counter = fired.clone();
    countdown.on_expire(move |_lp| {
        *counter.borrow_mut() += 1;
    });
    lp.add(&countdown).unwrap();

    countdown.start(&mut lp).unwrap();
    assert!(countdown.is_running());
    countdown.stop(&mut lp);
    assert!(!countdown.is_running());
    assert_eq!(lp.timer_count(), 0);

    countdown.start(&mut lp).unwrap();
    run_until(&mut lp, || *fired.borrow() == 1);
    assert!(!countdown.is_running());
    assert_eq!(lp.timer_count(), 0);

    // Detaching cancels a pending countdown.
    countdown.start(&mut lp).unwrap();
    lp.remove(&countdown).unwrap();
    assert_eq!(lp.timer_count(), 0);
}

#[test]
fn handle_notifier_arms_and_disarms_with_interest() {
    let mut lp = init_with_loop();
    let (rd, wr) = pipe();
    let hits = Rc::new(RefCell::new(0));

    let handle = coio::Handle::new();
    let counter = hits.clone();
    handle.on_read_ready(move |lp, handle| {
        let fd = handle.read_fd().unwrap();
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(n > 0);
        *counter.borrow_mut() += 1;
        // One delivery is enough.
        handle.want_readready(lp, false).unwrap();
    });
    handle.set_read_handle(&mut lp, rd).unwrap();
    lp.add(&handle).unwrap();

    // Interest is off by default; nothing fires yet.
    write_fd(&wr, b"a");
    lp.loop_once(Some(Duration::from_millis(20))).unwrap();
    assert_eq!(*hits.borrow(), 0);

    let fd = handle.read_fd().unwrap();
    handle.want_readready(&mut lp, true).unwrap();
    assert_eq!(lp.io_interest(fd), Some(Interest::READABLE));

    run_until(&mut lp, || *hits.borrow() == 1);
    assert_eq!(lp.io_interest(fd), None);

    handle.close(&mut lp);
    assert_eq!(lp.notifier_count(), 0);
}

#[test]
fn loop_reports_config() {
    let lp = init_with_loop();
    assert_eq!(lp.config().read_chunk_size, 8 * 1024);
    assert_eq!(lp.config().signal_wait_cap, Duration::from_secs(1));
}

#[test]
fn shared_loop_is_cached_per_thread() {
    util::init();
    let a = EventLoop::shared().unwrap();
    let b = EventLoop::shared().unwrap();
    assert!(Rc::ptr_eq(&a, &b));
}
