use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use coio::{Signal, SignalWatcher};

mod util;
use util::{init_with_loop, proxy_lock, run_until};

fn raise(signal: Signal) {
    let pid = unsafe { libc::getpid() };
    assert_eq!(unsafe { libc::kill(pid, signal.raw()) }, 0);
}

#[test]
fn coalesced_deliveries_are_counted_per_signal() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let hups = Rc::new(RefCell::new(0));
    let usr1s = Rc::new(RefCell::new(0));

    let hup_counter = hups.clone();
    lp.attach_signal(Signal::HUP, move |_lp| {
        *hup_counter.borrow_mut() += 1;
    })
    .unwrap();
    let usr1_counter = usr1s.clone();
    lp.attach_signal(Signal::USR1, move |_lp| {
        *usr1_counter.borrow_mut() += 1;
    })
    .unwrap();

    // All four deliveries land before the loop gets a turn, as they
    // would during one backend sleep.
    raise(Signal::HUP);
    raise(Signal::HUP);
    raise(Signal::HUP);
    raise(Signal::USR1);

    run_until(&mut lp, || *hups.borrow() == 3 && *usr1s.borrow() == 1);

    // The pipe is empty again: another turn delivers nothing more.
    lp.loop_once(Some(Duration::from_millis(10))).unwrap();
    assert_eq!(*hups.borrow(), 3);
    assert_eq!(*usr1s.borrow(), 1);
}

#[test]
fn multiplexed_handlers_each_observe_the_signal() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let first = Rc::new(RefCell::new(0));
    let second = Rc::new(RefCell::new(0));

    let counter = first.clone();
    let id_first = lp
        .attach_signal(Signal::USR2, move |_lp| {
            *counter.borrow_mut() += 1;
        })
        .unwrap();
    let counter = second.clone();
    let _id_second = lp
        .attach_signal(Signal::USR2, move |_lp| {
            *counter.borrow_mut() += 1;
        })
        .unwrap();

    raise(Signal::USR2);
    run_until(&mut lp, || *first.borrow() == 1 && *second.borrow() == 1);

    // Detaching one leaves the other delivering.
    lp.detach_signal(Signal::USR2, id_first);
    raise(Signal::USR2);
    run_until(&mut lp, || *second.borrow() == 2);
    assert_eq!(*first.borrow(), 1);
}

#[test]
fn signal_watcher_notifier_attaches_and_detaches() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let watcher = SignalWatcher::new(Signal::WINCH);
    let log = seen.clone();
    watcher.on_signal(move |_lp, signal| {
        log.borrow_mut().push(signal);
    });
    lp.add(&watcher).unwrap();

    raise(Signal::WINCH);
    run_until(&mut lp, || !seen.borrow().is_empty());
    assert_eq!(*seen.borrow(), vec![Signal::WINCH]);

    lp.remove(&watcher).unwrap();
    raise(Signal::WINCH);
    lp.loop_once(Some(Duration::from_millis(10))).unwrap();
    assert_eq!(seen.borrow().len(), 1);
}

#[test]
fn low_level_watch_is_exclusive_with_multiplexing() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    lp.watch_signal(Signal::ALRM, |_lp| {}).unwrap();
    assert!(lp.attach_signal(Signal::ALRM, |_lp| {}).is_err());
    lp.unwatch_signal(Signal::ALRM);

    let id = lp.attach_signal(Signal::ALRM, |_lp| {}).unwrap();
    assert!(lp.watch_signal(Signal::ALRM, |_lp| {}).is_err());
    lp.detach_signal(Signal::ALRM, id);
}
