use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use coio::{
    spawn, CaptureMode, Command, Process, SpawnSetup, SpawnTarget, StdinMode, WaitStatus,
};

mod util;
use util::{init_with_loop, proxy_lock, run_until};

#[test]
fn watching_an_already_exited_child_still_delivers() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        unsafe { libc::_exit(7) };
    }

    // Let the child finish before the watch exists.
    std::thread::sleep(Duration::from_millis(50));

    let seen = Rc::new(RefCell::new(Vec::<(libc::pid_t, WaitStatus)>::new()));
    let log = seen.clone();
    lp.watch_child(pid, move |_lp, pid, status| {
        log.borrow_mut().push((pid, status));
    })
    .unwrap();

    run_until(&mut lp, || !seen.borrow().is_empty());
    let (got_pid, status) = seen.borrow()[0];
    assert_eq!(got_pid, pid);
    assert_eq!(status.exit_status(), Some(7));
    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(lp.child_watch_count(), 0);
}

#[test]
fn exec_failure_reports_errno_and_exit_255() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let failure = Rc::new(RefCell::new(None));
    let finished = Rc::new(RefCell::new(false));

    let slot = failure.clone();
    let done = finished.clone();
    spawn(
        &mut lp,
        SpawnTarget::Exec(Command::new("/no/such/file")),
        SpawnSetup::new(),
        move |_lp, _status| {
            *done.borrow_mut() = true;
        },
        move |_lp, failure| {
            *slot.borrow_mut() = Some(failure);
        },
    )
    .unwrap();

    run_until(&mut lp, || failure.borrow().is_some());
    assert!(!*finished.borrow());

    let failure = failure.borrow_mut().take().unwrap();
    assert_eq!(failure.errno, libc::ENOENT);
    assert!(failure.message.is_empty());
    let status = failure.status.unwrap();
    assert_eq!(status.exit_status(), Some(255));
}

#[test]
fn code_block_exit_status_is_reported() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let status = Rc::new(RefCell::new(None));
    let slot = status.clone();
    spawn(
        &mut lp,
        SpawnTarget::Code(Box::new(|| 5)),
        SpawnSetup::new(),
        move |_lp, status| {
            *slot.borrow_mut() = Some(status);
        },
        |_lp, failure| panic!("unexpected spawn failure: {:?}", failure),
    )
    .unwrap();

    run_until(&mut lp, || status.borrow().is_some());
    assert_eq!(status.borrow().unwrap().exit_status(), Some(5));
}

#[test]
fn panicking_code_block_reports_the_message() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let failure = Rc::new(RefCell::new(None));
    let slot = failure.clone();
    spawn(
        &mut lp,
        SpawnTarget::Code(Box::new(|| panic!("worker exploded"))),
        SpawnSetup::new(),
        |_lp, status| panic!("unexpected finish: {:?}", status),
        move |_lp, failure| {
            *slot.borrow_mut() = Some(failure);
        },
    )
    .unwrap();

    run_until(&mut lp, || failure.borrow().is_some());
    let failure = failure.borrow_mut().take().unwrap();
    assert_eq!(failure.errno, 0);
    assert_eq!(failure.message, "worker exploded");
    assert_eq!(failure.status.unwrap().exit_status(), Some(255));
}

#[test]
fn process_captures_stdout() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let outcome = Rc::new(RefCell::new(None));
    let process = Process::exec(Command::new("echo").arg("hello"));
    let slot = outcome.clone();
    process
        .stdout(CaptureMode::Capture)
        .stderr(CaptureMode::DevNull)
        .on_finish(move |_lp, outcome| {
            *slot.borrow_mut() = Some(outcome);
        });
    lp.add(&process).unwrap();

    run_until(&mut lp, || outcome.borrow().is_some());
    let outcome = outcome.borrow_mut().take().unwrap();
    assert_eq!(outcome.status.exit_status(), Some(0));
    assert_eq!(outcome.stdout, b"hello\n");
    assert!(outcome.stderr.is_empty());
    // The process removed itself once done.
    assert_eq!(lp.notifier_count(), 0);
}

#[test]
fn process_feeds_stdin_and_captures_the_echo() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let outcome = Rc::new(RefCell::new(None));
    let process = Process::exec(Command::new("cat"));
    let slot = outcome.clone();
    process
        .stdin(StdinMode::Bytes(b"ping through".to_vec()))
        .stdout(CaptureMode::Capture)
        .on_finish(move |_lp, outcome| {
            *slot.borrow_mut() = Some(outcome);
        });
    lp.add(&process).unwrap();

    run_until(&mut lp, || outcome.borrow().is_some());
    let outcome = outcome.borrow_mut().take().unwrap();
    assert_eq!(outcome.status.exit_status(), Some(0));
    assert_eq!(outcome.stdout, b"ping through");
}
