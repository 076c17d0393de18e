use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::json;

use coio::{
    Error, FlatMarshaller, StorableMarshaller, WorkerCause, WorkerConfig, WorkerPool,
};

mod util;
use util::{init_with_loop, proxy_lock, run_until};

fn flat_pool(config: WorkerConfig) -> WorkerPool<FlatMarshaller> {
    WorkerPool::new(FlatMarshaller, config, |args| {
        match args.first().cloned().flatten() {
            Some(arg) if arg == "boom" => Err("kaboom".to_string()),
            Some(arg) if arg.starts_with("sleep ") => {
                let ms: u64 = arg["sleep ".len()..].parse().unwrap();
                std::thread::sleep(Duration::from_millis(ms));
                Ok(vec![Some("slept".to_string())])
            }
            Some(arg) => Ok(vec![Some(arg.to_uppercase()), None]),
            None => Ok(vec![None]),
        }
    })
}

#[test]
fn call_round_trips_through_a_worker() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();
    let pool = flat_pool(WorkerConfig::default());

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    pool.call(
        &mut lp,
        vec![Some("hello".to_string())],
        move |_lp, outcome| {
            *slot.borrow_mut() = Some(outcome);
        },
    )
    .unwrap();

    run_until(&mut lp, || result.borrow().is_some());
    let outcome = result.borrow_mut().take().unwrap().unwrap();
    assert_eq!(outcome, vec![Some("HELLO".to_string()), None]);
    assert_eq!(pool.worker_count(), 1);

    pool.shutdown(&mut lp);
    assert_eq!(pool.worker_count(), 0);
}

#[test]
fn worker_exception_reaches_the_callback() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();
    let pool = flat_pool(WorkerConfig::default());

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    pool.call(
        &mut lp,
        vec![Some("boom".to_string())],
        move |_lp, outcome| {
            *slot.borrow_mut() = Some(outcome);
        },
    )
    .unwrap();

    run_until(&mut lp, || result.borrow().is_some());
    match result.borrow_mut().take().unwrap() {
        Err(Error::Worker(e)) => {
            assert_eq!(e.cause, WorkerCause::Exception);
            assert_eq!(e.message.as_deref(), Some("kaboom"));
        }
        other => panic!("expected a worker exception, got {:?}", other.map(|_| ())),
    }

    pool.shutdown(&mut lp);
}

#[test]
fn one_worker_answers_in_call_order() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();
    let pool = flat_pool(WorkerConfig {
        workers: 1,
        ..WorkerConfig::default()
    });

    let order = Rc::new(RefCell::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let log = order.clone();
        pool.call(
            &mut lp,
            vec![Some(name.to_string())],
            move |_lp, outcome| {
                let got = outcome.unwrap()[0].clone().unwrap();
                log.borrow_mut().push(got);
            },
        )
        .unwrap();
    }

    run_until(&mut lp, || order.borrow().len() == 3);
    assert_eq!(*order.borrow(), vec!["FIRST", "SECOND", "THIRD"]);

    pool.shutdown(&mut lp);
}

#[test]
fn storable_marshaller_carries_structured_values() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();

    let pool = WorkerPool::new(StorableMarshaller, WorkerConfig::default(), |args| {
        let total: i64 = args
            .iter()
            .filter_map(|v| v.get("n").and_then(|n| n.as_i64()))
            .sum();
        Ok(vec![json!({ "sum": total, "count": args.len() })])
    });

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    pool.call(
        &mut lp,
        vec![json!({ "n": 4 }), json!({ "n": 38 })],
        move |_lp, outcome| {
            *slot.borrow_mut() = Some(outcome);
        },
    )
    .unwrap();

    run_until(&mut lp, || result.borrow().is_some());
    let outcome = result.borrow_mut().take().unwrap().unwrap();
    assert_eq!(outcome, vec![json!({ "sum": 42, "count": 2 })]);

    pool.shutdown(&mut lp);
}

#[test]
fn shutdown_fails_in_flight_calls_with_shutdown_cause() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();
    let pool = flat_pool(WorkerConfig::default());

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    pool.call(
        &mut lp,
        vec![Some("never answered".to_string())],
        move |_lp, outcome| {
            *slot.borrow_mut() = Some(outcome);
        },
    )
    .unwrap();

    // Shut down before the loop ever runs; the call is still pending.
    pool.shutdown(&mut lp);

    match result.borrow_mut().take().unwrap() {
        Err(Error::Worker(e)) => assert_eq!(e.cause, WorkerCause::Shutdown),
        other => panic!("expected shutdown, got {:?}", other.map(|_| ())),
    }
    assert_eq!(pool.worker_count(), 0);
}

#[test]
fn overdue_call_times_out_and_late_reply_is_dropped() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();
    let pool = flat_pool(WorkerConfig {
        call_timeout: Some(Duration::from_millis(50)),
        ..WorkerConfig::default()
    });

    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    pool.call(
        &mut lp,
        vec![Some("sleep 300".to_string())],
        move |_lp, outcome| {
            *slot.borrow_mut() = Some(outcome);
        },
    )
    .unwrap();

    run_until(&mut lp, || result.borrow().is_some());
    assert!(matches!(
        result.borrow_mut().take().unwrap(),
        Err(Error::TimedOut)
    ));

    // Give the late reply a chance to arrive; it must go nowhere.
    std::thread::sleep(Duration::from_millis(300));
    lp.loop_once(Some(Duration::from_millis(50))).unwrap();
    assert!(result.borrow().is_none());

    pool.shutdown(&mut lp);
}

#[test]
fn queued_calls_overflow_to_the_wait_queue() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();
    let pool = flat_pool(WorkerConfig {
        workers: 1,
        ..WorkerConfig::default()
    });

    let done = Rc::new(RefCell::new(0));
    for _ in 0..2 {
        let counter = done.clone();
        pool.call(
            &mut lp,
            vec![Some("sleep 30".to_string())],
            move |_lp, outcome| {
                outcome.unwrap();
                *counter.borrow_mut() += 1;
            },
        )
        .unwrap();
    }
    // One worker, two calls: the second overflows to the wait queue.
    assert_eq!(pool.worker_count(), 1);
    assert_eq!(pool.queued_calls(), 1);

    run_until(&mut lp, || *done.borrow() == 2);
    pool.shutdown(&mut lp);
}

#[test]
fn call_future_blocks_until_the_result() {
    let _guard = proxy_lock();
    let mut lp = init_with_loop();
    let pool = flat_pool(WorkerConfig::default());

    let future = pool.call_future(&mut lp, vec![Some("future".to_string())]);
    let outcome = future.block_until_ready(&mut lp).unwrap();
    assert_eq!(outcome[0].as_deref(), Some("FUTURE"));

    pool.shutdown(&mut lp);
}
