use std::cell::RefCell;
use std::rc::Rc;

use coio::{Consume, Stream};

mod util;
use util::{init_with_loop, pipe, run_until, write_fd};

#[test]
fn line_consumer_sees_lines_then_eof_once() {
    let mut lp = init_with_loop();
    let (rd, wr) = pipe();

    let lines = Rc::new(RefCell::new(Vec::<String>::new()));
    let eof_seen = Rc::new(RefCell::new(0));

    let stream = Stream::new();
    let out = lines.clone();
    let eofs = eof_seen.clone();
    stream
        .set_consumer(&mut lp, move |_lp, _stream, buf, eof| {
            if let Some(at) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=at).collect();
                out.borrow_mut().push(String::from_utf8(line).unwrap());
                return Consume::Again;
            }
            if eof {
                assert!(buf.is_empty(), "unterminated data left at end of stream");
                *eofs.borrow_mut() += 1;
            }
            Consume::Stop
        })
        .unwrap();
    stream.set_read_handle(&mut lp, rd).unwrap();
    lp.add(&stream).unwrap();

    write_fd(&wr, b"foo\nbar\nba");
    run_until(&mut lp, || lines.borrow().len() == 2);
    assert_eq!(*lines.borrow(), vec!["foo\n", "bar\n"]);

    write_fd(&wr, b"z\n");
    run_until(&mut lp, || lines.borrow().len() == 3);
    assert_eq!(lines.borrow()[2], "baz\n");

    drop(wr);
    run_until(&mut lp, || stream.is_closed());
    assert_eq!(*eof_seen.borrow(), 1);
    assert_eq!(lp.notifier_count(), 0);
}

/// Builds the header-then-payload consumer pair: lines of the form
/// `DATA <n>:<line>` switch to a consumer that takes `n` raw bytes,
/// `LINE:<line>` stays line-based.
fn install_switching_consumer(
    lp: &mut coio::EventLoop,
    stream: &Stream,
    output: Rc<RefCell<Vec<String>>>,
) {
    stream
        .set_consumer(lp, move |_lp, _stream, buf, _eof| {
            let Some(at) = buf.iter().position(|&b| b == b'\n') else {
                return Consume::Stop;
            };
            let line: Vec<u8> = buf.drain(..=at).collect();
            let line = String::from_utf8(line).unwrap();
            let line = line.trim_end_matches('\n');

            if let Some(rest) = line.strip_prefix("DATA ") {
                let (count, label) = rest.split_once(':').unwrap();
                let count: usize = count.parse().unwrap();
                let label = label.to_string();
                let output = output.clone();
                return Consume::Replace(Box::new(move |_lp, _stream, buf, _eof| {
                    if buf.len() < count {
                        return Consume::Stop;
                    }
                    let data: Vec<u8> = buf.drain(..count).collect();
                    output.borrow_mut().push(format!(
                        "Received a line {} with some data ({})",
                        label,
                        String::from_utf8(data).unwrap()
                    ));
                    Consume::Restore
                }));
            }
            if let Some(label) = line.strip_prefix("LINE:") {
                output
                    .borrow_mut()
                    .push(format!("Received a line {} with no data", label));
            }
            Consume::Again
        })
        .unwrap();
}

#[test]
fn consumer_replacement_and_restore() {
    let mut lp = init_with_loop();
    let (rd, wr) = pipe();

    let output = Rc::new(RefCell::new(Vec::new()));
    let stream = Stream::new();
    install_switching_consumer(&mut lp, &stream, output.clone());
    stream.set_read_handle(&mut lp, rd).unwrap();
    lp.add(&stream).unwrap();

    write_fd(&wr, b"DATA 6:hi\nworld");
    lp.loop_once(Some(std::time::Duration::from_millis(50)))
        .unwrap();
    // Five of the six payload bytes have arrived; the replacement is
    // waiting for the last one.
    assert!(output.borrow().is_empty());

    write_fd(&wr, b"!\nLINE:done\n");
    run_until(&mut lp, || output.borrow().len() == 2);
    assert_eq!(
        *output.borrow(),
        vec![
            "Received a line hi with some data (world!)",
            "Received a line done with no data",
        ]
    );

    drop(wr);
    run_until(&mut lp, || stream.is_closed());
}

#[test]
fn unproductive_consumer_is_not_spun() {
    let mut lp = init_with_loop();
    let (rd, wr) = pipe();

    let calls = Rc::new(RefCell::new(0));
    let stream = Stream::new();
    let counter = calls.clone();
    stream
        .set_consumer(&mut lp, move |_lp, _stream, _buf, _eof| {
            *counter.borrow_mut() += 1;
            // Claims more may be possible, but never consumes.
            Consume::Again
        })
        .unwrap();
    stream.set_read_handle(&mut lp, rd).unwrap();
    lp.add(&stream).unwrap();

    write_fd(&wr, b"stuck");
    run_until(&mut lp, || *calls.borrow() >= 1);
    assert_eq!(*calls.borrow(), 1);

    // New bytes earn exactly one more invocation.
    write_fd(&wr, b"more");
    run_until(&mut lp, || *calls.borrow() >= 2);
    assert_eq!(*calls.borrow(), 2);
}

#[test]
fn write_drains_and_reports_outgoing_empty() {
    let mut lp = init_with_loop();
    let (rd, wr) = pipe();

    let drained = Rc::new(RefCell::new(0));
    let stream = Stream::new();
    let counter = drained.clone();
    stream.on_outgoing_empty(move |_lp, _stream| {
        *counter.borrow_mut() += 1;
    });
    stream.set_write_handle(&mut lp, wr).unwrap();
    lp.add(&stream).unwrap();

    stream.write(&mut lp, b"hello ").unwrap();
    stream.write(&mut lp, b"world").unwrap();
    assert_eq!(stream.pending_out(), 11);

    run_until(&mut lp, || *drained.borrow() == 1);
    assert_eq!(stream.pending_out(), 0);

    let mut buf = [0u8; 32];
    let n = unsafe {
        libc::read(
            std::os::unix::io::AsRawFd::as_raw_fd(&rd),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    assert_eq!(&buf[..n as usize], b"hello world");
}

#[test]
fn close_when_empty_transmits_only_what_was_queued() {
    use rand::Rng;

    let mut lp = init_with_loop();
    let (rd, wr) = pipe();

    let mut rng = rand::rng();
    let payload: Vec<u8> = (0..rng.random_range(1024..4096))
        .map(|_| rng.random())
        .collect();

    let stream = Stream::new();
    // Small chunks force several write rounds before the close lands.
    stream.set_write_chunk(128);
    stream.set_write_handle(&mut lp, wr).unwrap();
    lp.add(&stream).unwrap();

    stream.write(&mut lp, &payload).unwrap();
    stream.close_when_empty(&mut lp);

    // Once closing, further writes are refused.
    assert!(stream.write(&mut lp, b"more").is_err());

    run_until(&mut lp, || stream.is_closed());

    let mut received = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = unsafe {
            libc::read(
                std::os::unix::io::AsRawFd::as_raw_fd(&rd),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n <= 0 {
            break;
        }
        received.extend_from_slice(&buf[..n as usize]);
    }
    assert_eq!(received, payload);
}

#[test]
fn immediate_close_discards_pending_output() {
    let mut lp = init_with_loop();
    let (rd, wr) = pipe();

    let closed = Rc::new(RefCell::new(0));
    let stream = Stream::new();
    let counter = closed.clone();
    stream.on_closed(move |_lp, _stream| {
        *counter.borrow_mut() += 1;
    });
    stream.set_write_handle(&mut lp, wr).unwrap();
    lp.add(&stream).unwrap();

    stream.write(&mut lp, b"never sent").unwrap();
    stream.close(&mut lp);
    assert!(stream.is_closed());
    assert_eq!(*closed.borrow(), 1);
    assert_eq!(lp.notifier_count(), 0);

    // The write end is gone, so the read side sees immediate EOF.
    let mut buf = [0u8; 16];
    let n = unsafe {
        libc::read(
            std::os::unix::io::AsRawFd::as_raw_fd(&rd),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    assert_eq!(n, 0);
}

#[test]
fn writes_from_inside_the_consumer_echo_back() {
    let mut lp = init_with_loop();
    let (rd, wr) = pipe();
    let (echo_rd, echo_wr) = pipe();

    let stream = Stream::new();
    stream
        .set_consumer(&mut lp, move |lp, stream, buf, _eof| {
            if buf.is_empty() {
                return Consume::Stop;
            }
            let data: Vec<u8> = buf.drain(..).collect();
            stream.write(lp, &data).unwrap();
            Consume::Again
        })
        .unwrap();
    stream.set_read_handle(&mut lp, rd).unwrap();
    stream.set_write_handle(&mut lp, echo_wr).unwrap();
    lp.add(&stream).unwrap();

    write_fd(&wr, b"echo me");
    run_until(&mut lp, || stream.pending_out() == 0);

    let mut buf = [0u8; 16];
    let n = unsafe {
        libc::read(
            std::os::unix::io::AsRawFd::as_raw_fd(&echo_rd),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    assert_eq!(&buf[..n as usize], b"echo me");
}
