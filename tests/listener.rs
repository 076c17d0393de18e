use std::cell::RefCell;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::OwnedFd;
use std::rc::Rc;
use std::time::Duration;

use coio::{Consume, Listener};

mod util;
use util::{init_with_loop, run_until};

fn bound_listener() -> (OwnedFd, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (OwnedFd::from(listener), addr)
}

#[test]
fn no_connections_means_no_accepts_and_no_error() {
    let mut lp = init_with_loop();
    let (fd, _addr) = bound_listener();

    let accepted = Rc::new(RefCell::new(0));
    let errors = Rc::new(RefCell::new(0));

    let listener = Listener::new();
    let err_counter = errors.clone();
    listener.on_accept_error(move |_lp, _listener, _err| {
        *err_counter.borrow_mut() += 1;
    });
    let counter = accepted.clone();
    listener
        .on_fd(&mut lp, move |_lp, _sock| {
            *counter.borrow_mut() += 1;
        })
        .unwrap();
    listener.set_listener(&mut lp, fd).unwrap();
    lp.add(&listener).unwrap();

    lp.loop_once(Some(Duration::from_millis(20))).unwrap();
    assert_eq!(*accepted.borrow(), 0);
    assert_eq!(*errors.borrow(), 0);
}

#[test]
fn accepts_every_pending_connection_in_one_round() {
    let mut lp = init_with_loop();
    let (fd, addr) = bound_listener();

    let accepted = Rc::new(RefCell::new(0));
    let listener = Listener::new();
    let counter = accepted.clone();
    listener
        .on_fd(&mut lp, move |_lp, _sock| {
            *counter.borrow_mut() += 1;
        })
        .unwrap();
    listener.set_listener(&mut lp, fd).unwrap();
    lp.add(&listener).unwrap();

    let _first = TcpStream::connect(addr).unwrap();
    let _second = TcpStream::connect(addr).unwrap();

    run_until(&mut lp, || *accepted.borrow() == 2);
}

#[test]
fn stream_acceptor_wraps_the_connection() {
    let mut lp = init_with_loop();
    let (fd, addr) = bound_listener();

    let received = Rc::new(RefCell::new(Vec::<u8>::new()));
    let listener = Listener::new();
    let sink = received.clone();
    listener
        .on_stream(&mut lp, move |lp, stream| {
            let sink = sink.clone();
            stream
                .set_consumer(lp, move |_lp, _stream, buf, _eof| {
                    sink.borrow_mut().extend_from_slice(buf);
                    buf.clear();
                    Consume::Stop
                })
                .unwrap();
            lp.add(&stream).unwrap();
        })
        .unwrap();
    listener.set_listener(&mut lp, fd).unwrap();
    lp.add(&listener).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    std::io::Write::write_all(&mut client, b"hello server").unwrap();

    run_until(&mut lp, || received.borrow().len() == 12);
    assert_eq!(&received.borrow()[..], b"hello server");
}

#[test]
fn factory_accepted_streams_detach_with_the_listener() {
    let mut lp = init_with_loop();
    let (fd, addr) = bound_listener();

    let wrapped = Rc::new(RefCell::new(Vec::<coio::Stream>::new()));
    let listener = Listener::new();
    let store = wrapped.clone();
    listener
        .with_factory(&mut lp, move |lp, sock| {
            let stream = coio::Stream::new();
            stream.set_consumer(lp, |_lp, _stream, buf, _eof| {
                buf.clear();
                Consume::Stop
            })?;
            stream.set_handle(lp, sock)?;
            store.borrow_mut().push(stream.clone());
            Ok(stream)
        })
        .unwrap();
    listener.set_listener(&mut lp, fd).unwrap();
    lp.add(&listener).unwrap();

    let _client = TcpStream::connect(addr).unwrap();
    run_until(&mut lp, || wrapped.borrow().len() == 1);
    assert!(wrapped.borrow()[0].is_attached());

    // Removing the listener detaches its adopted children too.
    lp.remove(&listener).unwrap();
    assert!(!wrapped.borrow()[0].is_attached());
    assert_eq!(lp.notifier_count(), 0);
}
