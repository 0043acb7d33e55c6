//! Loopback tests driving two messengers over 127.0.0.1.
//!
//! Each messenger is owned by a single thread; the peers rendezvous
//! through channels. Blocking calls use short timeouts and retry so the
//! two cooperative endpoints can make progress against each other.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use hematite_messenger::{Body, Error, Message, Messenger, Status};
use serde_amqp::Value;

/// Retries for one blocking step; 200 * 50ms = 10s
const ATTEMPTS: usize = 200;
const STEP_TIMEOUT: i64 = 50;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Pick a free port by binding and dropping a listener
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn subscribed_listener_stops_cleanly() {
    init_tracing();
    let mut messenger = Messenger::builder()
        .name("listener-only")
        .timeout(2_000)
        .build();
    messenger.start().unwrap();
    messenger.subscribe("amqp://~127.0.0.1:0").unwrap();
    // No connectors exist, so stop drains to all-closed immediately
    messenger.stop().unwrap();
}

#[test]
fn round_trip_accepts_and_defaults_reply_to() {
    init_tracing();
    let port = free_port();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let receiver = thread::spawn(move || {
        let mut m2 = Messenger::builder()
            .name("trip-recv")
            .timeout(STEP_TIMEOUT)
            .incoming_window(16)
            .build();
        m2.start().unwrap();
        m2.subscribe(&format!("amqp://~127.0.0.1:{}", port)).unwrap();
        ready_tx.send(()).unwrap();

        let mut received = None;
        for _ in 0..ATTEMPTS {
            match m2.recv(1) {
                Ok(()) | Err(Error::Timeout) => {}
                Err(err) => panic!("recv failed: {}", err),
            }
            if let Some(message) = m2.get().unwrap() {
                received = Some(message);
                break;
            }
        }
        let message = received.expect("no message arrived");
        assert_eq!(
            message.body,
            Body::Value(Value::String(String::from("hi")))
        );
        // The sender left reply-to empty, so it defaulted to its name
        assert_eq!(message.reply_to(), Some("amqp://trip-send"));

        let tracker = m2.incoming_tracker().unwrap();
        m2.accept(tracker, false);
        assert_eq!(m2.status(tracker), Status::Accepted);

        // Keep pumping so the peer sees the disposition and can close
        while done_rx.try_recv().is_err() {
            let _ = m2.send();
            thread::sleep(Duration::from_millis(5));
        }
        m2.stop().unwrap();
    });

    ready_rx.recv().unwrap();
    let mut m1 = Messenger::builder()
        .name("trip-send")
        .timeout(STEP_TIMEOUT)
        .outgoing_window(16)
        .build();
    m1.start().unwrap();

    let mut message = Message::new();
    message.set_address(format!("amqp://127.0.0.1:{}/q", port));
    message.set_body(Value::String(String::from("hi")));
    let tracker = m1.put(message).unwrap();
    assert_eq!(m1.status(tracker), Status::Pending);

    let mut settled = false;
    for _ in 0..ATTEMPTS {
        match m1.send() {
            Ok(()) => {
                settled = true;
                break;
            }
            Err(Error::Timeout) => {}
            Err(err) => panic!("send failed: {}", err),
        }
    }
    assert!(settled, "send never settled");
    assert_eq!(m1.status(tracker), Status::Accepted);
    assert_eq!(m1.outgoing(), 0);

    m1.stop().unwrap();
    done_tx.send(()).unwrap();
    receiver.join().unwrap();
}

#[test]
fn outgoing_window_bounds_addressable_trackers() {
    init_tracing();
    let port = free_port();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let receiver = thread::spawn(move || {
        let mut m2 = Messenger::builder()
            .name("window-recv")
            .timeout(STEP_TIMEOUT)
            .incoming_window(16)
            .build();
        m2.start().unwrap();
        m2.subscribe(&format!("amqp://~127.0.0.1:{}", port)).unwrap();
        ready_tx.send(()).unwrap();

        let mut taken = 0;
        for _ in 0..ATTEMPTS {
            match m2.recv(1) {
                Ok(()) | Err(Error::Timeout) => {}
                Err(err) => panic!("recv failed: {}", err),
            }
            while m2.get().unwrap().is_some() {
                taken += 1;
            }
            if taken == 3 {
                break;
            }
        }
        assert_eq!(taken, 3, "expected three deliveries");
        // Accept everything up to the newest tracker in one cumulative
        // disposition
        let tracker = m2.incoming_tracker().unwrap();
        m2.accept(tracker, true);

        while done_rx.try_recv().is_err() {
            let _ = m2.send();
            thread::sleep(Duration::from_millis(5));
        }
        m2.stop().unwrap();
    });

    ready_rx.recv().unwrap();
    let mut m1 = Messenger::builder()
        .name("window-send")
        .timeout(STEP_TIMEOUT)
        .outgoing_window(2)
        .build();
    m1.start().unwrap();

    let mut trackers = Vec::new();
    for body in ["one", "two", "three"] {
        let mut message = Message::new();
        message.set_address(format!("amqp://127.0.0.1:{}/q", port));
        message.set_body(Value::String(String::from(body)));
        trackers.push(m1.put(message).unwrap());
    }

    let mut settled = false;
    for _ in 0..ATTEMPTS {
        match m1.send() {
            Ok(()) => {
                settled = true;
                break;
            }
            Err(Error::Timeout) => {}
            Err(err) => panic!("send failed: {}", err),
        }
    }
    assert!(settled, "send never settled");

    // Window 2: the two most recent stay addressable, the oldest expired
    assert_eq!(m1.status(trackers[0]), Status::Unknown);
    assert_eq!(m1.status(trackers[1]), Status::Accepted);
    assert_eq!(m1.status(trackers[2]), Status::Accepted);

    m1.stop().unwrap();
    done_tx.send(()).unwrap();
    receiver.join().unwrap();
}
