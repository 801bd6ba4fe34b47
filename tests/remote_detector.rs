//! Detector link against an in-process WebSocket service.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tungstenite::{Message, WebSocket};

use vision_relay::detector::{ConnectionState, DetectorEndpoint, RemoteDetector};
use vision_relay::{DetectionBatch, Frame};

const DEADLINE: Duration = Duration::from_secs(10);

/// Accepts connections one at a time and hands each to `handler` with its index.
fn spawn_service<F>(handler: F) -> SocketAddr
where
    F: Fn(usize, WebSocket<TcpStream>) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock service");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        for (index, stream) in listener.incoming().enumerate() {
            let Ok(stream) = stream else { continue };
            let Ok(socket) = tungstenite::accept(stream) else {
                continue;
            };
            handler(index, socket);
        }
    });
    addr
}

fn batch_json(label: &str) -> String {
    format!(r#"[{{"label":"{}","confidence":0.9,"box":[0.1,0.2,0.3,0.4]}}]"#, label)
}

/// Reply to each binary frame with a batch labelled `<prefix>-<n>`; stop after `limit` replies.
fn reply_with_labels(socket: &mut WebSocket<TcpStream>, prefix: &str, limit: Option<usize>) {
    let mut replied = 0;
    while limit.map_or(true, |limit| replied < limit) {
        match socket.read() {
            Ok(Message::Binary(data)) => {
                assert_eq!(&data[..2], &[0xFF, 0xD8], "frames arrive as JPEG");
                let reply = batch_json(&format!("{}-{}", prefix, replied));
                if socket.send(Message::text(reply)).is_err() {
                    return;
                }
                replied += 1;
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

fn detector_for(addr: SocketAddr, backoff: Duration) -> RemoteDetector {
    let endpoint = DetectorEndpoint::new(
        &format!("ws://{}/ws", addr),
        backoff,
        Duration::from_secs(2),
    )
    .expect("endpoint");
    RemoteDetector::new(endpoint)
}

fn wait_for_state(detector: &RemoteDetector, state: ConnectionState) {
    let started = Instant::now();
    while detector.state() != state {
        assert!(started.elapsed() < DEADLINE, "detector never reached {:?}", state);
        thread::sleep(Duration::from_millis(10));
    }
}

/// Offer a frame every few milliseconds and collect batch labels until `done` holds.
fn pump_until<F>(detector: &RemoteDetector, done: F) -> Vec<String>
where
    F: Fn(&[String]) -> bool,
{
    let link = detector.link();
    let frame = Frame::filled(8, 8, [30, 60, 90, 255]);
    let mut labels = Vec::new();
    let started = Instant::now();
    while !done(&labels) {
        assert!(
            started.elapsed() < DEADLINE,
            "timed out; received {:?}",
            labels
        );
        link.input.offer(frame.clone());
        if let Ok(batch) = link.output.recv_timeout(Duration::from_millis(50)) {
            let batch: DetectionBatch = batch;
            labels.extend(batch.into_iter().map(|det| det.label));
        }
    }
    labels
}

/// Pseudo-random pixels compress poorly, so each frame is large on the wire.
fn noise_frame(size: u32) -> Frame {
    let mut state: u32 = 0x9E37_79B9;
    let pixels = (0..size * size * 4)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect();
    Frame::from_rgba(size, size, pixels).expect("noise frame")
}

/// Completes the handshake, then holds every socket open without reading.
fn spawn_unread_service() -> SocketAddr {
    let held: Arc<Mutex<Vec<WebSocket<TcpStream>>>> = Arc::new(Mutex::new(Vec::new()));
    spawn_service(move |_, socket| held.lock().unwrap().push(socket))
}

/// Offer large frames until the send counter has not moved for a second.
fn send_until_stalled(detector: &RemoteDetector) -> u64 {
    let link = detector.link();
    let frame = noise_frame(512);
    let quiet = Duration::from_secs(1);
    let started = Instant::now();
    let mut last = detector.counters().frames_sent;
    let mut last_change = Instant::now();
    loop {
        assert!(started.elapsed() < DEADLINE, "sends never stalled");
        link.input.offer(frame.clone());
        thread::sleep(Duration::from_millis(20));
        let sent = detector.counters().frames_sent;
        if sent != last {
            last = sent;
            last_change = Instant::now();
        } else if sent > 0 && last_change.elapsed() >= quiet {
            return sent;
        }
    }
}

fn index_of(label: &str, prefix: &str) -> Option<usize> {
    label.strip_prefix(prefix)?.strip_prefix('-')?.parse().ok()
}

#[test]
fn streams_frames_and_publishes_batches_in_order() {
    let addr = spawn_service(|_, mut socket| reply_with_labels(&mut socket, "f", None));
    let detector = detector_for(addr, Duration::from_millis(200));
    detector.start().unwrap();
    wait_for_state(&detector, ConnectionState::Connected);

    let labels = pump_until(&detector, |labels| labels.len() >= 5);
    let indices: Vec<usize> = labels.iter().filter_map(|l| index_of(l, "f")).collect();
    assert_eq!(indices.len(), labels.len());
    assert!(indices.windows(2).all(|w| w[0] < w[1]), "{:?}", indices);

    let counters = detector.counters();
    assert!(counters.frames_sent >= 5);
    assert!(counters.batches_received >= 5);
    assert_eq!(counters.sessions, 1);

    detector.stop();
    assert_eq!(detector.state(), ConnectionState::Disconnected);
}

#[test]
fn malformed_payloads_are_skipped_without_dropping_the_connection() {
    let addr = spawn_service(|_, mut socket| {
        let mut count = 0usize;
        while let Ok(message) = socket.read() {
            if !message.is_binary() {
                continue;
            }
            let reply = if count % 2 == 0 {
                Message::text("{ this is not a batch")
            } else {
                Message::text(batch_json(&format!("ok-{}", count)))
            };
            if socket.send(reply).is_err() {
                return;
            }
            count += 1;
        }
    });
    let detector = detector_for(addr, Duration::from_millis(200));
    detector.start().unwrap();
    wait_for_state(&detector, ConnectionState::Connected);

    let labels = pump_until(&detector, |labels| labels.len() >= 3);
    assert!(labels.iter().all(|label| label.starts_with("ok-")));

    let counters = detector.counters();
    assert!(counters.decode_failures >= 3);
    assert_eq!(counters.sessions, 1, "bad payloads must not force a reconnect");
    assert_eq!(detector.state(), ConnectionState::Connected);
    detector.stop();
}

#[test]
fn reconnects_once_per_backoff_and_resumes_in_order() {
    let backoff = Duration::from_millis(400);
    let dropped_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let reconnected_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

    let (dropped, reconnected) = (Arc::clone(&dropped_at), Arc::clone(&reconnected_at));
    let addr = spawn_service(move |index, mut socket| {
        if index == 0 {
            reply_with_labels(&mut socket, "a", Some(2));
            // Close cleanly so the client reads both replies before the connection ends.
            let _ = socket.close(None);
            while socket.read().is_ok() {}
            *dropped.lock().unwrap() = Some(Instant::now());
        } else {
            reconnected.lock().unwrap().get_or_insert_with(Instant::now);
            reply_with_labels(&mut socket, "b", None);
        }
    });

    let detector = detector_for(addr, backoff);
    detector.start().unwrap();
    wait_for_state(&detector, ConnectionState::Connected);

    let labels = pump_until(&detector, |labels| {
        labels.iter().filter(|l| l.starts_with("b-")).count() >= 3
    });

    let first_b = labels
        .iter()
        .position(|l| l.starts_with("b-"))
        .expect("batches after reconnect");
    assert_eq!(&labels[..first_b], ["a-0", "a-1"]);
    let after: Vec<usize> = labels[first_b..]
        .iter()
        .map(|l| index_of(l, "b").expect("only b batches after reconnect"))
        .collect();
    assert!(
        after.windows(2).all(|w| w[0] < w[1]),
        "duplicate or reordered batches: {:?}",
        after
    );

    let dropped = dropped_at.lock().unwrap().expect("first connection dropped");
    let reconnected = reconnected_at.lock().unwrap().expect("second connection");
    assert!(
        reconnected.duration_since(dropped) >= backoff.mul_f32(0.8),
        "reconnected before the backoff elapsed"
    );

    let counters = detector.counters();
    assert_eq!(counters.sessions, 2);
    assert_eq!(counters.connect_attempts, 2);
    detector.stop();
}

#[test]
fn failed_connects_retry_once_per_interval() {
    // Reserve a port, then free it so nothing is listening.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let detector = detector_for(addr, Duration::from_millis(100));
    detector.start().unwrap();
    thread::sleep(Duration::from_millis(550));

    let attempts = detector.counters().connect_attempts;
    assert!((3..=7).contains(&attempts), "{} attempts in 550ms", attempts);
    assert_ne!(detector.state(), ConnectionState::Connected);

    let started = Instant::now();
    detector.stop();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(detector.counters().sessions, 0);
}

#[test]
fn stop_closes_output_and_is_idempotent() {
    let addr = spawn_service(|_, mut socket| reply_with_labels(&mut socket, "s", None));
    let detector = detector_for(addr, Duration::from_millis(200));
    let link = detector.link();
    detector.start().unwrap();
    assert!(detector.start().is_err());
    wait_for_state(&detector, ConnectionState::Connected);

    let started = Instant::now();
    detector.stop();
    detector.stop();
    assert!(started.elapsed() < Duration::from_secs(3));

    while link.output.try_recv().is_ok() {}
    assert!(link.output.recv_timeout(Duration::from_secs(1)).is_err());
}

#[test]
fn stop_returns_while_the_peer_stops_reading() {
    let addr = spawn_unread_service();
    let detector = detector_for(addr, Duration::from_millis(200));
    detector.start().unwrap();
    wait_for_state(&detector, ConnectionState::Connected);
    send_until_stalled(&detector);

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let started = Instant::now();
    thread::spawn(move || {
        detector.stop();
        let _ = done_tx.send(detector.state());
    });
    let state = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("stop blocked behind a stalled send");
    assert_eq!(state, ConnectionState::Disconnected);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn stalled_peer_is_treated_as_a_lost_connection() {
    let addr = spawn_unread_service();
    let detector = detector_for(addr, Duration::from_millis(200));
    detector.start().unwrap();
    wait_for_state(&detector, ConnectionState::Connected);
    send_until_stalled(&detector);

    let started = Instant::now();
    while detector.counters().sessions < 2 {
        assert!(
            started.elapsed() < DEADLINE,
            "no reconnect after the peer stopped reading"
        );
        thread::sleep(Duration::from_millis(20));
    }
    assert!(detector.counters().connect_attempts >= 2);
    detector.stop();
}
