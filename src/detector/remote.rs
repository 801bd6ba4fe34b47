use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use std::io::{self, ErrorKind};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::codec::{decode_batch, encode_jpeg};
use super::result::DetectionBatch;
use super::DetectorError;
use crate::config::DetectorSettings;
use crate::frame::Frame;
use crate::queue::{bounded_queue, Offer, OverflowPolicy, QueueSender};
use crate::signal::{lock, StopSignal};

pub const DETECTOR_INPUT_CAPACITY: usize = 5;
pub const DETECTOR_OUTPUT_CAPACITY: usize = 5;

/// Socket read timeout; bounds how long the receive duty holds the socket.
const READ_POLL: Duration = Duration::from_millis(20);
/// How long the receive duty backs off while a send is waiting for the socket.
const WRITER_YIELD: Duration = Duration::from_millis(1);
/// How long a torn-down connection waits for its duties before cutting the socket.
const DUTY_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }
}

/// Where and how to reach the detection service.
#[derive(Clone, Debug)]
pub struct DetectorEndpoint {
    url: Url,
    reconnect_backoff: Duration,
    connect_timeout: Duration,
}

impl DetectorEndpoint {
    pub fn new(url: &str, reconnect_backoff: Duration, connect_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid detector url '{}'", url))?;
        if url.scheme() != "ws" {
            return Err(anyhow!(
                "unsupported detector scheme '{}' (expected ws://)",
                url.scheme()
            ));
        }
        if url.host_str().is_none() {
            return Err(anyhow!("detector url '{}' has no host", url));
        }
        if connect_timeout.is_zero() {
            return Err(anyhow!("detector connect timeout must be greater than zero"));
        }
        Ok(Self {
            url,
            reconnect_backoff,
            connect_timeout,
        })
    }

    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        Self::new(
            &settings.url(),
            settings.reconnect_backoff,
            settings.connect_timeout,
        )
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn reconnect_backoff(&self) -> Duration {
        self.reconnect_backoff
    }
}

/// The processor-facing ends of a detector: frames in, detection batches out.
#[derive(Clone, Debug)]
pub struct DetectorLink {
    /// Best-effort frame input; a full queue drops the offered frame.
    pub input: QueueSender<Frame>,
    /// One batch per inbound message, in arrival order.
    pub output: Receiver<DetectionBatch>,
}

impl DetectorLink {
    pub fn new(input: QueueSender<Frame>, output: Receiver<DetectionBatch>) -> Self {
        Self { input, output }
    }
}

/// Snapshot of the detector's running counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectorCounters {
    pub connect_attempts: u64,
    pub sessions: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub batches_received: u64,
    pub decode_failures: u64,
}

#[derive(Default)]
struct Shared {
    state: AtomicU8,
    connect_attempts: AtomicU64,
    sessions: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    batches_received: AtomicU64,
    decode_failures: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Client for the remote detection service.
///
/// One logical session for the detector's whole lifetime: a supervisor thread
/// connects, serves the connection until it fails, waits the reconnect
/// backoff, and tries again until `stop()`.
pub struct RemoteDetector {
    endpoint: DetectorEndpoint,
    input_tx: QueueSender<Frame>,
    input_rx: Receiver<Frame>,
    output_tx: Mutex<Option<QueueSender<DetectionBatch>>>,
    output_rx: Receiver<DetectionBatch>,
    shared: Arc<Shared>,
    stop: StopSignal,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteDetector {
    pub fn new(endpoint: DetectorEndpoint) -> Self {
        let (input_tx, input_rx) = bounded_queue(DETECTOR_INPUT_CAPACITY, OverflowPolicy::DropNewest);
        let (output_tx, output_rx) =
            bounded_queue(DETECTOR_OUTPUT_CAPACITY, OverflowPolicy::DropOldest);
        Self {
            endpoint,
            input_tx,
            input_rx,
            output_tx: Mutex::new(Some(output_tx)),
            output_rx,
            shared: Arc::new(Shared::default()),
            stop: StopSignal::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &DetectorEndpoint {
        &self.endpoint
    }

    pub fn link(&self) -> DetectorLink {
        DetectorLink::new(self.input_tx.clone(), self.output_rx.clone())
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn counters(&self) -> DetectorCounters {
        let s = &self.shared;
        DetectorCounters {
            connect_attempts: s.connect_attempts.load(Ordering::Relaxed),
            sessions: s.sessions.load(Ordering::Relaxed),
            frames_sent: s.frames_sent.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
            batches_received: s.batches_received.load(Ordering::Relaxed),
            decode_failures: s.decode_failures.load(Ordering::Relaxed),
        }
    }

    /// Start the supervisor thread. A detector can be started once.
    pub fn start(&self) -> Result<()> {
        if self.stop.is_triggered() {
            return Err(anyhow!("detector has been stopped"));
        }
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(anyhow!("detector already started"));
        }
        let output = lock(&self.output_tx)
            .take()
            .ok_or_else(|| anyhow!("detector output already taken"))?;

        let supervisor = Supervisor {
            endpoint: self.endpoint.clone(),
            input: self.input_rx.clone(),
            output,
            shared: Arc::clone(&self.shared),
            stop: self.stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("detector-supervisor".into())
            .spawn(move || supervisor.run())
            .context("spawn detector supervisor")?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the supervisor and wait for the current connection to close.
    pub fn stop(&self) {
        if !self.stop.trigger() {
            return;
        }
        drop(lock(&self.output_tx).take());
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("detector supervisor panicked");
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        log::info!("RemoteDetector: stopped ({})", self.endpoint.url());
    }
}

impl Drop for RemoteDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Supervisor {
    endpoint: DetectorEndpoint,
    input: Receiver<Frame>,
    output: QueueSender<DetectionBatch>,
    shared: Arc<Shared>,
    stop: StopSignal,
}

impl Supervisor {
    fn run(self) {
        let backoff = self.endpoint.reconnect_backoff;
        while !self.stop.is_triggered() {
            self.shared.set_state(ConnectionState::Connecting);
            Shared::bump(&self.shared.connect_attempts);
            log::info!("RemoteDetector: connecting to {}", self.endpoint.url());

            match connect(&self.endpoint) {
                Ok(socket) => {
                    self.shared.set_state(ConnectionState::Connected);
                    Shared::bump(&self.shared.sessions);
                    log::info!("RemoteDetector: connected to {}", self.endpoint.url());
                    match self.serve(socket) {
                        Some(err) => log::warn!(
                            "RemoteDetector: connection lost ({}); reconnecting in {:?}",
                            err,
                            backoff
                        ),
                        None => log::info!("RemoteDetector: connection closed"),
                    }
                }
                Err(err) => log::warn!("RemoteDetector: {}; retrying in {:?}", err, backoff),
            }

            self.shared.set_state(ConnectionState::Disconnected);
            if self.stop.wait_timeout(backoff) {
                break;
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Run both duties on one connection until either fails or the detector stops.
    fn serve(&self, socket: WebSocket<TcpStream>) -> Option<DetectorError> {
        let socket = match SharedSocket::new(socket) {
            Ok(socket) => socket,
            Err(err) => return Some(DetectorError::Transport(err.into())),
        };
        let connection = ConnectionFailure::default();

        thread::scope(|scope| {
            let (done_tx, done_rx) = bounded::<()>(0);
            let send_done = done_tx.clone();
            scope.spawn(|| self.send_duty(&socket, &connection, send_done));
            scope.spawn(|| self.receive_duty(&socket, &connection, done_tx));
            select! {
                recv(self.stop.watch()) -> _ => {}
                recv(connection.signal.watch()) -> _ => {}
            }
            connection.signal.trigger();
            // A send stuck on a peer that stopped reading only returns once the
            // socket is shut down underneath it.
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(DUTY_GRACE) {
                log::warn!("RemoteDetector: connection stalled; shutting the socket down");
                socket.interrupt();
            }
        });

        // Only a detector stop closes politely; a failed connection is just dropped.
        let failure = connection.take();
        if failure.is_none() {
            socket.close();
        }
        failure
    }

    fn send_duty(
        &self,
        socket: &SharedSocket,
        connection: &ConnectionFailure,
        _done: Sender<()>,
    ) {
        loop {
            let frame = select! {
                recv(self.stop.watch()) -> _ => return,
                recv(connection.signal.watch()) -> _ => return,
                recv(self.input) -> frame => match frame {
                    Ok(frame) => frame,
                    Err(_) => return,
                },
            };
            let payload = match encode_jpeg(&frame) {
                Ok(payload) => payload,
                Err(err) => {
                    Shared::bump(&self.shared.frames_dropped);
                    log::warn!("RemoteDetector: dropping frame: {}", err);
                    continue;
                }
            };
            if let Err(err) = socket.send(Message::binary(payload)) {
                connection.fail(err.into());
                return;
            }
            Shared::bump(&self.shared.frames_sent);
        }
    }

    fn receive_duty(
        &self,
        socket: &SharedSocket,
        connection: &ConnectionFailure,
        _done: Sender<()>,
    ) {
        while !self.stop.is_triggered() && !connection.signal.is_triggered() {
            let message = match socket.poll_read() {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(err) => {
                    connection.fail(err.into());
                    return;
                }
            };
            match message {
                Message::Text(text) => self.publish(text.as_bytes()),
                Message::Binary(data) => self.publish(&data),
                Message::Close(_) => {
                    connection.fail(tungstenite::Error::ConnectionClosed.into());
                    return;
                }
                _ => {}
            }
        }
    }

    fn publish(&self, payload: &[u8]) {
        match decode_batch(payload) {
            Ok(batch) => {
                Shared::bump(&self.shared.batches_received);
                if self.output.offer(batch) == Offer::EvictedOldest {
                    log::debug!("RemoteDetector: output full, evicted oldest batch");
                }
            }
            Err(err) => {
                Shared::bump(&self.shared.decode_failures);
                log::warn!("RemoteDetector: skipping message: {}", err);
            }
        }
    }
}

/// First error seen on a connection, plus the signal that tears it down.
#[derive(Default)]
struct ConnectionFailure {
    signal: StopSignal,
    error: Mutex<Option<DetectorError>>,
}

impl ConnectionFailure {
    fn fail(&self, error: DetectorError) {
        let mut slot = lock(&self.error);
        if slot.is_none() && !self.signal.is_triggered() {
            *slot = Some(error);
        }
        drop(slot);
        self.signal.trigger();
    }

    fn take(&self) -> Option<DetectorError> {
        lock(&self.error).take()
    }
}

/// A WebSocket shared by the two duties of one connection.
///
/// Sync tungstenite cannot split a socket into read and write halves, and a
/// blocking read would hold the socket away from the sender indefinitely. The
/// receive duty therefore polls: each read is bounded by `READ_POLL`, and while
/// a send is waiting the reader steps aside for `WRITER_YIELD` instead of
/// taking the lock. Writes are bounded by the stream's write timeout.
///
/// A cloned handle of the TCP stream is kept outside the lock so a send
/// blocked on a stalled peer can be interrupted with `interrupt()`.
struct SharedSocket {
    socket: Mutex<WebSocket<TcpStream>>,
    waiting_writers: AtomicUsize,
    raw: TcpStream,
    interrupted: AtomicBool,
}

impl SharedSocket {
    fn new(socket: WebSocket<TcpStream>) -> io::Result<Self> {
        let raw = socket.get_ref().try_clone()?;
        Ok(Self {
            socket: Mutex::new(socket),
            waiting_writers: AtomicUsize::new(0),
            raw,
            interrupted: AtomicBool::new(false),
        })
    }

    fn send(&self, message: Message) -> tungstenite::Result<()> {
        self.waiting_writers.fetch_add(1, Ordering::SeqCst);
        let result = lock(&self.socket).send(message);
        self.waiting_writers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// One bounded read attempt. `Ok(None)` when nothing arrived in time.
    fn poll_read(&self) -> tungstenite::Result<Option<Message>> {
        if self.waiting_writers.load(Ordering::SeqCst) > 0 {
            thread::sleep(WRITER_YIELD);
            return Ok(None);
        }
        match lock(&self.socket).read() {
            Ok(message) => Ok(Some(message)),
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Shut the TCP stream down in both directions, failing any blocked send.
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Err(err) = self.raw.shutdown(Shutdown::Both) {
            log::debug!("RemoteDetector: socket shutdown: {}", err);
        }
    }

    fn close(&self) {
        if self.interrupted.load(Ordering::SeqCst) {
            return;
        }
        let mut socket = lock(&self.socket);
        if socket.close(None).is_ok() {
            let _ = socket.flush();
        }
    }
}

fn connect(endpoint: &DetectorEndpoint) -> Result<WebSocket<TcpStream>, DetectorError> {
    let url = endpoint.url();
    let connect_error = |reason: String| DetectorError::Connect {
        url: url.to_string(),
        reason,
    };

    let host = endpoint
        .url
        .host_str()
        .ok_or_else(|| connect_error("url has no host".into()))?;
    let port = endpoint
        .url
        .port_or_known_default()
        .ok_or_else(|| connect_error("url has no port".into()))?;
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| connect_error(format!("resolve {}: {}", host, e)))?
        .collect();

    let mut last_error = format!("{} resolved to no addresses", host);
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, endpoint.connect_timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(err) => last_error = format!("{}: {}", addr, err),
        }
    }
    let stream = stream.ok_or_else(|| connect_error(last_error))?;

    let _ = stream.set_nodelay(true);
    // The write timeout stays for the whole session: a peer that stops reading
    // turns into a transport error instead of a send that never returns.
    stream
        .set_read_timeout(Some(endpoint.connect_timeout))
        .and_then(|()| stream.set_write_timeout(Some(endpoint.connect_timeout)))
        .map_err(|e| connect_error(e.to_string()))?;
    let (socket, _response) =
        tungstenite::client(url, stream).map_err(|e| connect_error(e.to_string()))?;
    socket
        .get_ref()
        .set_read_timeout(Some(READ_POLL))
        .map_err(|e| connect_error(e.to_string()))?;
    Ok(socket)
}
