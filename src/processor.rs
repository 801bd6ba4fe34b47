//! Frame/detection orchestration.
//!
//! A `Processor` binds the currently assigned video streamer to a detector
//! link. Each `start()` opens a session with two loops:
//! - capture: streamer frames -> detector input (sampled) and frame output
//! - results: detector batches -> latency bookkeeping and detection output
//!
//! Latency pairs batches with submission timestamps in FIFO order. This is an
//! approximation that holds only while the service answers every frame once,
//! in order. Leftover timestamps and batches are discarded when a session
//! starts so the pairing never crosses sessions.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{select, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::{CaptureError, VideoStreamer};
use crate::config::Config;
use crate::detector::{DetectionBatch, DetectorLink};
use crate::frame::Frame;
use crate::queue::{bounded_queue, OverflowPolicy, QueueSender};
use crate::signal::{lock, StopSignal};

pub const PENDING_CAPACITY: usize = 32;
pub const DETECTION_OUTPUT_CAPACITY: usize = 5;
pub const FAILURE_CAPACITY: usize = 4;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Counts frames in consecutive one-second windows.
#[derive(Debug)]
pub struct FpsCounter {
    window_start: Instant,
    frames: u32,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
        }
    }

    /// Count one frame. Returns the finished window's total when a window closes.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;
        if now.saturating_duration_since(self.window_start) < FPS_WINDOW {
            return None;
        }
        let completed = self.frames;
        self.frames = 0;
        self.window_start = now;
        Some(completed)
    }
}

/// Polled status of a processor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessorStatus {
    pub is_active: bool,
    pub fps: u32,
    pub latency: Duration,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct StatusCell {
    active: AtomicBool,
    fps: AtomicU32,
    latency_micros: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl StatusCell {
    fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.store(micros, Ordering::SeqCst);
    }
}

struct Session {
    stop: StopSignal,
    loops: Vec<JoinHandle<()>>,
}

impl Session {
    fn shutdown(self) {
        self.stop.trigger();
        for handle in self.loops {
            if handle.join().is_err() {
                log::error!("processor loop panicked");
            }
        }
    }
}

pub struct Processor {
    link: DetectorLink,
    streamer: Mutex<Option<Arc<dyn VideoStreamer>>>,
    frames_tx: QueueSender<Frame>,
    frames_rx: Receiver<Frame>,
    detections_tx: QueueSender<DetectionBatch>,
    detections_rx: Receiver<DetectionBatch>,
    failures_tx: QueueSender<CaptureError>,
    failures_rx: Receiver<CaptureError>,
    pending_tx: QueueSender<Instant>,
    pending_rx: Receiver<Instant>,
    status: Arc<StatusCell>,
    session: Mutex<Option<Session>>,
}

impl Processor {
    /// `frame_capacity` bounds the consumer-facing frame output.
    pub fn new(link: DetectorLink, frame_capacity: usize) -> Self {
        let (frames_tx, frames_rx) = bounded_queue(frame_capacity.max(1), OverflowPolicy::DropNewest);
        let (detections_tx, detections_rx) =
            bounded_queue(DETECTION_OUTPUT_CAPACITY, OverflowPolicy::DropNewest);
        let (failures_tx, failures_rx) = bounded_queue(FAILURE_CAPACITY, OverflowPolicy::DropOldest);
        let (pending_tx, pending_rx) = bounded_queue(PENDING_CAPACITY, OverflowPolicy::DropNewest);
        Self {
            link,
            streamer: Mutex::new(None),
            frames_tx,
            frames_rx,
            detections_tx,
            detections_rx,
            failures_tx,
            failures_rx,
            pending_tx,
            pending_rx,
            status: Arc::new(StatusCell::default()),
            session: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &Config, link: DetectorLink) -> Self {
        Self::new(link, cfg.frame_output_capacity())
    }

    /// Assign the streamer read by the next session. A running session keeps its streamer.
    pub fn set_streamer(&self, streamer: Arc<dyn VideoStreamer>) {
        *lock(&self.streamer) = Some(streamer);
    }

    /// Detach the assigned streamer so the owner can stop it.
    pub fn take_streamer(&self) -> Option<Arc<dyn VideoStreamer>> {
        lock(&self.streamer).take()
    }

    pub fn streamer(&self) -> Option<Arc<dyn VideoStreamer>> {
        lock(&self.streamer).clone()
    }

    /// Latest frames, dropping new ones while the consumer lags.
    pub fn frames(&self) -> Receiver<Frame> {
        self.frames_rx.clone()
    }

    pub fn detections(&self) -> Receiver<DetectionBatch> {
        self.detections_rx.clone()
    }

    /// Streamer-fatal errors, one per failed session.
    pub fn failures(&self) -> Receiver<CaptureError> {
        self.failures_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.active.load(Ordering::SeqCst)
    }

    pub fn fps(&self) -> u32 {
        self.status.fps.load(Ordering::SeqCst)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.status.latency_micros.load(Ordering::SeqCst))
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.status.last_error).clone()
    }

    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            is_active: self.is_active(),
            fps: self.fps(),
            latency: self.latency(),
            last_error: self.last_error(),
        }
    }

    /// Start a session on the assigned streamer. No-op while a session is running.
    pub fn start(&self) -> Result<()> {
        let mut session = lock(&self.session);
        if let Some(current) = session.as_ref() {
            if !current.stop.is_triggered() {
                return Ok(());
            }
        }
        // A session that stopped itself still has loops to join.
        if let Some(finished) = session.take() {
            finished.shutdown();
        }

        let streamer = self
            .streamer()
            .ok_or_else(|| anyhow!("no video streamer assigned"))?;
        let stale = self.pending_rx.try_iter().count();
        let stale_batches = self.link.output.try_iter().count();
        if stale > 0 || stale_batches > 0 {
            log::debug!(
                "Processor: discarded {} stale pending timestamps and {} stale batches",
                stale,
                stale_batches
            );
        }

        let stop = StopSignal::new();
        self.status.fps.store(0, Ordering::SeqCst);
        *lock(&self.status.last_error) = None;
        self.status.active.store(true, Ordering::SeqCst);

        let capture = CaptureLoop {
            frames: streamer.frames(),
            errors: streamer.errors(),
            detector_input: self.link.input.clone(),
            pending: self.pending_tx.clone(),
            output: self.frames_tx.clone(),
            failures: self.failures_tx.clone(),
            status: Arc::clone(&self.status),
            stop: stop.clone(),
        };
        let results = ResultsLoop {
            batches: self.link.output.clone(),
            pending: self.pending_rx.clone(),
            output: self.detections_tx.clone(),
            status: Arc::clone(&self.status),
            stop: stop.clone(),
        };

        let mut loops = Vec::with_capacity(2);
        let spawned = thread::Builder::new()
            .name("processor-capture".into())
            .spawn(move || capture.run())
            .context("spawn capture loop")
            .and_then(|handle| {
                loops.push(handle);
                thread::Builder::new()
                    .name("processor-results".into())
                    .spawn(move || results.run())
                    .context("spawn results loop")
            });
        match spawned {
            Ok(handle) => loops.push(handle),
            Err(err) => {
                self.status.active.store(false, Ordering::SeqCst);
                Session { stop, loops }.shutdown();
                return Err(err);
            }
        }

        *session = Some(Session { stop, loops });
        log::info!("Processor: started on {} source", streamer.kind());
        Ok(())
    }

    /// End the current session and wait for its loops. Idempotent.
    pub fn stop(&self) {
        let Some(session) = lock(&self.session).take() else {
            return;
        };
        self.status.active.store(false, Ordering::SeqCst);
        session.shutdown();
        self.status.fps.store(0, Ordering::SeqCst);
        log::info!("Processor: stopped");
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    frames: Receiver<Frame>,
    errors: Receiver<CaptureError>,
    detector_input: QueueSender<Frame>,
    pending: QueueSender<Instant>,
    output: QueueSender<Frame>,
    failures: QueueSender<CaptureError>,
    status: Arc<StatusCell>,
    stop: StopSignal,
}

impl CaptureLoop {
    fn run(self) {
        let mut fps = FpsCounter::new(Instant::now());
        loop {
            select! {
                recv(self.stop.watch()) -> _ => return,
                recv(self.frames) -> frame => match frame {
                    Ok(frame) => self.handle_frame(frame, &mut fps),
                    Err(_) => {
                        // The reader queues its error before closing the frame channel.
                        let error = self.errors.try_recv().ok();
                        self.halt(error);
                        return;
                    }
                },
                recv(self.errors) -> error => {
                    self.halt(error.ok());
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, frame: Frame, fps: &mut FpsCounter) {
        if self.detector_input.offer(frame.clone()).is_queued() {
            let _ = self.pending.offer(Instant::now());
        }
        let _ = self.output.offer(frame);
        if let Some(count) = fps.record(Instant::now()) {
            self.status.fps.store(count, Ordering::SeqCst);
        }
    }

    /// End the session from inside: surface the error once, then signal both loops.
    fn halt(&self, error: Option<CaptureError>) {
        if self.stop.is_triggered() {
            return;
        }
        match error {
            Some(error) => {
                log::error!("Processor: video streamer failed: {}", error);
                *lock(&self.status.last_error) = Some(error.to_string());
                let _ = self.failures.offer(error);
            }
            None => log::warn!("Processor: video stream closed"),
        }
        self.status.fps.store(0, Ordering::SeqCst);
        self.status.active.store(false, Ordering::SeqCst);
        self.stop.trigger();
    }
}

struct ResultsLoop {
    batches: Receiver<DetectionBatch>,
    pending: Receiver<Instant>,
    output: QueueSender<DetectionBatch>,
    status: Arc<StatusCell>,
    stop: StopSignal,
}

impl ResultsLoop {
    fn run(self) {
        loop {
            select! {
                recv(self.stop.watch()) -> _ => return,
                recv(self.batches) -> batch => {
                    let Ok(batch) = batch else {
                        log::debug!("Processor: detector output closed");
                        return;
                    };
                    if let Ok(submitted) = self.pending.try_recv() {
                        self.status.record_latency(submitted.elapsed());
                    }
                    let _ = self.output.offer(batch);
                }
            }
        }
    }
}
