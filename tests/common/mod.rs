//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender};

use vision_relay::config::SourceKind;
use vision_relay::{CaptureError, Frame, VideoStreamer};

/// A streamer driven by the test: frames and failures are pushed by hand.
pub struct ScriptedStreamer {
    kind: SourceKind,
    frames_tx: Mutex<Option<Sender<Frame>>>,
    frames_rx: Receiver<Frame>,
    errors_tx: Mutex<Option<Sender<CaptureError>>>,
    errors_rx: Receiver<CaptureError>,
    started: AtomicBool,
    stop_calls: AtomicUsize,
}

impl ScriptedStreamer {
    pub fn new(kind: SourceKind, capacity: usize) -> Self {
        let (frames_tx, frames_rx) = bounded(capacity);
        let (errors_tx, errors_rx) = bounded(1);
        Self {
            kind,
            frames_tx: Mutex::new(Some(frames_tx)),
            frames_rx,
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx,
            started: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
        }
    }

    /// Queue a frame; false once the streamer has terminated.
    pub fn push(&self, frame: Frame) -> bool {
        match self.frames_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Terminate the stream the way a failed decoder does: one error, then closure.
    pub fn fail(&self, error: CaptureError) {
        if let Some(tx) = self.errors_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(error);
        }
        self.close();
    }

    /// Close both channels without an error.
    pub fn close(&self) {
        self.frames_tx.lock().unwrap().take();
        self.errors_tx.lock().unwrap().take();
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl VideoStreamer for ScriptedStreamer {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn start(&self) -> Result<(), CaptureError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.close();
    }

    fn frames(&self) -> Receiver<Frame> {
        self.frames_rx.clone()
    }

    fn errors(&self) -> Receiver<CaptureError> {
        self.errors_rx.clone()
    }
}

pub fn stream_ended(frames: u64) -> CaptureError {
    CaptureError::StreamRead {
        frames,
        source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "decoder exited"),
        stderr_tail: Vec::new(),
    }
}

pub fn small_frame() -> Frame {
    Frame::filled(4, 4, [0, 128, 255, 255])
}
