//! Video capture through an external decoder process.
//!
//! This module provides the two frame producers:
//! - Local video files (`LocalFileStreamer`), paced to the target frame rate
//! - Webcams (`WebcamStreamer`), free-running and latest-frame-wins
//!
//! Both spawn `ffmpeg`, scale to a fixed resolution, and read raw RGBA frames
//! from its stdout. Every streamer exposes the same lifecycle:
//! - `start()` launches the decoder and the reader thread
//! - `frames()` yields frames until the stream ends or the streamer stops
//! - `errors()` yields at most one fatal error, then both channels close
//! - `stop()` is idempotent and kills and reaps the decoder
//!
//! The capture layer MUST NOT log frame content.

mod factory;
pub(crate) mod ffmpeg;
mod local;
mod probe;
mod webcam;

pub use factory::new_streamer;
pub use ffmpeg::ExternalTool;
pub use local::{local_decode_args, LocalFileStreamer, FALLBACK_FPS, LOCAL_FRAME_CAPACITY};
pub use probe::{probe_dimensions, VideoDimensions};
pub use webcam::{
    list_cameras, parse_dshow_devices, webcam_input_args, CapturePlatform, WebcamStreamer,
    WEBCAM_FRAME_CAPACITY,
};

use crossbeam_channel::Receiver;
use thiserror::Error;

use crate::config::SourceKind;
use crate::frame::Frame;

/// Failures of the capture layer.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The probe tool failed or reported no video stream.
    #[error("failed to probe {path}: {reason}")]
    Probe { path: String, reason: String },

    /// The decoder could not be started.
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    /// A short or failed read from the decoder output. Fatal for the streamer.
    #[error("frame stream ended after {frames} frames: {source}")]
    StreamRead {
        frames: u64,
        #[source]
        source: std::io::Error,
        /// Last lines the decoder wrote to stderr.
        stderr_tail: Vec<String>,
    },

    #[error("unsupported video source: {0}")]
    UnsupportedSource(String),
}

/// A running source of decoded frames.
///
/// Implementations use interior mutability so that a streamer can be shared
/// (`Arc<dyn VideoStreamer>`) between the owner that stops it and the
/// processor that reads from it.
pub trait VideoStreamer: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Launch the decoder and begin producing frames.
    fn start(&self) -> Result<(), CaptureError>;

    /// Stop producing frames. Idempotent; bounded by process termination.
    fn stop(&self);

    /// Frame channel. Closed when the streamer terminates for any reason.
    fn frames(&self) -> Receiver<Frame>;

    /// Fatal-error channel. Carries at most one error, then closes.
    fn errors(&self) -> Receiver<CaptureError>;
}
