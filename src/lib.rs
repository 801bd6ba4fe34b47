//! Vision Relay
//!
//! Captures live video through an external decoder, streams sampled frames to a
//! remote object detector over a WebSocket, and republishes frames and
//! detection batches for a display consumer.
//!
//! # Module Structure
//!
//! - `capture`: ffmpeg-backed streamers (local file, webcam) and the factory
//! - `detector`: remote detector client, wire codec, detection geometry
//! - `processor`: session loops binding a streamer to the detector
//! - `controller`: restart and shutdown sequencing for an owner
//! - `config`: configuration snapshot (file + environment)
//! - `queue`, `signal`: bounded overflow-policy queues and stop signals
//!
//! Every channel between components is bounded. Producers never block on a
//! slow consumer except the local-file reader, which blocks until stopped.

pub mod capture;
pub mod config;
pub mod controller;
pub mod detector;
pub mod frame;
pub mod processor;
pub mod queue;
pub mod signal;

pub use capture::{new_streamer, CaptureError, ExternalTool, VideoStreamer};
pub use config::{Config, SourceKind};
pub use controller::Controller;
pub use detector::{
    ConnectionState, DetectionBatch, DetectionResult, DetectorEndpoint, DetectorError,
    DetectorLink, RemoteDetector,
};
pub use frame::{Frame, PixelFormat};
pub use processor::{Processor, ProcessorStatus};
pub use queue::{bounded_queue, Offer, OverflowPolicy, QueueSender};
pub use signal::StopSignal;
