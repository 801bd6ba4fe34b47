//! Remote object detection over a persistent WebSocket link.
//!
//! - `RemoteDetector`: connection supervisor with reconnect backoff
//! - `DetectorLink`: the frame input / batch output pair the processor uses
//! - `codec`: JPEG frame encoding and JSON batch decoding
//! - `result`: detection records and overlay geometry

pub mod codec;
mod remote;
pub mod result;

pub use remote::{
    ConnectionState, DetectorCounters, DetectorEndpoint, DetectorLink, RemoteDetector,
    DETECTOR_INPUT_CAPACITY, DETECTOR_OUTPUT_CAPACITY,
};
pub use result::{DetectionBatch, DetectionResult, OverlayTransform, PixelRect};

use thiserror::Error;

/// Failures of the detector link. None of them are fatal to the detector:
/// connection-level errors end the current session and trigger a reconnect,
/// payload-level errors drop the offending frame or message.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("cannot connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("detector transport failed: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("malformed detection payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}
