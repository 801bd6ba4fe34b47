use std::sync::Arc;

use super::{CaptureError, LocalFileStreamer, VideoStreamer, WebcamStreamer};
use crate::config::{Config, SourceKind};

/// Build the streamer selected by `cfg.active_source`. The streamer is not started.
pub fn new_streamer(cfg: &Config) -> Result<Arc<dyn VideoStreamer>, CaptureError> {
    match cfg.active_source {
        SourceKind::Webcam => Ok(Arc::new(WebcamStreamer::new(cfg))),
        SourceKind::Local => Ok(Arc::new(LocalFileStreamer::new(cfg)?)),
        SourceKind::YouTube => Err(CaptureError::UnsupportedSource(format!(
            "{} streaming is not available",
            cfg.active_source
        ))),
    }
}
