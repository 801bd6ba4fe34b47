//! Owner-side wiring of detector, processor and streamer.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::capture::{self, CaptureError, VideoStreamer};
use crate::config::Config;
use crate::detector::{DetectorEndpoint, RemoteDetector};
use crate::processor::Processor;

/// Builds a streamer from a config snapshot.
pub type StreamerFactory =
    Box<dyn Fn(&Config) -> Result<Arc<dyn VideoStreamer>, CaptureError> + Send + Sync>;

/// Owns the long-lived detector and processor and swaps streamers on restart.
pub struct Controller {
    detector: RemoteDetector,
    processor: Processor,
    factory: StreamerFactory,
}

impl Controller {
    /// Build the detector and processor for `cfg`. Nothing runs yet.
    pub fn new(cfg: &Config) -> Result<Self> {
        Self::with_factory(cfg, Box::new(capture::new_streamer))
    }

    pub fn with_factory(cfg: &Config, factory: StreamerFactory) -> Result<Self> {
        let endpoint = DetectorEndpoint::from_settings(&cfg.detector)?;
        let detector = RemoteDetector::new(endpoint);
        let processor = Processor::from_config(cfg, detector.link());
        Ok(Self {
            detector,
            processor,
            factory,
        })
    }

    /// Start the detector connection loop.
    pub fn start_detector(&self) -> Result<()> {
        self.detector.start()
    }

    pub fn detector(&self) -> &RemoteDetector {
        &self.detector
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// (Re)start processing with a fresh streamer built from `cfg`.
    ///
    /// The previous session and streamer are stopped first. The detector is
    /// reused as is.
    pub fn restart(&self, cfg: &Config) -> Result<()> {
        self.stop_processing();

        let streamer = (self.factory)(cfg)
            .with_context(|| format!("build {} streamer", cfg.active_source))?;
        if let Err(err) = streamer.start() {
            streamer.stop();
            return Err(err).with_context(|| format!("start {} streamer", cfg.active_source));
        }
        self.processor.set_streamer(streamer);
        self.processor.start()
    }

    /// Stop the processor session and the streamer it was reading.
    pub fn stop_processing(&self) {
        self.processor.stop();
        if let Some(streamer) = self.processor.take_streamer() {
            streamer.stop();
            log::info!("Controller: {} streamer stopped", streamer.kind());
        }
    }

    pub fn shutdown(&self) {
        self.stop_processing();
        self.detector.stop();
    }
}
