//! Local video file source.
//!
//! The file is probed once for its native size, then decoded by `ffmpeg` at the
//! target rate and scaled resolution. Reads are paced by a ticker so a file
//! plays back at roughly real time instead of as fast as it decodes, and a
//! full frame channel applies backpressure rather than dropping frames.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::time::Duration;

use super::ffmpeg::{ReaderContext, StreamerCore};
use super::probe::{probe_dimensions, VideoDimensions};
use super::{CaptureError, ExternalTool, VideoStreamer};
use crate::config::{Config, SourceKind};
use crate::frame::Frame;

pub const LOCAL_FRAME_CAPACITY: usize = 10;
/// Pacing rate used when the configured rate is zero.
pub const FALLBACK_FPS: u32 = 30;

pub struct LocalFileStreamer {
    path: String,
    fps: u32,
    width: u32,
    height: u32,
    native: VideoDimensions,
    decoder: ExternalTool,
    core: StreamerCore<Sender<Frame>>,
}

impl LocalFileStreamer {
    /// Probe `cfg.local.path` and prepare a streamer. Fails with `CaptureError::Probe`.
    pub fn new(cfg: &Config) -> Result<Self, CaptureError> {
        let native = probe_dimensions(&cfg.tools.ffprobe, &cfg.local.path)?;
        log::info!(
            "LocalFileStreamer: {} is {}x{}",
            cfg.local.path,
            native.width,
            native.height
        );
        let (tx, rx) = bounded(LOCAL_FRAME_CAPACITY);
        Ok(Self {
            path: cfg.local.path.clone(),
            fps: effective_fps(cfg.target_fps),
            width: cfg.scaled_width,
            height: cfg.scaled_height,
            native,
            decoder: cfg.tools.ffmpeg.clone(),
            core: StreamerCore::new(tx, rx),
        })
    }

    /// Size reported by the probe, before scaling.
    pub fn native_dimensions(&self) -> VideoDimensions {
        self.native
    }
}

impl VideoStreamer for LocalFileStreamer {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn start(&self) -> Result<(), CaptureError> {
        let args = local_decode_args(&self.path, self.fps, self.width, self.height);
        let interval = Duration::from_secs(1) / self.fps;
        self.core.launch(
            "local-file-reader",
            &self.decoder,
            &args,
            self.width,
            self.height,
            move |ctx| paced_read_loop(ctx, interval),
        )?;
        log::info!(
            "LocalFileStreamer: playing {} at {} fps ({}x{})",
            self.path,
            self.fps,
            self.width,
            self.height
        );
        Ok(())
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn frames(&self) -> crossbeam_channel::Receiver<Frame> {
        self.core.frames()
    }

    fn errors(&self) -> crossbeam_channel::Receiver<CaptureError> {
        self.core.errors()
    }
}

fn effective_fps(target_fps: u32) -> u32 {
    if target_fps == 0 {
        FALLBACK_FPS
    } else {
        target_fps
    }
}

/// `ffmpeg` arguments that decode `path` to raw RGBA at `fps`, scaled to `width`x`height`.
pub fn local_decode_args(path: &str, fps: u32, width: u32, height: u32) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        path.into(),
        "-vf".into(),
        format!("fps={},scale={}:{}:flags=neighbor", effective_fps(fps), width, height),
        "-f".into(),
        "image2pipe".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-vcodec".into(),
        "rawvideo".into(),
        "-".into(),
    ]
}

fn paced_read_loop(mut ctx: ReaderContext<Sender<Frame>>, interval: Duration) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ctx.stop.watch()) -> _ => return,
            recv(ticker) -> _ => {}
        }
        let frame = match ctx.reader.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        // Blocking send, abandoned as soon as a stop is requested.
        select! {
            send(ctx.sink, frame) -> sent => {
                if sent.is_err() {
                    return;
                }
            }
            recv(ctx.stop.watch()) -> _ => return,
        }
    }
}
