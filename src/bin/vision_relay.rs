//! vision-relay - capture a video source and relay it through a remote detector.
//!
//! Loads the configuration (file, environment, flags), connects to the
//! detection service, starts the selected streamer, and runs a headless
//! consumer that keeps the latest frame and detections and reports FPS and
//! latency once per second. Ctrl-C shuts everything down in order.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select, tick};
use std::path::PathBuf;
use std::time::Duration;

use vision_relay::capture::list_cameras;
use vision_relay::detector::OverlayTransform;
use vision_relay::{Config, Controller, DetectionBatch, Frame, SourceKind};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relay live video frames to a remote object detector"
)]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "VISION_CONFIG")]
    config: Option<PathBuf>,

    /// Video source: Local, Web-Camera or YouTube.
    #[arg(long)]
    source: Option<SourceKind>,

    /// Local video file to play (implies --source local unless set).
    #[arg(long)]
    input: Option<String>,

    /// Webcam device (index, /dev/videoN, or DirectShow name).
    #[arg(long)]
    device: Option<String>,

    /// Target frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Scaled frame width.
    #[arg(long)]
    width: Option<u32>,

    /// Scaled frame height.
    #[arg(long)]
    height: Option<u32>,

    /// Detection service as host:port.
    #[arg(long)]
    detector: Option<String>,

    /// Canvas size used when logging overlay rectangles, e.g. 1280x720.
    #[arg(long, default_value = "1280x720", value_parser = parse_canvas)]
    canvas: Canvas,

    /// List capture devices and exit.
    #[arg(long)]
    list_cameras: bool,
}

impl Args {
    fn apply(&self, cfg: &mut Config) {
        if let Some(path) = &self.input {
            cfg.local.path = path.clone();
            if self.source.is_none() {
                cfg.active_source = SourceKind::Local;
            }
        }
        if let Some(source) = self.source {
            cfg.active_source = source;
        }
        if let Some(device) = &self.device {
            cfg.webcam.device_id = device.clone();
        }
        if let Some(fps) = self.fps {
            cfg.target_fps = fps;
        }
        if let Some(width) = self.width {
            cfg.scaled_width = width;
        }
        if let Some(height) = self.height {
            cfg.scaled_height = height;
        }
        if let Some(host) = &self.detector {
            cfg.detector.host = host.clone();
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Canvas {
    width: f32,
    height: f32,
}

fn parse_canvas(value: &str) -> Result<Canvas, String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", value))?;
    let w: f32 = w.trim().parse().map_err(|_| format!("bad canvas width '{}'", w))?;
    let h: f32 = h.trim().parse().map_err(|_| format!("bad canvas height '{}'", h))?;
    Ok(Canvas {
        width: w,
        height: h,
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = Config::load_from(args.config.as_deref())?;
    args.apply(&mut cfg);
    cfg.validate()?;

    if args.list_cameras {
        for camera in list_cameras(&cfg.tools.ffmpeg)? {
            println!("{}", camera);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let controller = Controller::new(&cfg)?;
    controller.start_detector()?;
    log::info!("detector endpoint {}", controller.detector().endpoint().url());

    if let Err(err) = controller.restart(&cfg) {
        controller.shutdown();
        return Err(err);
    }

    run_consumer(&controller, &shutdown_rx, args.canvas);

    log::info!("shutting down...");
    controller.shutdown();
    Ok(())
}

/// Drain processor outputs until Ctrl-C or a capture failure.
fn run_consumer(
    controller: &Controller,
    shutdown: &crossbeam_channel::Receiver<()>,
    canvas: Canvas,
) {
    let processor = controller.processor();
    let frames = processor.frames();
    let detections = processor.detections();
    let failures = processor.failures();
    let report = tick(REPORT_INTERVAL);

    let mut latest_frame: Option<Frame> = None;
    let mut latest_batch: DetectionBatch = Vec::new();

    loop {
        select! {
            recv(shutdown) -> _ => return,
            recv(frames) -> frame => {
                if let Ok(frame) = frame {
                    latest_frame = Some(frame);
                }
            }
            recv(detections) -> batch => {
                let Ok(batch) = batch else { continue };
                if let Some(frame) = &latest_frame {
                    let fit = OverlayTransform::fit(
                        canvas.width,
                        canvas.height,
                        frame.width(),
                        frame.height(),
                    );
                    for detection in &batch {
                        let rect = fit.map(detection);
                        log::debug!(
                            "{} at ({:.0},{:.0})-({:.0},{:.0})",
                            detection.caption(),
                            rect.x1,
                            rect.y1,
                            rect.x2,
                            rect.y2
                        );
                    }
                }
                latest_batch = batch;
            }
            recv(failures) -> failure => {
                if let Ok(failure) = failure {
                    log::error!("capture failed: {}", failure);
                }
                return;
            }
            recv(report) -> _ => {
                let status = processor.status();
                log::info!(
                    "fps={} latency={}ms detections={} detector={:?}",
                    status.fps,
                    status.latency.as_millis(),
                    latest_batch.len(),
                    controller.detector().state()
                );
                if !status.is_active {
                    log::warn!("processor is no longer active");
                    return;
                }
            }
        }
    }
}
