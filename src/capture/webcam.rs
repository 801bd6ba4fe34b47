//! Webcam source.
//!
//! The device is read as fast as `ffmpeg` produces frames. The frame channel
//! holds a single frame and a new frame is discarded while it is full, so the
//! consumer always sees a recent frame and the reader never waits on it.

use regex::Regex;
use std::sync::OnceLock;

use super::ffmpeg::{ReaderContext, StreamerCore};
use super::{CaptureError, ExternalTool, VideoStreamer};
use crate::config::{Config, SourceKind};
use crate::frame::Frame;
use crate::queue::{bounded_queue, Offer, OverflowPolicy, QueueSender};

pub const WEBCAM_FRAME_CAPACITY: usize = 1;

const NO_CAMERAS_PLACEHOLDER: &str = "No cameras found";
const DEFAULT_V4L2_DEVICES: [&str; 2] = ["/dev/video0", "/dev/video1"];

/// Capture backend family, chosen by the host OS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapturePlatform {
    /// DirectShow; devices are addressed by friendly name.
    Windows,
    /// AVFoundation; devices are addressed by index or name.
    MacOs,
    /// Video4Linux2; devices are addressed by node path.
    Linux,
}

impl CapturePlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            CapturePlatform::Windows
        } else if cfg!(target_os = "macos") {
            CapturePlatform::MacOs
        } else {
            CapturePlatform::Linux
        }
    }
}

pub struct WebcamStreamer {
    device: String,
    fps: u32,
    width: u32,
    height: u32,
    platform: CapturePlatform,
    decoder: ExternalTool,
    core: StreamerCore<QueueSender<Frame>>,
}

impl WebcamStreamer {
    pub fn new(cfg: &Config) -> Self {
        let (tx, rx) = bounded_queue(WEBCAM_FRAME_CAPACITY, OverflowPolicy::DropNewest);
        Self {
            device: cfg.webcam.device_id.clone(),
            fps: cfg.target_fps,
            width: cfg.scaled_width,
            height: cfg.scaled_height,
            platform: CapturePlatform::current(),
            decoder: cfg.tools.ffmpeg.clone(),
            core: StreamerCore::new(tx, rx),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl VideoStreamer for WebcamStreamer {
    fn kind(&self) -> SourceKind {
        SourceKind::Webcam
    }

    fn start(&self) -> Result<(), CaptureError> {
        let mut args = webcam_input_args(self.platform, &self.device);
        args.extend(raw_output_args(self.fps, self.width, self.height));
        self.core.launch(
            "webcam-reader",
            &self.decoder,
            &args,
            self.width,
            self.height,
            free_running_read_loop,
        )?;
        log::info!(
            "WebcamStreamer: capturing {} ({:?}) at {}x{}",
            self.device,
            self.platform,
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

/// Input half of the `ffmpeg` command line for a capture device.
pub fn webcam_input_args(platform: CapturePlatform, device: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    match platform {
        CapturePlatform::Windows => {
            args.extend(["-f".into(), "dshow".into(), "-i".into(), format!("video={}", device)]);
        }
        CapturePlatform::MacOs => {
            args.extend(["-f".into(), "avfoundation".into(), "-i".into(), device.to_string()]);
        }
        CapturePlatform::Linux => {
            args.extend(["-f".into(), "v4l2".into(), "-i".into(), v4l2_node(device)]);
        }
    }
    args
}

fn raw_output_args(fps: u32, width: u32, height: u32) -> Vec<String> {
    let filter = if fps == 0 {
        format!("scale={}:{}", width, height)
    } else {
        format!("fps={},scale={}:{}", fps, width, height)
    };
    vec![
        "-vf".into(),
        filter,
        "-f".into(),
        "image2pipe".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-vcodec".into(),
        "rawvideo".into(),
        "-".into(),
    ]
}

/// A bare index addresses `/dev/videoN`; anything else is used as given.
fn v4l2_node(device: &str) -> String {
    match device.trim().parse::<u32>() {
        Ok(index) => format!("/dev/video{}", index),
        Err(_) => device.to_string(),
    }
}

fn free_running_read_loop(mut ctx: ReaderContext<QueueSender<Frame>>) {
    let mut dropped: u64 = 0;
    while !ctx.stop.is_triggered() {
        let frame = match ctx.reader.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                ctx.fail(err);
                break;
            }
        };
        match ctx.sink.offer(frame) {
            Offer::Closed => break,
            Offer::DroppedNewest => dropped += 1,
            Offer::Accepted | Offer::EvictedOldest => {}
        }
    }
    if dropped > 0 {
        log::debug!("WebcamStreamer: dropped {} frames behind a slow consumer", dropped);
    }
}

/// Enumerate capture devices for the current platform.
///
/// Never returns an empty list: when nothing is found a placeholder entry is
/// returned so pickers always have something to show.
pub fn list_cameras(ffmpeg: &ExternalTool) -> Result<Vec<String>, CaptureError> {
    match CapturePlatform::current() {
        CapturePlatform::Windows => {
            let output = ffmpeg
                .command()
                .args(["-hide_banner", "-list_devices", "true", "-f", "dshow", "-i", "dummy"])
                .output()
                .map_err(|err| CaptureError::Launch {
                    program: ffmpeg.display_name(),
                    reason: err.to_string(),
                })?;
            // The listing always "fails" (no real input), so only stderr matters.
            let devices = parse_dshow_devices(&String::from_utf8_lossy(&output.stderr));
            if devices.is_empty() {
                Ok(vec![NO_CAMERAS_PLACEHOLDER.to_string()])
            } else {
                Ok(devices)
            }
        }
        CapturePlatform::Linux => Ok(list_v4l2_nodes(std::path::Path::new("/dev"))),
        CapturePlatform::MacOs => Ok(default_v4l2_devices()),
    }
}

/// Extract video device names from an `ffmpeg -list_devices` dshow listing.
pub fn parse_dshow_devices(listing: &str) -> Vec<String> {
    static DEVICE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = DEVICE_RE
        .get_or_init(|| Regex::new(r#""([^"]+)"\s+\(video\)"#).ok())
        .as_ref()
    else {
        return Vec::new();
    };

    let mut devices: Vec<String> = Vec::new();
    for caps in re.captures_iter(listing) {
        let name = caps[1].trim();
        if name.is_empty() || name.eq_ignore_ascii_case("dummy") {
            continue;
        }
        if !devices.iter().any(|known| known == name) {
            devices.push(name.to_string());
        }
    }
    devices
}

fn list_v4l2_nodes(dev_dir: &std::path::Path) -> Vec<String> {
    let mut nodes: Vec<(u32, String)> = match std::fs::read_dir(dev_dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let index = name.strip_prefix("video")?.parse::<u32>().ok()?;
                Some((index, entry.path().display().to_string()))
            })
            .collect(),
        Err(err) => {
            log::debug!("cannot list {}: {}", dev_dir.display(), err);
            Vec::new()
        }
    };
    if nodes.is_empty() {
        return default_v4l2_devices();
    }
    nodes.sort();
    nodes.into_iter().map(|(_, path)| path).collect()
}

fn default_v4l2_devices() -> Vec<String> {
    DEFAULT_V4L2_DEVICES.iter().map(|dev| dev.to_string()).collect()
}
