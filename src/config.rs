use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::capture::ExternalTool;

const DEFAULT_TARGET_FPS: u32 = 24;
const DEFAULT_SCALED_WIDTH: u32 = 640;
const DEFAULT_SCALED_HEIGHT: u32 = 640;
const DEFAULT_WEBCAM_DEVICE: &str = "0";
const DEFAULT_DETECTOR_HOST: &str = "localhost:8080";
const DEFAULT_DETECTOR_PATH: &str = "/ws";
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 2_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Which kind of video source the relay captures from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Local,
    Webcam,
    YouTube,
}

impl SourceKind {
    /// Tag used in config files and logs.
    pub fn tag(self) -> &'static str {
        match self {
            SourceKind::Local => "Local",
            SourceKind::Webcam => "Web-Camera",
            SourceKind::YouTube => "YouTube",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "file" => Ok(SourceKind::Local),
            "web-camera" | "webcam" | "camera" => Ok(SourceKind::Webcam),
            "youtube" => Ok(SourceKind::YouTube),
            other => Err(format!(
                "unknown video source '{}' (expected Local, Web-Camera or YouTube)",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    active_source: Option<String>,
    target_fps: Option<u32>,
    #[serde(alias = "scaled_witdh")]
    scaled_width: Option<u32>,
    scaled_height: Option<u32>,
    local: Option<LocalConfigFile>,
    webcam: Option<WebcamConfigFile>,
    youtube: Option<YouTubeConfigFile>,
    detector: Option<DetectorConfigFile>,
    tools: Option<ToolsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct LocalConfigFile {
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WebcamConfigFile {
    device_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct YouTubeConfigFile {
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    host: Option<String>,
    path: Option<String>,
    reconnect_backoff_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ToolsConfigFile {
    ffmpeg: Option<ToolConfigFile>,
    ffprobe: Option<ToolConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ToolConfigFile {
    program: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
}

/// Immutable configuration snapshot read when a streamer is (re)built.
#[derive(Debug, Clone)]
pub struct Config {
    pub active_source: SourceKind,
    pub target_fps: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub local: LocalSettings,
    pub webcam: WebcamSettings,
    pub youtube: YouTubeSettings,
    pub detector: DetectorSettings,
    pub tools: ToolSettings,
}

#[derive(Debug, Clone, Default)]
pub struct LocalSettings {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct WebcamSettings {
    pub device_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct YouTubeSettings {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// `host[:port]` of the detection service.
    pub host: String,
    pub path: String,
    pub reconnect_backoff: Duration,
    pub connect_timeout: Duration,
}

impl DetectorSettings {
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.host, self.path)
    }
}

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub ffmpeg: ExternalTool,
    pub ffprobe: ExternalTool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_source: SourceKind::Local,
            target_fps: DEFAULT_TARGET_FPS,
            scaled_width: DEFAULT_SCALED_WIDTH,
            scaled_height: DEFAULT_SCALED_HEIGHT,
            local: LocalSettings::default(),
            webcam: WebcamSettings {
                device_id: DEFAULT_WEBCAM_DEVICE.to_string(),
            },
            youtube: YouTubeSettings::default(),
            detector: DetectorSettings {
                host: DEFAULT_DETECTOR_HOST.to_string(),
                path: DEFAULT_DETECTOR_PATH.to_string(),
                reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
                connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            },
            tools: ToolSettings {
                ffmpeg: ExternalTool::new("ffmpeg"),
                ffprobe: ExternalTool::new("ffprobe"),
            },
        }
    }
}

impl Config {
    /// Load from the file named by `VISION_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VISION_CONFIG").ok();
        Self::load_from(
            config_path
                .as_deref()
                .filter(|path| !path.trim().is_empty())
                .map(Path::new),
        )
    }

    /// Same as `load`, with the file path given explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let active_source = match file.active_source.as_deref() {
            Some(tag) => tag.parse().map_err(|e: String| anyhow!(e))?,
            None => defaults.active_source,
        };
        let detector_file = file.detector.unwrap_or_default();
        let tools_file = file.tools.unwrap_or_default();
        Ok(Self {
            active_source,
            target_fps: file.target_fps.unwrap_or(defaults.target_fps),
            scaled_width: file.scaled_width.unwrap_or(defaults.scaled_width),
            scaled_height: file.scaled_height.unwrap_or(defaults.scaled_height),
            local: LocalSettings {
                path: file.local.and_then(|local| local.path).unwrap_or_default(),
            },
            webcam: WebcamSettings {
                device_id: file
                    .webcam
                    .and_then(|webcam| webcam.device_id)
                    .unwrap_or(defaults.webcam.device_id),
            },
            youtube: YouTubeSettings {
                url: file.youtube.and_then(|yt| yt.url).unwrap_or_default(),
            },
            detector: DetectorSettings {
                host: detector_file.host.unwrap_or(defaults.detector.host),
                path: detector_file.path.unwrap_or(defaults.detector.path),
                reconnect_backoff: detector_file
                    .reconnect_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.detector.reconnect_backoff),
                connect_timeout: detector_file
                    .connect_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.detector.connect_timeout),
            },
            tools: ToolSettings {
                ffmpeg: tool_from_file(tools_file.ffmpeg, defaults.tools.ffmpeg),
                ffprobe: tool_from_file(tools_file.ffprobe, defaults.tools.ffprobe),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = env_value("VISION_SOURCE") {
            self.active_source = source
                .parse()
                .map_err(|e: String| anyhow!("VISION_SOURCE: {}", e))?;
        }
        if let Some(fps) = env_value("VISION_TARGET_FPS") {
            self.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("VISION_TARGET_FPS must be a non-negative integer"))?;
        }
        if let Some(width) = env_value("VISION_WIDTH") {
            self.scaled_width = width
                .parse()
                .map_err(|_| anyhow!("VISION_WIDTH must be a positive integer"))?;
        }
        if let Some(height) = env_value("VISION_HEIGHT") {
            self.scaled_height = height
                .parse()
                .map_err(|_| anyhow!("VISION_HEIGHT must be a positive integer"))?;
        }
        if let Some(path) = env_value("VISION_LOCAL_PATH") {
            self.local.path = path;
        }
        if let Some(device) = env_value("VISION_WEBCAM_DEVICE") {
            self.webcam.device_id = device;
        }
        if let Some(host) = env_value("VISION_DETECTOR_HOST") {
            self.detector.host = host;
        }
        if let Some(program) = env_value("VISION_FFMPEG") {
            self.tools.ffmpeg = ExternalTool::new(program);
        }
        if let Some(program) = env_value("VISION_FFPROBE") {
            self.tools.ffprobe = ExternalTool::new(program);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scaled_width == 0 || self.scaled_height == 0 {
            return Err(anyhow!(
                "scaled resolution must be non-zero (got {}x{})",
                self.scaled_width,
                self.scaled_height
            ));
        }
        if self.detector.host.trim().is_empty() {
            return Err(anyhow!("detector host must not be empty"));
        }
        if !self.detector.path.starts_with('/') {
            return Err(anyhow!(
                "detector path must start with '/' (got '{}')",
                self.detector.path
            ));
        }
        if self.detector.reconnect_backoff.is_zero() {
            return Err(anyhow!("detector reconnect backoff must be greater than zero"));
        }
        if self.detector.connect_timeout.is_zero() {
            return Err(anyhow!("detector connect timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Capacity of the processor's frame output: one second of frames, at least one.
    pub fn frame_output_capacity(&self) -> usize {
        self.target_fps.max(1) as usize
    }
}

fn tool_from_file(file: Option<ToolConfigFile>, default: ExternalTool) -> ExternalTool {
    match file {
        Some(ToolConfigFile {
            program: Some(program),
            args,
        }) => ExternalTool::new(program).with_leading_args(args),
        Some(ToolConfigFile {
            program: None,
            args,
        }) => default.with_leading_args(args),
        None => default,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
