use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use vision_relay::config::{Config, SourceKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VISION_CONFIG",
        "VISION_SOURCE",
        "VISION_TARGET_FPS",
        "VISION_WIDTH",
        "VISION_HEIGHT",
        "VISION_LOCAL_PATH",
        "VISION_WEBCAM_DEVICE",
        "VISION_DETECTOR_HOST",
        "VISION_FFMPEG",
        "VISION_FFPROBE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "active_source": "Web-Camera",
        "target_fps": 12,
        "scaled_width": 800,
        "scaled_height": 600,
        "local": { "path": "/srv/clips/street.mp4" },
        "webcam": { "device_id": "/dev/video2" },
        "detector": {
            "host": "detector.lan:9000",
            "path": "/infer",
            "reconnect_backoff_ms": 500
        },
        "tools": {
            "ffmpeg": { "program": "/opt/ffmpeg/bin/ffmpeg", "args": ["-nostdin"] }
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("VISION_CONFIG", file.path());
    std::env::set_var("VISION_TARGET_FPS", "30");
    std::env::set_var("VISION_DETECTOR_HOST", "10.0.0.5:8080");

    let cfg = Config::load().expect("load config");

    assert_eq!(cfg.active_source, SourceKind::Webcam);
    assert_eq!(cfg.target_fps, 30);
    assert_eq!((cfg.scaled_width, cfg.scaled_height), (800, 600));
    assert_eq!(cfg.local.path, "/srv/clips/street.mp4");
    assert_eq!(cfg.webcam.device_id, "/dev/video2");
    assert_eq!(cfg.detector.url(), "ws://10.0.0.5:8080/infer");
    assert_eq!(cfg.detector.reconnect_backoff, Duration::from_millis(500));
    assert_eq!(cfg.detector.connect_timeout, Duration::from_secs(3));
    assert_eq!(
        cfg.tools.ffmpeg.program(),
        std::path::Path::new("/opt/ffmpeg/bin/ffmpeg")
    );
    assert_eq!(cfg.tools.ffmpeg.leading_args(), ["-nostdin".to_string()]);
    assert_eq!(cfg.tools.ffprobe.program(), std::path::Path::new("ffprobe"));

    clear_env();
}

#[test]
fn loads_toml_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
active_source = "local"
target_fps = 10

[local]
path = "clip.mkv"

[detector]
host = "127.0.0.1:7000"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = Config::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.active_source, SourceKind::Local);
    assert_eq!(cfg.target_fps, 10);
    assert_eq!(cfg.local.path, "clip.mkv");
    assert_eq!(cfg.detector.url(), "ws://127.0.0.1:7000/ws");

    clear_env();
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = Config::load().expect("load config");
    assert_eq!(cfg.active_source, SourceKind::Local);
    assert_eq!(cfg.target_fps, 24);
    assert_eq!((cfg.scaled_width, cfg.scaled_height), (640, 640));
    assert_eq!(cfg.detector.url(), "ws://localhost:8080/ws");
}

#[test]
fn env_source_override_is_case_insensitive() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VISION_SOURCE", "webcam");
    std::env::set_var("VISION_WEBCAM_DEVICE", "Integrated Camera");
    let cfg = Config::load().expect("load config");
    assert_eq!(cfg.active_source, SourceKind::Webcam);
    assert_eq!(cfg.webcam.device_id, "Integrated Camera");

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VISION_TARGET_FPS", "fast");
    let err = Config::load().unwrap_err();
    assert!(err.to_string().contains("VISION_TARGET_FPS"));
    clear_env();

    std::env::set_var("VISION_WIDTH", "0");
    assert!(Config::load().is_err());
    clear_env();

    std::env::set_var("VISION_SOURCE", "rtsp");
    assert!(Config::load().is_err());
    clear_env();
}

#[test]
fn rejects_unreadable_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    let err = Config::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    let missing = Config::load_from(Some(std::path::Path::new("/nonexistent/relay.json")));
    assert!(missing.unwrap_err().to_string().contains("failed to read"));
}
