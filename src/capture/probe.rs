use serde::Deserialize;

use super::{CaptureError, ExternalTool};

/// Native size of a video stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: u32,
    height: u32,
}

/// Query the first video stream of `path` with `ffprobe`.
pub fn probe_dimensions(tool: &ExternalTool, path: &str) -> Result<VideoDimensions, CaptureError> {
    let probe_error = |reason: String| CaptureError::Probe {
        path: path.to_string(),
        reason,
    };

    let output = tool
        .command()
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "json",
            path,
        ])
        .output()
        .map_err(|e| probe_error(format!("cannot run {}: {}", tool.display_name(), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(probe_error(format!(
            "{} exited with {}: {}",
            tool.display_name(),
            output.status,
            stderr.trim()
        )));
    }

    parse_probe_output(&output.stdout).map_err(probe_error)
}

pub(crate) fn parse_probe_output(raw: &[u8]) -> Result<VideoDimensions, String> {
    let parsed: ProbeOutput =
        serde_json::from_slice(raw).map_err(|e| format!("unreadable probe output: {}", e))?;
    let stream = parsed
        .streams
        .first()
        .ok_or_else(|| "no video streams found".to_string())?;
    Ok(VideoDimensions {
        width: stream.width,
        height: stream.height,
    })
}
