use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{ConvertError, ConvertResult};

pub fn run_command<I, S>(executable: &str, arguments: I, descriptor: &str) -> ConvertResult<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let output = Command::new(executable)
        .args(arguments)
        .output()
        .map_err(|e| ConvertError::encoding(format!("failed to run {descriptor}: {e}")))?;

    if !output.status.success() {
        let text = String::from_utf8_lossy(&output.stderr);
        return Err(ConvertError::encoding(format!(
            "{descriptor} failed\n\n{}",
            text.trim()
        )));
    }

    Ok(output)
}

/// True when `executable --version` (or `-version`) runs successfully.
pub fn tool_available(executable: &str, version_flag: &str) -> bool {
    Command::new(executable)
        .arg(version_flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn ffmpeg_available() -> bool {
    tool_available("ffmpeg", "-version")
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Metadata {
    pub width: u32,
    pub height: u32,
    /// Seconds.
    pub duration: f64,
    /// Native frame rate; 0.0 when ffprobe reported none.
    pub fps: f64,
}

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*Duration: (\d+):(\d\d):(\d\d(?:\.\d+)?),").expect("duration regex")
});

static RESOLUTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*Stream [^ ]+: Video: .*?, (\d{2,})x(\d{2,})").expect("resolution regex")
});

static FPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*Stream [^ ]+: Video: .*?(\d+(?:\.\d+)?) (?:fps|tbr)").expect("fps regex")
});

fn cap_f64(cap: &regex::Captures, i: usize) -> f64 {
    cap.get(i)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn cap_u32(cap: &regex::Captures, i: usize) -> u32 {
    cap.get(i)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .unwrap_or(0)
}

/// Parses the human-readable banner ffprobe writes to stderr.
pub fn parse_probe(text: &str) -> ConvertResult<Metadata> {
    let duration_cap = DURATION_RE
        .captures(text)
        .ok_or_else(|| ConvertError::unsupported("no duration found"))?;

    let duration = cap_f64(&duration_cap, 1) * 3600.0
        + cap_f64(&duration_cap, 2) * 60.0
        + cap_f64(&duration_cap, 3);

    let resolution_cap = RESOLUTION_RE
        .captures(text)
        .ok_or_else(|| ConvertError::unsupported("no video stream found"))?;

    let width = cap_u32(&resolution_cap, 1);
    let height = cap_u32(&resolution_cap, 2);
    if width == 0 || height == 0 {
        return Err(ConvertError::unsupported("video stream has no resolution"));
    }

    let fps = FPS_RE
        .captures(text)
        .map(|cap| cap_f64(&cap, 1))
        .unwrap_or(0.0);

    Ok(Metadata {
        width,
        height,
        duration,
        fps,
    })
}

pub fn probe(path: &Path) -> ConvertResult<Metadata> {
    let output = run_command("ffprobe", [path.as_os_str()], "ffprobe")
        .map_err(|e| ConvertError::unsupported(e.to_string()))?;

    let text = String::from_utf8_lossy(&output.stderr);

    tracing::debug!(path = %path.display(), "probe output: {}", text);

    parse_probe(&text)
}
