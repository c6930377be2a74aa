use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use uuid::Uuid;

use crate::error::{ConvertError, ConvertResult};

pub type JobId = Uuid;

/// An mp4 has no loop field, so repetitions are encoded as extra passes.
pub const MAX_MP4_PASSES: u32 = 16;

/// Ceilings on the work a single request may ask for. Every synthesized
/// frame is held in memory until encoding, so these bound a job's footprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub max_fps: u32,
    pub max_dimension: u32,
    /// Synthesized frames per job, before bounce and mp4 repetition.
    pub max_frames: usize,
    /// `frames * width * height` across the synthesized sequence.
    pub max_buffered_pixels: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_fps: 60,
            max_dimension: 4096,
            max_frames: 1800,
            max_buffered_pixels: 256 * 1024 * 1024,
        }
    }
}

impl Limits {
    /// Rejects a planned sequence that would not fit the frame or pixel budget.
    pub fn check_sequence(&self, frames: usize, (width, height): (u32, u32)) -> ConvertResult<()> {
        if frames > self.max_frames {
            return Err(ConvertError::validation(format!(
                "request needs {frames} frames, the limit is {}",
                self.max_frames
            )));
        }
        let pixels = (frames as u64)
            .saturating_mul(u64::from(width))
            .saturating_mul(u64::from(height));
        if pixels > self.max_buffered_pixels {
            return Err(ConvertError::validation(format!(
                "{frames} frames of {width}x{height} exceed the limit of {} buffered pixels",
                self.max_buffered_pixels
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Single,
    Images,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Pan {
    #[default]
    Diagonal,
    CenterOut,
    LeftToRight,
    Random,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    #[default]
    Gif,
    Mp4,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Gif => "gif",
            Format::Mp4 => "mp4",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Format::Gif => "image/gif",
            Format::Mp4 => "video/mp4",
        }
    }
}

/// Sub-interval of a source video, in seconds. A missing end means "to the end of the source".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(default)]
pub struct Trim {
    pub start: f64,
    pub end: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Params {
    pub mode: Mode,
    pub fps: u32,
    pub duration: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub zoom: f64,
    pub pan: Pan,
    pub trim: Trim,
    pub speed: f64,
    pub loops: u16,
    pub loop_forever: bool,
    pub bounce: bool,
    pub format: Format,
    pub max_seconds: f64,
    pub seed: Option<u64>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            mode: Mode::Single,
            fps: 15,
            duration: 3.0,
            width: None,
            height: None,
            zoom: 1.12,
            pan: Pan::Diagonal,
            trim: Trim::default(),
            speed: 1.0,
            loops: 0,
            loop_forever: false,
            bounce: false,
            format: Format::Gif,
            max_seconds: 12.0,
            seed: None,
        }
    }
}

fn positive(value: f64, name: &str) -> ConvertResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConvertError::validation(format!(
            "{name} must be a positive number, got {value}"
        )));
    }
    Ok(())
}

impl Params {
    /// Rejects malformed parameters and requests beyond `limits`. Runs
    /// before any job exists.
    pub fn validate(&self, limits: &Limits) -> ConvertResult<()> {
        if self.fps == 0 {
            return Err(ConvertError::validation("fps must be greater than zero"));
        }
        if self.fps > limits.max_fps {
            return Err(ConvertError::validation(format!(
                "fps must be at most {}, got {}",
                limits.max_fps, self.fps
            )));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(ConvertError::validation(
                "width and height must be greater than zero",
            ));
        }
        let too_large = |v: Option<u32>| v.is_some_and(|v| v > limits.max_dimension);
        if too_large(self.width) || too_large(self.height) {
            return Err(ConvertError::validation(format!(
                "width and height must be at most {}",
                limits.max_dimension
            )));
        }
        if !self.zoom.is_finite() || self.zoom < 1.0 {
            return Err(ConvertError::validation(format!(
                "zoom must be at least 1.0, got {}",
                self.zoom
            )));
        }
        positive(self.speed, "speed")?;
        positive(self.max_seconds, "max_seconds")?;

        match self.mode {
            Mode::Single => positive(self.duration, "duration")?,
            Mode::Video => {
                let Trim { start, end } = self.trim;
                if !start.is_finite() || start < 0.0 {
                    return Err(ConvertError::validation(format!(
                        "trim start must be non-negative, got {start}"
                    )));
                }
                if let Some(end) = end {
                    if !end.is_finite() || end <= start {
                        return Err(ConvertError::validation(format!(
                            "trim end ({end}) must be greater than trim start ({start})"
                        )));
                    }
                }
            }
            Mode::Images => {}
        }

        // the pipeline repeats this check once the real output size is known
        if let Some(frames) = self.frame_bound() {
            let size = (self.width.unwrap_or(1), self.height.unwrap_or(1));
            limits.check_sequence(frames, size)?;
        }

        // odd mp4 sizes are not rejected: the pipeline rounds them down to even
        if self.format == Format::Mp4
            && !self.loop_forever
            && u32::from(self.loops) + 1 > MAX_MP4_PASSES
        {
            return Err(ConvertError::validation(format!(
                "mp4 output supports at most {} loops",
                MAX_MP4_PASSES - 1
            )));
        }

        Ok(())
    }

    /// Most frames single-image or video synthesis can emit for these
    /// parameters; `None` for image sets, which emit one per input.
    pub fn frame_bound(&self) -> Option<usize> {
        let seconds = match self.mode {
            Mode::Single => self.capped_duration(),
            Mode::Video => {
                let window = self
                    .trim
                    .end
                    .map_or(self.max_seconds, |end| end - self.trim.start);
                window.min(self.max_seconds) / self.speed
            }
            Mode::Images => return None,
        };
        let frames = (seconds * f64::from(self.fps)).round();
        Some(if frames >= usize::MAX as f64 {
            usize::MAX
        } else {
            (frames as usize).max(1)
        })
    }

    pub fn validate_input_count(&self, count: usize, limits: &Limits) -> ConvertResult<()> {
        if self.mode == Mode::Images && count > limits.max_frames {
            return Err(ConvertError::validation(format!(
                "images mode takes at most {} inputs, got {count}",
                limits.max_frames
            )));
        }
        match self.mode {
            Mode::Single | Mode::Video if count != 1 => Err(ConvertError::validation(format!(
                "{:?} mode takes exactly one input, got {count}",
                self.mode
            ))),
            Mode::Images if count == 0 => {
                Err(ConvertError::validation("images mode needs at least one input"))
            }
            _ => Ok(()),
        }
    }

    /// Applies a server-side ceiling to `max_seconds`. Validate first: a NaN
    /// would otherwise be replaced by the ceiling.
    pub fn capped_to(mut self, ceiling: f64) -> Self {
        self.max_seconds = self.max_seconds.min(ceiling);
        self
    }

    /// Single-image output length after the `max_seconds` cap.
    pub fn capped_duration(&self) -> f64 {
        self.duration.min(self.max_seconds)
    }
}

/// Uploaded media for one conversion, stored in a scratch directory that is
/// removed when the inputs are dropped.
#[derive(Debug)]
pub struct Inputs {
    dir: TempDir,
    files: Vec<PathBuf>,
}

impl Inputs {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::Builder::new().prefix("upload_").tempdir()?,
            files: vec![],
        })
    }

    pub fn new_in(parent: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(parent)?;
        Ok(Self {
            dir: tempfile::Builder::new().prefix("upload_").tempdir_in(parent)?,
            files: vec![],
        })
    }

    /// Registers the next input slot and returns where its bytes belong.
    pub fn next_path(&mut self) -> PathBuf {
        let path = self.dir.path().join(format!("{:03}_input", self.files.len()));
        self.files.push(path.clone());
        path
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.next_path();
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn scratch_dir(&self) -> &Path {
        self.dir.path()
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Queued,
    Running,
    Done,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Error)
    }

    /// Only forward moves are legal: queued -> running -> {done, error}.
    /// A queued job may also fail directly.
    pub fn can_advance_to(self, next: State) -> bool {
        matches!(
            (self, next),
            (State::Queued, State::Running)
                | (State::Queued, State::Error)
                | (State::Running, State::Done)
                | (State::Running, State::Error)
        )
    }
}

/// Encoded result of a conversion.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub format: Format,
    pub bytes: Vec<u8>,
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Output(Arc<Artifact>),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub state: State,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<Instant>,
    pub params: Params,
    pub progress: f64,
    pub eta_seconds: Option<f64>,
    pub outcome: Option<Outcome>,
}

impl Job {
    pub fn new(id: JobId, params: Params) -> Self {
        Self {
            id,
            state: State::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            params,
            progress: 0.0,
            eta_seconds: None,
            outcome: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            state: self.state,
            progress: self.progress,
            eta: self.eta_seconds,
            error: match &self.outcome {
                Some(Outcome::Failed(message)) => Some(message.clone()),
                _ => None,
            },
            created_at: self.created_at,
            started_at: self.started_at,
        }
    }
}

/// Read-only view of a job returned to pollers.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub id: JobId,
    pub state: State,
    pub progress: f64,
    pub eta: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(start: f64, end: f64) -> Params {
        Params {
            mode: Mode::Video,
            trim: Trim {
                start,
                end: Some(end),
            },
            ..Params::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        Params::default().validate(&Limits::default()).unwrap();
    }

    #[test]
    fn reversed_trim_is_rejected() {
        let err = video(5.0, 3.0).validate(&Limits::default()).unwrap_err();
        assert!(matches!(err, ConvertError::Validation(_)));
        assert!(video(2.0, 7.0).validate(&Limits::default()).is_ok());
        assert!(video(2.0, 2.0).validate(&Limits::default()).is_err());
    }

    #[test]
    fn non_positive_geometry_is_rejected() {
        for params in [
            Params {
                fps: 0,
                ..Params::default()
            },
            Params {
                width: Some(0),
                ..Params::default()
            },
            Params {
                zoom: 0.9,
                ..Params::default()
            },
            Params {
                duration: 0.0,
                ..Params::default()
            },
            Params {
                speed: -1.0,
                ..Params::default()
            },
            Params {
                max_seconds: f64::NAN,
                ..Params::default()
            },
        ] {
            assert!(matches!(
                params.validate(&Limits::default()),
                Err(ConvertError::Validation(_))
            ));
        }
    }

    #[test]
    fn mp4_accepts_odd_sizes_but_bounds_loops() {
        let mut params = Params {
            format: Format::Mp4,
            width: Some(641),
            height: Some(361),
            ..Params::default()
        };
        assert!(params.validate(&Limits::default()).is_ok());
        params.loops = 15;
        assert!(params.validate(&Limits::default()).is_ok());
        params.loops = 16;
        assert!(params.validate(&Limits::default()).is_err());
        params.loop_forever = true;
        assert!(params.validate(&Limits::default()).is_ok());
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let limits = Limits::default();
        for params in [
            Params {
                fps: 2_000_000_000,
                ..Params::default()
            },
            Params {
                width: Some(1_000_000),
                height: Some(1_000_000),
                ..Params::default()
            },
            Params {
                duration: 1e300,
                max_seconds: 1e300,
                ..Params::default()
            },
            Params {
                mode: Mode::Video,
                speed: 1e-9,
                ..Params::default()
            },
            Params {
                width: Some(4096),
                height: Some(4096),
                duration: 10.0,
                max_seconds: 10.0,
                ..Params::default()
            },
        ] {
            assert!(matches!(
                params.validate(&limits),
                Err(ConvertError::Validation(_))
            ));
        }
    }

    #[test]
    fn frame_bound_follows_mode() {
        assert_eq!(Params::default().frame_bound(), Some(45));
        assert_eq!(video(2.0, 7.0).frame_bound(), Some(75));
        let capped = Params {
            max_seconds: 8.0,
            fps: 10,
            ..video(2.0, 7.0)
        };
        assert_eq!(capped.frame_bound(), Some(50));
        let images = Params {
            mode: Mode::Images,
            ..Params::default()
        };
        assert_eq!(images.frame_bound(), None);
        assert!(images
            .validate_input_count(1801, &Limits::default())
            .is_err());
    }

    #[test]
    fn sequence_budget_counts_pixels() {
        let limits = Limits {
            max_buffered_pixels: 1000,
            ..Limits::default()
        };
        assert!(limits.check_sequence(10, (10, 10)).is_ok());
        assert!(limits.check_sequence(11, (10, 10)).is_err());
        assert!(limits.check_sequence(1801, (1, 1)).is_err());
    }

    #[test]
    fn input_count_depends_on_mode() {
        let single = Params::default();
        assert!(single.validate_input_count(1, &Limits::default()).is_ok());
        assert!(single.validate_input_count(2, &Limits::default()).is_err());
        let images = Params {
            mode: Mode::Images,
            ..Params::default()
        };
        assert!(images.validate_input_count(0, &Limits::default()).is_err());
        assert!(images.validate_input_count(7, &Limits::default()).is_ok());
    }

    #[test]
    fn unknown_enum_values_fail_to_parse() {
        let err = serde_json::from_str::<Params>(r#"{"pan":"spiral"}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<Params>(r#"{"format":"webm"}"#);
        assert!(err.is_err());
        let ok: Params = serde_json::from_str(r#"{"pan":"left_to_right","format":"mp4"}"#).unwrap();
        assert_eq!(ok.pan, Pan::LeftToRight);
        assert_eq!(ok.format, Format::Mp4);
    }

    #[test]
    fn states_only_move_forward() {
        assert!(State::Queued.can_advance_to(State::Running));
        assert!(State::Running.can_advance_to(State::Done));
        assert!(!State::Done.can_advance_to(State::Running));
        assert!(!State::Error.can_advance_to(State::Done));
        assert!(!State::Running.can_advance_to(State::Queued));
    }

    #[test]
    fn inputs_are_numbered_and_removed_on_drop() {
        let mut inputs = Inputs::new().unwrap();
        let first = inputs.add_bytes(b"a").unwrap();
        let second = inputs.add_bytes(b"b").unwrap();
        assert!(first.ends_with("000_input"));
        assert!(second.ends_with("001_input"));
        let dir = inputs.scratch_dir().to_path_buf();
        drop(inputs);
        assert!(!dir.exists());
    }
}
