use std::ffi::OsStr;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::command::{run_command, tool_available};
use crate::error::{ConvertError, ConvertResult};
use crate::models::Format;
use crate::postprocess::LoopMeta;
use crate::progress::ProgressTracker;
use crate::synth::Frame;

#[derive(Clone, Debug, PartialEq)]
pub struct EncodeSpec {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub loop_meta: LoopMeta,
}

impl EncodeSpec {
    pub fn validate(&self) -> ConvertResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ConvertError::validation(
                "encode width/height must be non-zero",
            ));
        }
        if self.fps == 0 {
            return Err(ConvertError::validation("encode fps must be non-zero"));
        }
        if self.format == Format::Mp4 && (self.width % 2 == 1 || self.height % 2 == 1) {
            return Err(ConvertError::validation(
                "encode width/height must be even (required for yuv420p mp4 output)",
            ));
        }
        Ok(())
    }
}

/// Turns an ordered frame stream into container bytes. The encoder ticks
/// `progress` once per frame it consumes.
pub trait Encoder: Send + Sync {
    fn encode(
        &self,
        spec: &EncodeSpec,
        frames: &mut dyn Iterator<Item = &Frame>,
        progress: &mut ProgressTracker<'_>,
    ) -> ConvertResult<Vec<u8>>;
}

/// Pipes raw RGBA frames into the system `ffmpeg` binary.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder {
    /// Run `gifsicle --optimize=3` over finished gifs when it is installed.
    pub optimize_gifs: bool,
}

impl FfmpegEncoder {
    pub fn new(optimize_gifs: bool) -> Self {
        Self { optimize_gifs }
    }

    fn command(spec: &EncodeSpec, out_path: &Path) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        cmd.args([
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
            &format!("{}x{}", spec.width, spec.height),
            "-r",
            &spec.fps.to_string(),
            "-i",
            "pipe:0",
            "-an",
        ]);

        match spec.format {
            Format::Gif => {
                cmd.args([
                    "-filter_complex",
                    "[0:v]split[a][b];[a]palettegen[p];[b][p]paletteuse",
                    "-loop",
                    &spec.loop_meta.gif_field().to_string(),
                ]);
            }
            Format::Mp4 => {
                cmd.args([
                    "-c:v",
                    "libx264",
                    "-preset",
                    "veryfast",
                    "-crf",
                    "23",
                    "-pix_fmt",
                    "yuv420p",
                    "-movflags",
                    "+faststart",
                ]);
            }
        }

        cmd.arg(out_path);
        cmd
    }

    /// Best effort: a missing or failing gifsicle leaves the gif untouched.
    fn optimize_gif(&self, path: &Path) {
        if !tool_available("gifsicle", "--version") {
            debug!("gifsicle not available, skipping gif optimisation");
            return;
        }
        let optimized = path.with_extension("opt.gif");
        let result = run_command(
            "gifsicle",
            [
                OsStr::new("--optimize=3"),
                path.as_os_str(),
                OsStr::new("-o"),
                optimized.as_os_str(),
            ],
            "gifsicle",
        )
        .and_then(|_| std::fs::rename(&optimized, path).map_err(ConvertError::from));

        if let Err(err) = result {
            warn!("gif optimisation failed, keeping unoptimised output: {err}");
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(
        &self,
        spec: &EncodeSpec,
        frames: &mut dyn Iterator<Item = &Frame>,
        progress: &mut ProgressTracker<'_>,
    ) -> ConvertResult<Vec<u8>> {
        spec.validate()?;

        let dir = tempfile::Builder::new().prefix("encode_").tempdir()?;
        let out_path = dir.path().join(format!("result.{}", spec.format.extension()));

        let mut child = Self::command(spec, &out_path).spawn().map_err(|e| {
            ConvertError::encoding(format!(
                "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConvertError::encoding("failed to open ffmpeg stdin"))?;

        let mut write_error = None;
        for frame in frames {
            if frame.dimensions() != (spec.width, spec.height) {
                write_error = Some(ConvertError::validation(format!(
                    "frame size mismatch: got {}x{}, expected {}x{}",
                    frame.width(),
                    frame.height(),
                    spec.width,
                    spec.height
                )));
                break;
            }
            if let Err(e) = stdin.write_all(frame.as_raw()) {
                write_error = Some(ConvertError::encoding(format!(
                    "failed to write frame to ffmpeg stdin: {e}"
                )));
                break;
            }
            progress.tick();
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .map_err(|e| ConvertError::encoding(format!("failed to wait for ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConvertError::encoding(format!(
                "ffmpeg exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if let Some(err) = write_error {
            return Err(err);
        }

        if spec.format == Format::Gif && self.optimize_gifs {
            self.optimize_gif(&out_path);
        }

        Ok(std::fs::read(&out_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(format: Format, width: u32, height: u32) -> EncodeSpec {
        EncodeSpec {
            format,
            width,
            height,
            fps: 10,
            loop_meta: LoopMeta::Infinite,
        }
    }

    #[test]
    fn mp4_rejects_odd_dimensions() {
        assert!(spec(Format::Mp4, 641, 360).validate().is_err());
        assert!(spec(Format::Gif, 641, 360).validate().is_ok());
        assert!(spec(Format::Gif, 0, 360).validate().is_err());
    }

    #[test]
    fn gif_command_carries_loop_field() {
        let mut s = spec(Format::Gif, 64, 36);
        s.loop_meta = LoopMeta::Count(3);
        let cmd = FfmpegEncoder::command(&s, Path::new("/tmp/out.gif"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let pos = args.iter().position(|a| a == "-loop").unwrap();
        assert_eq!(args[pos + 1], "3");
        assert!(args.iter().any(|a| a.contains("paletteuse")));

        s.loop_meta = LoopMeta::Infinite;
        let cmd = FfmpegEncoder::command(&s, Path::new("/tmp/out.gif"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let pos = args.iter().position(|a| a == "-loop").unwrap();
        assert_eq!(args[pos + 1], "0");
    }

    #[test]
    fn mp4_command_has_no_loop_field() {
        let cmd = FfmpegEncoder::command(&spec(Format::Mp4, 64, 36), Path::new("/tmp/out.mp4"));
        assert!(!cmd.get_args().any(|a| a == "-loop"));
        assert!(cmd.get_args().any(|a| a == "libx264"));
    }
}
