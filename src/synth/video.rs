//! Time-based resampling of a trimmed video segment.
//!
//! Output frames are placed uniformly over the trim window and each one is
//! filled with the nearest decoded source frame, so the output frame count
//! depends only on the window length, speed and target fps, never on the
//! source's native frame rate.

use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::command::Metadata;
use crate::error::{ConvertError, ConvertResult};
use crate::models::Trim;
use crate::synth::Frame;

/// Shortest segment worth decoding, in seconds.
pub const MIN_SEGMENT: f64 = 0.1;

/// Width used when the caller does not ask for one.
pub const DEFAULT_WIDTH: u32 = 640;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoPlan {
    pub start: f64,
    pub end: f64,
    pub frame_count: usize,
}

impl VideoPlan {
    /// Clamps `trim` to the source duration and `max_seconds`, then sizes the
    /// output for `fps` frames per second of playback at `speed`.
    pub fn new(
        trim: Trim,
        source_duration: f64,
        max_seconds: f64,
        fps: u32,
        speed: f64,
    ) -> ConvertResult<Self> {
        let start = trim.start;
        let end = trim
            .end
            .map_or(source_duration, |end| end.min(source_duration));
        if start >= end {
            return Err(ConvertError::unsupported(format!(
                "trim start {start}s is past the end of the {source_duration}s source"
            )));
        }

        let length = (end - start).min(max_seconds).max(MIN_SEGMENT);
        let playback = length / speed;
        let frame_count = ((playback * f64::from(fps)).round() as usize).max(1);

        Ok(Self {
            start,
            end: start + length,
            frame_count,
        })
    }

    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    /// Distance between consecutive sample points in source seconds.
    pub fn spacing(&self) -> f64 {
        self.length() / self.frame_count as f64
    }

    pub fn timestamps(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.frame_count).map(move |k| self.start + k as f64 * self.spacing())
    }

    /// Index, relative to `start`, of the decoded frame nearest each sample point.
    pub fn source_indices(&self, native_fps: f64) -> Vec<usize> {
        self.timestamps()
            .map(|t| nearest_index(t - self.start, native_fps))
            .collect()
    }
}

pub fn nearest_index(offset: f64, native_fps: f64) -> usize {
    (offset.max(0.0) * native_fps).round() as usize
}

/// Output size with the source aspect ratio preserved for whichever
/// dimension is missing. Derived dimensions are rounded to an even number.
pub fn output_size(meta: &Metadata, width: Option<u32>, height: Option<u32>) -> (u32, u32) {
    let aspect = f64::from(meta.width) / f64::from(meta.height);
    let even = |v: f64| ((v.round() as u32) & !1).max(2);
    match (width, height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, even(f64::from(w) / aspect)),
        (None, Some(h)) => (even(f64::from(h) * aspect), h),
        (None, None) => (DEFAULT_WIDTH, even(f64::from(DEFAULT_WIDTH) / aspect)),
    }
}

/// Streams resampled frames out of an `ffmpeg` rawvideo decode of the trim window.
pub struct VideoFrames {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    size: (u32, u32),
    targets: std::vec::IntoIter<usize>,
    decoded: usize,
    current: Option<Frame>,
    exhausted: bool,
}

impl VideoFrames {
    pub fn spawn(
        source: &Path,
        meta: &Metadata,
        plan: &VideoPlan,
        size: (u32, u32),
    ) -> ConvertResult<Self> {
        Self::spawn_with(Command::new("ffmpeg"), source, meta, plan, size)
    }

    /// Like [`VideoFrames::spawn`], with the decode arguments appended to
    /// `decoder` instead of a plain `ffmpeg` from PATH.
    pub fn spawn_with(
        mut decoder: Command,
        source: &Path,
        meta: &Metadata,
        plan: &VideoPlan,
        size: (u32, u32),
    ) -> ConvertResult<Self> {
        // assume 25 fps when ffprobe reported no rate
        let native_fps = if meta.fps > 0.0 { meta.fps } else { 25.0 };

        let mut child = decoder
            .args(["-v", "error", "-ss", &format!("{:.6}", plan.start)])
            .args(["-t", &format!("{:.6}", plan.length())])
            .arg("-i")
            .arg(source)
            .args([
                "-an",
                "-vf",
                &format!("scale={}:{}:flags=lanczos", size.0, size.1),
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ConvertError::encoding(format!(
                    "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConvertError::encoding("failed to open ffmpeg stdout"))?;

        // drained on its own thread so a chatty decoder never blocks on a full pipe
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = Vec::new();
                let _ = pipe.read_to_end(&mut text);
                String::from_utf8_lossy(&text).into_owned()
            })
        });

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            stderr,
            size,
            targets: plan.source_indices(native_fps).into_iter(),
            decoded: 0,
            current: None,
            exhausted: false,
        })
    }

    fn read_frame(&mut self) -> ConvertResult<Option<Frame>> {
        let (w, h) = self.size;
        let mut buf = vec![0u8; w as usize * h as usize * 4];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => Ok(Frame::from_raw(w, h, buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reaps the decoder once its output has ended. Only a clean exit means
    /// the stream was complete.
    fn finish(&mut self) -> ConvertResult<()> {
        let status = self.child.wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        warn!("ffmpeg decode exited with {status} after {} frames", self.decoded);
        Err(ConvertError::unsupported(format!(
            "ffmpeg failed to decode the video ({status}): {}",
            stderr.trim()
        )))
    }

    /// Advances the decoder until source frame `index` is current. Past the end
    /// of a cleanly finished stream the last decoded frame stays current.
    fn seek_to(&mut self, index: usize) -> ConvertResult<()> {
        while !self.exhausted && (self.current.is_none() || self.decoded <= index) {
            match self.read_frame()? {
                Some(frame) => {
                    self.current = Some(frame);
                    self.decoded += 1;
                }
                None => {
                    self.exhausted = true;
                    self.finish()?;
                }
            }
        }
        Ok(())
    }
}

impl Iterator for VideoFrames {
    type Item = ConvertResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.targets.next()?;
        let result = self.seek_to(index).and_then(|()| {
            self.current.clone().ok_or_else(|| {
                ConvertError::unsupported("ffmpeg decoded no video frames from the trim window")
            })
        });
        if result.is_err() {
            // nothing after a failure is trustworthy
            self.targets = Vec::new().into_iter();
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.targets.size_hint()
    }
}

impl Drop for VideoFrames {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.stderr.take() {
            let _ = reader.join();
        }
    }
}
