//! Ken-Burns pan/zoom over a single still image.
//!
//! A crop window with the output aspect ratio shrinks from the largest
//! window that fits the source (scale 1.0) down to `1 / zoom` of it while its
//! position follows a pan path. Positions are expressed as fractions of the
//! feasible range (0 = window touching the left/top edge, 1 = touching the
//! right/bottom edge), so the window can never leave the source.
//!
//! Unless disabled, every frame also gets a seeded wobble: a sub-pixel shift
//! of the window, a slight rotation swaying with a sine over the clip, and
//! small brightness and contrast changes.

use std::f64::consts::TAU;

use image::imageops::{self, FilterType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ease::Ease;
use crate::error::ConvertResult;
use crate::models::Pan;
use crate::synth::Frame;

/// Jitter never moves the window by more than this many source pixels.
pub const MAX_JITTER_PX: f64 = 1.5;

/// Jitter is also limited to this fraction of the crop width.
const JITTER_FRACTION: f64 = 0.002;

/// Rotation amplitude in degrees. Half of it follows a sine over the clip,
/// up to 0.3 of it is random per frame.
pub const JITTER_DEGREES: f64 = 0.8;

/// Brightness and contrast factors stay within `1 ± COLOR_JITTER`.
pub const COLOR_JITTER: f64 = 0.03;

const RANDOM_WAYPOINTS: usize = 3;

/// Crop rectangle in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropWindow {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropWindow {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Per-frame deviation from the smooth path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wobble {
    /// Window offset in source pixels.
    pub offset: (f64, f64),
    pub angle_deg: f64,
    pub brightness: f64,
    pub contrast: f64,
}

impl Wobble {
    pub const NONE: Wobble = Wobble {
        offset: (0.0, 0.0),
        angle_deg: 0.0,
        brightness: 1.0,
        contrast: 1.0,
    };
}

#[derive(Debug, Clone)]
pub struct KenBurns {
    source: (u32, u32),
    output: (u32, u32),
    zoom: f64,
    frames: usize,
    ease: Ease,
    waypoints: Vec<(f64, f64)>,
    jitter: bool,
    seed: u64,
}

/// `round(duration * fps)`, never less than one frame.
pub fn frame_count(duration: f64, fps: u32) -> usize {
    ((duration * f64::from(fps)).round() as usize).max(1)
}

fn waypoints(pan: Pan, seed: u64) -> Vec<(f64, f64)> {
    match pan {
        Pan::Diagonal => vec![(0.0, 0.0), (1.0, 1.0)],
        Pan::CenterOut => vec![(0.5, 0.5)],
        Pan::LeftToRight => vec![(0.0, 0.5), (1.0, 0.5)],
        Pan::Random => {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..RANDOM_WAYPOINTS)
                .map(|_| (rng.random_range(0.1..=0.9), rng.random_range(0.1..=0.9)))
                .collect()
        }
    }
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

impl KenBurns {
    pub fn new(
        source: (u32, u32),
        output: (u32, u32),
        duration: f64,
        fps: u32,
        zoom: f64,
        pan: Pan,
        seed: u64,
    ) -> Self {
        Self {
            source,
            output,
            zoom,
            frames: frame_count(duration, fps),
            ease: Ease::default(),
            waypoints: waypoints(pan, seed),
            jitter: true,
            seed,
        }
    }

    pub fn with_ease(mut self, ease: Ease) -> Self {
        self.ease = ease;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output
    }

    /// Normalized time of frame `index`: `index / max(N - 1, 1)`.
    pub fn t(&self, index: usize) -> f64 {
        index as f64 / (self.frames.saturating_sub(1).max(1)) as f64
    }

    pub fn scale(&self, t: f64) -> f64 {
        1.0 + (self.zoom - 1.0) * self.ease.apply(t)
    }

    fn base_window(&self) -> (f64, f64) {
        let (sw, sh) = (f64::from(self.source.0), f64::from(self.source.1));
        let aspect = f64::from(self.output.0) / f64::from(self.output.1);
        if sw / sh > aspect {
            (sh * aspect, sh)
        } else {
            (sw, sw / aspect)
        }
    }

    fn path_position(&self, t: f64) -> (f64, f64) {
        let e = self.ease.apply(t);
        match self.waypoints.as_slice() {
            [] => (0.5, 0.5),
            [only] => *only,
            points => {
                let segments = (points.len() - 1) as f64;
                let pos = e * segments;
                let seg = (pos.floor() as usize).min(points.len() - 2);
                let local = pos - seg as f64;
                let (a, b) = (points[seg], points[seg + 1]);
                (lerp(a.0, b.0, local), lerp(a.1, b.1, local))
            }
        }
    }

    /// Crop window of frame `index`, offset by `jitter` source pixels and
    /// clamped to the source bounds.
    pub fn window(&self, index: usize, jitter: (f64, f64)) -> CropWindow {
        let (sw, sh) = (f64::from(self.source.0), f64::from(self.source.1));
        let t = self.t(index);
        let scale = self.scale(t);
        let (base_w, base_h) = self.base_window();
        let width = (base_w / scale).clamp(1.0, sw);
        let height = (base_h / scale).clamp(1.0, sh);

        let (u, v) = self.path_position(t);
        let x = (u * (sw - width) + jitter.0).clamp(0.0, sw - width);
        let y = (v * (sh - height) + jitter.1).clamp(0.0, sh - height);

        CropWindow {
            x,
            y,
            width,
            height,
        }
    }

    fn jitter_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ 0x9e37_79b9_7f4a_7c15)
    }

    /// Draws frame `index`'s wobble. Draw order is fixed so a seed always
    /// produces the same sequence.
    fn draw_wobble(&self, index: usize, rng: &mut StdRng) -> Wobble {
        if !self.jitter {
            return Wobble::NONE;
        }
        let t = self.t(index);
        let (base_w, _) = self.base_window();
        let amplitude = (base_w / self.scale(t) * JITTER_FRACTION).min(MAX_JITTER_PX);
        let offset = (
            rng.random_range(-1.0..=1.0) * amplitude,
            rng.random_range(-1.0..=1.0) * amplitude,
        );
        let sway = (TAU * t).sin() * JITTER_DEGREES * 0.5;
        let angle_deg = sway + rng.random_range(-JITTER_DEGREES..=JITTER_DEGREES) * 0.3;
        Wobble {
            offset,
            angle_deg,
            brightness: 1.0 + rng.random_range(-COLOR_JITTER..=COLOR_JITTER),
            contrast: 1.0 + rng.random_range(-COLOR_JITTER..=COLOR_JITTER),
        }
    }

    /// Every frame's wobble in order, as the rendered frames get them.
    pub fn wobbles(&self) -> Vec<Wobble> {
        let mut rng = self.jitter_rng();
        (0..self.frames)
            .map(|i| self.draw_wobble(i, &mut rng))
            .collect()
    }

    /// Every crop window in order, with the same jitter the rendered frames get.
    pub fn windows(&self) -> Vec<CropWindow> {
        self.wobbles()
            .into_iter()
            .enumerate()
            .map(|(i, wobble)| self.window(i, wobble.offset))
            .collect()
    }

    pub fn render(self, image: image::RgbaImage) -> KenBurnsFrames {
        KenBurnsFrames {
            rng: self.jitter_rng(),
            plan: self,
            image,
            index: 0,
        }
    }
}

/// One-shot stream of rendered Ken-Burns frames.
pub struct KenBurnsFrames {
    plan: KenBurns,
    image: image::RgbaImage,
    rng: StdRng,
    index: usize,
}

/// Rotates `frame` by `degrees` around its center, sampling bilinearly.
/// Corners that would come from outside the frame repeat its edge pixels.
fn rotate(frame: &Frame, degrees: f64) -> Frame {
    if degrees == 0.0 {
        return frame.clone();
    }
    let (w, h) = frame.dimensions();
    let (max_x, max_y) = ((w - 1) as f32, (h - 1) as f32);
    let (cx, cy) = (max_x / 2.0, max_y / 2.0);
    let (sin, cos) = (degrees.to_radians() as f32).sin_cos();
    Frame::from_fn(w, h, |x, y| {
        let (dx, dy) = (x as f32 - cx, y as f32 - cy);
        let sx = (cos * dx + sin * dy + cx).clamp(0.0, max_x);
        let sy = (cos * dy - sin * dx + cy).clamp(0.0, max_y);
        imageops::interpolate_bilinear(frame, sx, sy).unwrap_or(*frame.get_pixel(x, y))
    })
}

/// Scales contrast around mid-grey, then brightness. Alpha is left alone.
fn adjust_color(frame: &mut Frame, brightness: f64, contrast: f64) {
    if brightness == 1.0 && contrast == 1.0 {
        return;
    }
    let lut: Vec<u8> = (0..=255u8)
        .map(|v| {
            let c = (f64::from(v) / 255.0 - 0.5) * contrast + 0.5;
            (c * brightness * 255.0).round().clamp(0.0, 255.0) as u8
        })
        .collect();
    for pixel in frame.pixels_mut() {
        for channel in &mut pixel.0[..3] {
            *channel = lut[usize::from(*channel)];
        }
    }
}

impl KenBurnsFrames {
    fn render_window(&self, window: CropWindow, wobble: Wobble) -> Frame {
        let (sw, sh) = self.image.dimensions();
        let x = (window.x.round() as u32).min(sw - 1);
        let y = (window.y.round() as u32).min(sh - 1);
        let w = (window.width.round() as u32).clamp(1, sw - x);
        let h = (window.height.round() as u32).clamp(1, sh - y);
        let crop = imageops::crop_imm(&self.image, x, y, w, h).to_image();
        let (ow, oh) = self.plan.output;
        let mut frame = rotate(&imageops::resize(&crop, ow, oh, FilterType::Lanczos3), wobble.angle_deg);
        adjust_color(&mut frame, wobble.brightness, wobble.contrast);
        frame
    }
}

impl Iterator for KenBurnsFrames {
    type Item = ConvertResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.plan.frames {
            return None;
        }
        let wobble = self.plan.draw_wobble(self.index, &mut self.rng);
        let window = self.plan.window(self.index, wobble.offset);
        self.index += 1;
        Some(Ok(self.render_window(window, wobble)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.plan.frames - self.index;
        (left, Some(left))
    }
}
