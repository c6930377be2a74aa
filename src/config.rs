use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::models::Limits;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Parent directory for per-request upload scratch space.
    pub data_dir: PathBuf,
    pub workers: usize,
    pub queue_depth: usize,
    pub expire_completed_jobs_after: Duration,
    /// Server-side ceiling applied to every request's `max_seconds`.
    pub maximum_output_seconds: f64,
    pub progress_interval: Duration,
    /// Largest image set the synchronous endpoint will convert inline.
    pub sync_max_images: usize,
    pub optimize_gifs: bool,
    /// Total bytes one request may download across all of its sources.
    pub max_input_bytes: u64,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3600,
            data_dir: PathBuf::from("data"),
            workers: 2,
            queue_depth: 8,
            expire_completed_jobs_after: Duration::from_secs(60 * 60),
            maximum_output_seconds: 30.0,
            progress_interval: Duration::from_millis(100),
            sync_max_images: 50,
            optimize_gifs: true,
            max_input_bytes: 200 * 1024 * 1024,
            limits: Limits::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring invalid value {raw:?} for {name}");
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: parse_var("GIFFORGE_PORT")
                .or_else(|| parse_var("PORT"))
                .unwrap_or(defaults.port),
            data_dir: env::var("GIFFORGE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            workers: parse_var::<usize>("GIFFORGE_WORKERS")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.workers),
            queue_depth: parse_var("GIFFORGE_QUEUE_DEPTH").unwrap_or(defaults.queue_depth),
            expire_completed_jobs_after: parse_var("GIFFORGE_EXPIRE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.expire_completed_jobs_after),
            maximum_output_seconds: parse_var::<f64>("GIFFORGE_MAX_SECONDS")
                .filter(|s| s.is_finite() && *s > 0.0)
                .unwrap_or(defaults.maximum_output_seconds),
            progress_interval: parse_var("GIFFORGE_PROGRESS_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.progress_interval),
            sync_max_images: parse_var("GIFFORGE_SYNC_MAX_IMAGES")
                .unwrap_or(defaults.sync_max_images),
            optimize_gifs: parse_var("GIFFORGE_GIFSICLE").unwrap_or(defaults.optimize_gifs),
            max_input_bytes: parse_var("GIFFORGE_MAX_INPUT_BYTES")
                .unwrap_or(defaults.max_input_bytes),
            limits: Limits {
                max_fps: parse_var::<u32>("GIFFORGE_MAX_FPS")
                    .filter(|&n| n > 0)
                    .unwrap_or(defaults.limits.max_fps),
                max_dimension: parse_var::<u32>("GIFFORGE_MAX_DIMENSION")
                    .filter(|&n| n > 0)
                    .unwrap_or(defaults.limits.max_dimension),
                max_frames: parse_var::<usize>("GIFFORGE_MAX_FRAMES")
                    .filter(|&n| n > 0)
                    .unwrap_or(defaults.limits.max_frames),
                max_buffered_pixels: parse_var("GIFFORGE_MAX_BUFFERED_PIXELS")
                    .unwrap_or(defaults.limits.max_buffered_pixels),
            },
        }
    }
}
