use std::sync::Arc;

use gifforge::command::ffmpeg_available;
use gifforge::encode::FfmpegEncoder;
use gifforge::web::start_web_server;
use gifforge::{Config, JobRegistry, Pipeline, Scheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)?;

    if !ffmpeg_available() {
        warn!("ffmpeg was not found on PATH, every conversion will fail");
    }

    let pipeline = Arc::new(
        Pipeline::new(
            Arc::new(FfmpegEncoder::new(config.optimize_gifs)),
            config.progress_interval,
        )
        .with_limits(config.limits),
    );
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(JobRegistry::new()),
        pipeline.clone(),
        config.workers,
        config.queue_depth,
    )?);

    info!(
        workers = config.workers,
        queue_depth = config.queue_depth,
        "conversion pool ready"
    );

    start_web_server(config, scheduler, pipeline).await
}
