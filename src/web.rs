use std::sync::Arc;

use actix_web::{
    error, get, http::StatusCode, post, web, App, HttpMessage, HttpResponse, HttpServer, Result,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ConvertError, ConvertResult, ErrorKind};
use crate::models::{Inputs, JobStatus, Mode, Params};
use crate::pipeline::Pipeline;
use crate::processor::Scheduler;
use crate::progress::Discard;

/// Ken-Burns seed for synchronous requests that do not pass one.
pub const SYNC_SEED: u64 = 42;

pub struct AppState {
    scheduler: Arc<Scheduler>,
    pipeline: Arc<Pipeline>,
    config: Config,
}

impl AppState {
    pub fn new(config: Config, scheduler: Arc<Scheduler>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            scheduler,
            pipeline,
            config,
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    jobs: Vec<JobStatus>,
}

#[derive(Deserialize)]
struct SubmitParams {
    sources: Vec<String>,
    #[serde(default)]
    params: Params,
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorKind,
    description: String,
}

fn build_error_response(err: &ConvertError) -> HttpResponse {
    let status = match err.kind() {
        ErrorKind::InvalidParams => StatusCode::BAD_REQUEST,
        ErrorKind::UnsupportedInput => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NotReady => StatusCode::CONFLICT,
        ErrorKind::EncodingFailed | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };

    HttpResponse::build(status).json(ErrorResponse {
        error: err.kind(),
        description: err.to_string(),
    })
}

/// The inline path is for short conversions only.
fn check_sync(params: &Params, sources: usize, config: &Config) -> ConvertResult<()> {
    params.validate(&config.limits)?;
    params.validate_input_count(sources, &config.limits)?;
    match params.mode {
        Mode::Video => Err(ConvertError::validation(
            "video conversions run as queued jobs, submit them to /api/jobs",
        )),
        Mode::Images if sources > config.sync_max_images => Err(ConvertError::validation(format!(
            "at most {} images can be converted inline, submit larger sets to /api/jobs",
            config.sync_max_images
        ))),
        _ => Ok(()),
    }
}

#[get("/")]
async fn list_jobs(data: web::Data<AppState>) -> HttpResponse {
    let registry = data.scheduler.registry();

    registry.expire(data.config.expire_completed_jobs_after);

    HttpResponse::Ok().json(StatusResponse {
        jobs: registry.list(),
    })
}

#[get("/api/jobs/{id}")]
async fn job_status(data: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    match data.scheduler.registry().status(path.into_inner()) {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(err) => build_error_response(&err),
    }
}

#[get("/api/jobs/{id}/output")]
async fn job_output(data: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    let id = path.into_inner();
    match data.scheduler.registry().output(id) {
        Ok(artifact) => HttpResponse::Ok()
            .content_type(artifact.format.mime_type())
            .insert_header((
                "Content-Disposition",
                format!(
                    "attachment; filename=\"{id}.{}\"",
                    artifact.format.extension()
                ),
            ))
            .body(artifact.bytes.clone()),
        Err(err) => build_error_response(&err),
    }
}

#[post("/api/jobs")]
async fn submit(data: web::Data<AppState>, body: web::Json<SubmitParams>) -> Result<HttpResponse> {
    let SubmitParams { sources, params } = body.into_inner();

    let limits = &data.config.limits;
    if let Err(err) = params
        .validate(limits)
        .and_then(|_| params.validate_input_count(sources.len(), limits))
    {
        return Ok(build_error_response(&err));
    }
    let params = params.capped_to(data.config.maximum_output_seconds);

    let slot = match data.scheduler.reserve() {
        Ok(slot) => slot,
        Err(err) => {
            warn!("rejecting submission: {err}");
            return Ok(build_error_response(&err));
        }
    };

    let mut inputs = Inputs::new_in(&data.config.data_dir)?;
    if let Err(err) = fetch_inputs(&sources, &mut inputs, data.config.max_input_bytes).await {
        return Ok(build_error_response(&err));
    }

    match data.scheduler.submit_reserved(slot, params, inputs) {
        Ok(id) => Ok(HttpResponse::Accepted().json(SubmitResponse {
            job_id: id.to_string(),
        })),
        Err(err) => Ok(build_error_response(&err)),
    }
}

#[post("/api/generate")]
async fn generate(
    data: web::Data<AppState>,
    body: web::Json<SubmitParams>,
) -> Result<HttpResponse> {
    let SubmitParams { sources, params } = body.into_inner();

    if let Err(err) = check_sync(&params, sources.len(), &data.config) {
        return Ok(build_error_response(&err));
    }
    let params = params.capped_to(data.config.maximum_output_seconds);

    let mut inputs = Inputs::new_in(&data.config.data_dir)?;
    if let Err(err) = fetch_inputs(&sources, &mut inputs, data.config.max_input_bytes).await {
        return Ok(build_error_response(&err));
    }

    let pipeline = data.pipeline.clone();
    let seed = params.seed.unwrap_or(SYNC_SEED);
    let result = web::block(move || pipeline.run(&params, &inputs, seed, &mut Discard))
        .await
        .map_err(error::ErrorInternalServerError)?;

    match result {
        Ok(artifact) => {
            info!(frames = artifact.frame_count, "inline conversion complete");
            Ok(HttpResponse::Ok()
                .content_type(artifact.format.mime_type())
                .body(artifact.bytes))
        }
        Err(err) => Ok(build_error_response(&err)),
    }
}

async fn download(
    url: &str,
) -> ConvertResult<impl futures::stream::Stream<Item = Result<web::Bytes, error::PayloadError>>> {
    let mut res = awc::Client::default()
        .get(url)
        .send()
        .await
        .map_err(|e| ConvertError::unsupported(format!("GET {url} failed: {e}")))?;

    if !res.status().is_success() {
        return Err(ConvertError::unsupported(format!(
            "GET {url} returned {}",
            res.status()
        )));
    }

    Ok(res.take_payload())
}

/// Streams every source URL into the next input slot of `inputs`, giving up
/// once more than `max_bytes` have arrived in total.
async fn fetch_inputs(sources: &[String], inputs: &mut Inputs, max_bytes: u64) -> ConvertResult<()> {
    let mut received: u64 = 0;

    for url in sources {
        info!("downloading source URL {url}");

        let mut stream = download(url).await?;
        let path = inputs.next_path();
        let mut file = fs::File::create(&path).await?;

        while let Some(item) = stream.next().await {
            let chunk = item
                .map_err(|e| ConvertError::unsupported(format!("download of {url} failed: {e}")))?;

            received += chunk.len() as u64;
            if received > max_bytes {
                warn!("aborting download of {url}: inputs exceed {max_bytes} bytes");
                return Err(ConvertError::validation(format!(
                    "inputs exceed the limit of {max_bytes} bytes"
                )));
            }

            file.write_all(&chunk).await?;
        }

        file.flush().await?;
    }
    Ok(())
}

/// Registers every route plus a JSON error handler that reports malformed
/// parameters the same way as failed validation.
pub fn routes(cfg: &mut web::ServiceConfig) {
    let json = web::JsonConfig::default().error_handler(|err, _req| {
        let response = build_error_response(&ConvertError::validation(err.to_string()));
        error::InternalError::from_response(err, response).into()
    });

    cfg.app_data(json)
        .service(list_jobs)
        .service(job_status)
        .service(job_output)
        .service(submit)
        .service(generate);
}

pub async fn start_web_server(
    config: Config,
    scheduler: Arc<Scheduler>,
    pipeline: Arc<Pipeline>,
) -> std::io::Result<()> {
    let port = config.port;
    let app_state = web::Data::new(AppState::new(config, scheduler, pipeline));

    info!("Starting web server at 0.0.0.0:{port}...");

    HttpServer::new(move || App::new().app_data(app_state.clone()).configure(routes))
        .bind(("0.0.0.0", port))?
        .run()
        .await
}
