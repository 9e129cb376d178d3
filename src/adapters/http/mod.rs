//! HTTP session API.
//!
//! Each route maps onto one batch controller operation for the session named
//! in the path. Uploaded files are streamed to the staging directory and join
//! the batch as staged inputs.

use crate::adapters::local::board::{BoardMessage, MessageBoard};
use crate::application::controller::{BatchController, CancelOutcome, ParameterOutcome};
use crate::application::runner::JobExecutor;
use crate::domain::jobs::{Batch, InputRef, Job};
use crate::error::Error;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    BoxError, Json, Router,
};
use futures::{Stream, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io;
use std::path::{Component, PathBuf};
use std::sync::Arc;
use tokio::{fs::File, io::BufWriter};
use tokio_util::io::StreamReader;
use tracing::{info, warn};
use uuid::Uuid;

pub struct ApiState<E> {
    pub controller: Arc<BatchController<E, MessageBoard>>,
    pub board: Arc<MessageBoard>,
    /// Where uploads are written before they join a batch.
    pub staging_dir: PathBuf,
}

pub fn router<E: JobExecutor>(state: ApiState<E>) -> Router {
    Router::new()
        .route("/sessions/:session", get(batch_snapshot::<E>))
        .route("/sessions/:session/messages", get(messages::<E>))
        .route("/sessions/:session/batch", post(start_collecting::<E>))
        .route("/sessions/:session/jobs", post(add_job::<E>))
        .route("/sessions/:session/uploads", post(upload_inputs::<E>))
        .route("/sessions/:session/end", post(finish_collecting::<E>))
        .route("/sessions/:session/parameters", put(set_parameters::<E>))
        .route("/sessions/:session/start", post(start_batch::<E>))
        .route("/sessions/:session/nuke", post(cancel_batch::<E>))
        .layer(DefaultBodyLimit::disable())
        .with_state(Arc::new(state))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NoBatch(_) => StatusCode::NOT_FOUND,
            Error::InvalidState { .. } | Error::BatchBusy(_) => StatusCode::CONFLICT,
            Error::EmptyBatch => StatusCode::UNPROCESSABLE_ENTITY,
            Error::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type Shared<E> = State<Arc<ApiState<E>>>;

#[derive(Debug, Deserialize)]
struct AddJobRequest {
    input: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParametersRequest {
    parameters: String,
}

async fn batch_snapshot<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    state
        .controller
        .batch(&session)
        .map(Json)
        .ok_or_else(|| Error::NoBatch(session).into())
}

async fn messages<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
) -> Json<Vec<BoardMessage>> {
    Json(state.board.messages(&session))
}

async fn start_collecting<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let number = state.controller.start_collecting(&session)?;
    Ok((StatusCode::CREATED, Json(json!({ "number": number }))))
}

async fn add_job<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
    Json(request): Json<AddJobRequest>,
) -> Result<Json<Job>, ApiError> {
    if request.input.trim().is_empty() {
        return Err(ApiError::bad_request("input must not be empty"));
    }
    let job = state
        .controller
        .add_job(&session, InputRef::parse(&request.input), request.name)?;
    Ok(Json(job))
}

// Accepts a multipart form and streams each file field into its own staging directory.
async fn upload_inputs<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Vec<Job>>, ApiError> {
    let mut jobs = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let Some(file_name) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let relative = PathBuf::from(&file_name);
        if !path_is_valid(&relative) {
            return Err(ApiError::bad_request(format!("Invalid file name: {}", file_name)));
        }

        let dir = state.staging_dir.join(Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(Error::from)?;
        let path = dir.join(&relative);
        info!(session = %session, path = %path.display(), "Saving upload");
        if let Err(e) = stream_to_file(&path, field).await {
            remove_staging_dir(&dir).await;
            return Err(e);
        }

        match state
            .controller
            .add_job(&session, InputRef::Staged(path), Some(file_name))
        {
            Ok(job) => jobs.push(job),
            Err(e) => {
                remove_staging_dir(&dir).await;
                return Err(e.into());
            }
        }
    }

    Ok(Json(jobs))
}

async fn remove_staging_dir(dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(path = %dir.display(), error = %e, "Failed to remove staged upload");
    }
}

async fn finish_collecting<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let jobs = state.controller.finish_collecting(&session)?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn set_parameters<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
    Json(request): Json<ParametersRequest>,
) -> Result<Json<ParameterOutcome>, ApiError> {
    Ok(Json(
        state
            .controller
            .set_parameters(&session, &request.parameters)?,
    ))
}

async fn start_batch<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let jobs = state.controller.start_batch(&session).await?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn cancel_batch<E: JobExecutor>(
    State(state): Shared<E>,
    Path(session): Path<String>,
) -> Json<CancelOutcome> {
    Json(state.controller.cancel_batch(&session).await)
}

// Save a `Stream` to a file
async fn stream_to_file<S, E>(path: &std::path::Path, stream: S) -> Result<(), ApiError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    async {
        let body_with_io_error = stream.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        let body_reader = StreamReader::new(body_with_io_error);
        futures::pin_mut!(body_reader);

        let mut file = BufWriter::new(File::create(path).await?);
        tokio::io::copy(&mut body_reader, &mut file).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;

        Ok::<_, io::Error>(())
    }
    .await
    .map_err(|err| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: err.to_string(),
    })
}

/// An upload name must be a single plain file name.
fn path_is_valid(path: &std::path::Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
