use std::sync::Arc;

use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use tracing::{info, warn};

use crate::api::{
    AvatarStatus, AvatarsResponse, HealthResponse, StartRequest, StartResponse, StopRequest,
    StopResponse, TrainRequest, TrainResponse, UploadResponse,
};
use crate::avatar::UploadKind;
use crate::supervisor::{Platform, StopOutcome};

use super::AppState;
use super::error::ApiError;

pub async fn health<P: Platform>(State(state): State<Arc<AppState<P>>>) -> Json<HealthResponse> {
    Json(state.orchestrator.health())
}

pub async fn avatars<P: Platform>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<AvatarsResponse>, ApiError> {
    let avatars = state.orchestrator.avatars()?;
    Ok(Json(AvatarsResponse { avatars }))
}

pub async fn start<P: Platform>(
    State(state): State<Arc<AppState<P>>>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let started = state
        .orchestrator
        .start_avatar(&req.name, req.ref_file, req.ref_text)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            status: "running".to_string(),
            name: started.name,
            pid: started.pid,
            webrtc_url: started.webrtc_url,
        }),
    ))
}

pub async fn stop<P: Platform>(
    State(state): State<Arc<AppState<P>>>,
    Json(req): Json<StopRequest>,
) -> Result<Json<StopResponse>, ApiError> {
    let (name, outcome) = state.orchestrator.stop_avatar(&req.name).await?;
    let response = match outcome {
        StopOutcome::Stopped { pid } => StopResponse {
            status: "stopped".to_string(),
            name,
            pid: Some(pid),
        },
        StopOutcome::NotRunning => StopResponse {
            status: "not_running".to_string(),
            name,
            pid: None,
        },
    };
    Ok(Json(response))
}

pub async fn train<P: Platform>(
    State(state): State<Arc<AppState<P>>>,
    Json(req): Json<TrainRequest>,
) -> Result<(StatusCode, Json<TrainResponse>), ApiError> {
    let name = state.orchestrator.train_avatar(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TrainResponse {
            status: "training_started".to_string(),
            name,
        }),
    ))
}

pub async fn status<P: Platform>(
    State(state): State<Arc<AppState<P>>>,
    Path(name): Path<String>,
) -> Json<AvatarStatus> {
    Json(state.orchestrator.status(&name).await)
}

pub async fn remove_job<P: Platform>(
    State(state): State<Arc<AppState<P>>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = state.orchestrator.repository().canonical_id(&name);
    state.orchestrator.supervisor().remove_job(&id).await?;
    info!(name = %id, "job removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload<P: Platform>(
    State(state): State<Arc<AppState<P>>>,
    Path(kind): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let kind: UploadKind = kind.parse()?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(ToString::to_string)
            .ok_or_else(|| ApiError::BadRequest("file field has no filename".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;

        let blob = state.store.save(kind, &filename, &bytes).await.inspect_err(|err| {
            warn!(kind = %kind, filename = %filename, error = %err, "upload rejected");
        })?;
        return Ok(Json(UploadResponse {
            id: blob.id,
            path: blob.path,
        }));
    }

    Err(ApiError::BadRequest("missing multipart field `file`".to_string()))
}
