use crate::{
    coordinator::CoordinatorSnapshot,
    frame::StreamMode,
    scheduler::{SchedulerError, StreamSession},
    server::SharedState,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub mode: Option<StreamMode>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub session: StreamSession,
    pub detection: CoordinatorSnapshot,
}

pub async fn status(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        session: state.scheduler.session(),
        detection: state.coordinator.snapshot(),
    })
}

#[instrument(skip(state))]
pub async fn start_session(
    State(state): State<SharedState>,
    request: Option<Json<StartRequest>>,
) -> Result<Json<StreamSession>, SchedulerError> {
    let mode = request
        .and_then(|Json(request)| request.mode)
        .unwrap_or(state.scheduler.session().mode);
    state.scheduler.start(mode).await?;
    Ok(Json(state.scheduler.session()))
}

#[instrument(skip(state))]
pub async fn stop_session(State(state): State<SharedState>) -> Json<StreamSession> {
    state.scheduler.stop().await;
    Json(state.scheduler.session())
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = match self {
            SchedulerError::AlreadyRunning(_) => StatusCode::CONFLICT,
            SchedulerError::Connectivity(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}
