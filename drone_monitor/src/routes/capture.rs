use crate::{coordinator::ManualCaptureError, detection::DetectionResult, server::SharedState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::instrument;

#[instrument(skip(state))]
pub async fn capture_now(
    State(state): State<SharedState>,
) -> Result<Json<DetectionResult>, ManualCaptureError> {
    let result = state.coordinator.capture_now().await?;
    Ok(Json(result))
}

impl IntoResponse for ManualCaptureError {
    fn into_response(self) -> Response {
        let status = match self {
            ManualCaptureError::NotStreaming
            | ManualCaptureError::NoFrame
            | ManualCaptureError::SessionEnded => StatusCode::SERVICE_UNAVAILABLE,
            ManualCaptureError::Busy => StatusCode::CONFLICT,
            ManualCaptureError::Classification(_) => StatusCode::BAD_GATEWAY,
            ManualCaptureError::Capture(_) | ManualCaptureError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}
