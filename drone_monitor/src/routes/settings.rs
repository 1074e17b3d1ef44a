use crate::{
    server::SharedState,
    settings::{MonitorSettings, SettingsError, SettingsUpdate},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::instrument;

pub async fn get_settings(State(state): State<SharedState>) -> Json<MonitorSettings> {
    Json(state.coordinator.settings().snapshot())
}

#[instrument(skip(state))]
pub async fn update_settings(
    State(state): State<SharedState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<MonitorSettings>, SettingsError> {
    let settings = state.coordinator.apply_settings(update)?;
    tracing::info!("Settings updated: {:?}", settings);
    Ok(Json(settings))
}

impl IntoResponse for SettingsError {
    fn into_response(self) -> Response {
        (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()).into_response()
    }
}
