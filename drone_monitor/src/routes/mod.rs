mod capture;
mod events;
mod health;
mod metrics;
mod session;
mod settings;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/status", get(session::status))
        .route("/session/start", post(session::start_session))
        .route("/session/stop", post(session::stop_session))
        .route("/capture", post(capture::capture_now))
        .route(
            "/settings",
            get(settings::get_settings).put(settings::update_settings),
        )
        .route("/events", get(events::event_stream))
}
