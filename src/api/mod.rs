use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post, put};
use std::sync::{Arc, RwLock};

pub mod handlers;
pub mod responses;

pub fn router(state: Arc<RwLock<AppState>>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::get_health))
        .route("/api/statistics", get(handlers::get_statistics))
        .route("/api/current-weather", get(handlers::get_current_weather))
        .route("/api/commands", post(handlers::post_command))
        .route("/api/doppler-url", put(handlers::put_doppler_url))
        .with_state(state)
}
