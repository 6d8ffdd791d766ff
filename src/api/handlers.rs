use crate::api::responses::{
    CommandAcceptedResponse, DopplerUrlRequest, DopplerUrlResponse, ErrorCode, ErrorResponse,
    HealthStatus, HealthSuccessResponse, StatisticsResponse,
};
use crate::command::OperatorCommand;
use crate::doppler::fetch::validate_url;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

type SharedState = Arc<RwLock<AppState>>;

pub enum ApiResponse<T> {
    Success { status: StatusCode, body: T },
    Error { status: StatusCode, body: ErrorResponse },
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Success { status, body } => (status, Json(body)).into_response(),
            ApiResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

/// The raw payload is returned exactly as the station sent it.
pub enum CurrentWeatherResponse {
    Payload(Arc<str>),
    Error { status: StatusCode, body: ErrorResponse },
}

impl IntoResponse for CurrentWeatherResponse {
    fn into_response(self) -> Response {
        match self {
            CurrentWeatherResponse::Payload(payload) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                payload.to_string(),
            )
                .into_response(),
            CurrentWeatherResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn get_health(State(state): State<SharedState>) -> impl IntoResponse {
    build_health_response(state, SystemTime::now())
}

pub async fn get_statistics(State(state): State<SharedState>) -> impl IntoResponse {
    build_statistics_response(state, SystemTime::now())
}

pub async fn get_current_weather(State(state): State<SharedState>) -> impl IntoResponse {
    build_current_weather_response(state, SystemTime::now())
}

pub async fn post_command(State(state): State<SharedState>, body: String) -> impl IntoResponse {
    build_command_response(state, &body, SystemTime::now())
}

pub async fn put_doppler_url(
    State(state): State<SharedState>,
    Json(request): Json<DopplerUrlRequest>,
) -> impl IntoResponse {
    build_doppler_url_response(state, request, SystemTime::now())
}

fn format_timestamp(timestamp: SystemTime) -> String {
    OffsetDateTime::from(timestamp)
        .format(&Rfc3339)
        .unwrap_or_else(|err| {
            error!(error = %err, "Failed to format response timestamp");
            "1970-01-01T00:00:00Z".to_string()
        })
}

fn error_body(code: ErrorCode, message: impl Into<String>, now: SystemTime) -> ErrorResponse {
    ErrorResponse {
        error_code: code,
        error_message: message.into(),
        timestamp: format_timestamp(now),
    }
}

fn internal_error<T>(message: &str, route: &str, now: SystemTime) -> ApiResponse<T> {
    error!(message = message, route = route, "Internal error while handling request");
    ApiResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: error_body(ErrorCode::InternalError, INTERNAL_ERROR_MESSAGE, now),
    }
}

fn build_health_response(state: SharedState, now: SystemTime) -> ApiResponse<HealthSuccessResponse> {
    let (accepting, statistics) = match state.read() {
        Ok(guard) => (guard.engine().is_accepting(), guard.engine().statistics()),
        Err(_) => return internal_error("state lock poisoned", "/api/health", now),
    };

    let status = if !accepting {
        HealthStatus::Ko
    } else if statistics.missing_data_count > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    };
    let status_code = match status {
        HealthStatus::Ko => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
    };

    ApiResponse::Success {
        status: status_code,
        body: HealthSuccessResponse {
            status,
            accepting_commands: accepting,
            timestamp: format_timestamp(now),
        },
    }
}

fn build_statistics_response(state: SharedState, now: SystemTime) -> ApiResponse<StatisticsResponse> {
    let statistics = match state.read() {
        Ok(guard) => guard.engine().statistics(),
        Err(_) => return internal_error("state lock poisoned", "/api/statistics", now),
    };
    ApiResponse::Success {
        status: StatusCode::OK,
        body: StatisticsResponse {
            statistics,
            timestamp: format_timestamp(now),
        },
    }
}

fn build_current_weather_response(state: SharedState, now: SystemTime) -> CurrentWeatherResponse {
    let latest = match state.read() {
        Ok(guard) => guard.live_weather().map(|live| Arc::clone(&live.payload)),
        Err(_) => {
            error!(route = "/api/current-weather", "State lock poisoned");
            return CurrentWeatherResponse::Error {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: error_body(ErrorCode::InternalError, INTERNAL_ERROR_MESSAGE, now),
            };
        }
    };
    match latest {
        Some(payload) => CurrentWeatherResponse::Payload(payload),
        None => CurrentWeatherResponse::Error {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: error_body(ErrorCode::NoData, "No current weather received yet", now),
        },
    }
}

fn build_command_response(
    state: SharedState,
    line: &str,
    now: SystemTime,
) -> ApiResponse<CommandAcceptedResponse> {
    let command = match OperatorCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            warn!(command = line.trim(), error = %err, "Rejecting operator command");
            return ApiResponse::Error {
                status: StatusCode::BAD_REQUEST,
                body: error_body(ErrorCode::InvalidCommand, err.to_string(), now),
            };
        }
    };
    let engine = match state.read() {
        Ok(guard) => guard.engine().clone(),
        Err(_) => return internal_error("state lock poisoned", "/api/commands", now),
    };
    if let Err(err) = command.submit(&engine) {
        return ApiResponse::Error {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: error_body(ErrorCode::EngineClosed, err.to_string(), now),
        };
    }
    info!(command = line.trim(), "Operator command accepted");
    ApiResponse::Success {
        status: StatusCode::ACCEPTED,
        body: CommandAcceptedResponse {
            command: line.trim().to_string(),
            timestamp: format_timestamp(now),
        },
    }
}

fn build_doppler_url_response(
    state: SharedState,
    request: DopplerUrlRequest,
    now: SystemTime,
) -> ApiResponse<DopplerUrlResponse> {
    let url = request
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    if let Some(url) = url.as_deref()
        && let Err(err) = validate_url(url)
    {
        return ApiResponse::Error {
            status: StatusCode::BAD_REQUEST,
            body: error_body(ErrorCode::InvalidUrl, err.to_string(), now),
        };
    }

    match state.write() {
        Ok(mut guard) => guard.set_doppler_url(url.clone()),
        Err(_) => return internal_error("state lock poisoned", "/api/doppler-url", now),
    }
    info!(url = ?url, "Doppler url updated");
    ApiResponse::Success {
        status: StatusCode::OK,
        body: DopplerUrlResponse {
            url,
            timestamp: format_timestamp(now),
        },
    }
}
