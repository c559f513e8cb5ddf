//! HTTP API over the store and the ingestion coordinator.
//!
//! Calls take the driver's upstream access token from the
//! `Authorization: Bearer` header. Routes under `/drivers/{driver_id}` only
//! serve the driver the token belongs to. A token the upstream rejects is
//! answered with 401 so the client re-authenticates; a run blocked by
//! another run's lock is answered with 409.

use crate::clock::Clock;
use crate::coordinator::{Coordinator, RunOutcome};
use crate::errors::IngestError;
use crate::notify::{NotifyError, Notifier};
use crate::source::RaceSource;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use racedata::{AccessToken, TokenClient, TokenError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use store::keys::time_from_id;
use store::records::{DriverNote, RaceJournalEntry};
use store::{Store, StoreError};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub coordinator: Arc<Coordinator>,
    pub notifier: Option<Arc<Notifier>>,
    pub source: Arc<dyn RaceSource>,
    pub tokens: Arc<TokenClient>,
    pub clock: Arc<dyn Clock>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("missing or malformed bearer token")]
    MissingToken,
    #[error("token does not belong to driver {0}")]
    Forbidden(i64),
    #[error("invalid path parameter: {0}")]
    InvalidPath(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("notifications are not configured")]
    NotificationsDisabled,
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error(transparent)]
    Token(#[from] TokenError),
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

fn store_status(error: &StoreError) -> StatusCode {
    match error {
        StoreError::AlreadyExists => StatusCode::CONFLICT,
        StoreError::DriverNotFound(_) | StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingToken => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotificationsDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Ingest(e) if e.is_unauthorized() => StatusCode::UNAUTHORIZED,
            ApiError::Ingest(IngestError::Store(e)) | ApiError::Store(e) => store_status(e),
            ApiError::Ingest(IngestError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Ingest(_) => StatusCode::BAD_GATEWAY,
            ApiError::Notify(NotifyError::Store(e)) => store_status(e),
            ApiError::Notify(_) => StatusCode::BAD_GATEWAY,
            ApiError::Token(TokenError::Rejected { status, .. }) if status.is_client_error() => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Token(TokenError::MissingRedirectUri) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Token(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// The upstream access token of the caller.
pub struct BearerToken(pub AccessToken);

impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| BearerToken(AccessToken::new(token)))
            .ok_or(ApiError::MissingToken)
    }
}

/// A caller whose token belongs to the `{driver_id}` of the route.
pub struct AuthorizedDriver {
    pub driver_id: i64,
    pub token: AccessToken,
}

impl FromRequestParts<ApiState> for AuthorizedDriver {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let BearerToken(token) = BearerToken::from_request_parts(parts, state).await?;
        let Path(params) =
            <Path<HashMap<String, String>> as FromRequestParts<ApiState>>::from_request_parts(
                parts, state,
            )
            .await
            .map_err(|e| ApiError::InvalidPath(e.body_text()))?;
        let driver_id: i64 = params
            .get("driver_id")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| ApiError::InvalidPath("driver_id".into()))?;

        let member = state
            .source
            .member_info(&token)
            .await
            .map_err(IngestError::from)?;
        if member.cust_id != driver_id {
            tracing::warn!(
                driver_id,
                member = member.cust_id,
                "driver route called with another member's token"
            );
            return Err(ApiError::Forbidden(driver_id));
        }
        Ok(AuthorizedDriver { driver_id, token })
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/oauth/token", post(exchange_code))
        .route("/oauth/refresh", post(refresh_token))
        .route("/login", post(login))
        .route("/drivers/{driver_id}", get(get_driver))
        .route("/drivers/{driver_id}/ingest", post(ingest))
        .route("/drivers/{driver_id}/reset", post(reset))
        .route("/drivers/{driver_id}/sessions", get(driver_sessions))
        .route(
            "/drivers/{driver_id}/sessions/{subsession_id}/laps",
            get(laps),
        )
        .route("/drivers/{driver_id}/notes", post(create_note).get(list_notes))
        .route(
            "/drivers/{driver_id}/notes/{timestamp}",
            get(get_note).put(update_note).delete(delete_note),
        )
        .route("/drivers/{driver_id}/journal", get(list_journal))
        .route(
            "/drivers/{driver_id}/journal/{subsession_id}",
            put(put_journal).get(get_journal).delete(delete_journal),
        )
        .route(
            "/drivers/{driver_id}/connections/{connection_id}",
            put(connect).delete(disconnect),
        )
        .route("/sessions/{subsession_id}", get(get_session))
        .route("/tracks/{track_id}/sessions", get(track_sessions))
        .route("/counters", get(counters))
        .route("/catalog/tracks", get(tracks))
        .route("/catalog/cars", get(cars))
        .route("/catalog/track_assets", get(track_assets))
        .route("/catalog/car_assets", get(car_assets))
        .with_state(state)
}

#[derive(Deserialize, Debug)]
struct Range {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
struct CodeBody {
    code: String,
}

#[derive(Deserialize, Debug)]
struct RefreshBody {
    refresh_token: String,
}

async fn exchange_code(
    State(state): State<ApiState>,
    Json(body): Json<CodeBody>,
) -> Result<Response, ApiError> {
    Ok(Json(state.tokens.exchange_code(&body.code).await?).into_response())
}

async fn refresh_token(
    State(state): State<ApiState>,
    Json(body): Json<RefreshBody>,
) -> Result<Response, ApiError> {
    Ok(Json(state.tokens.refresh(&body.refresh_token).await?).into_response())
}

async fn login(
    State(state): State<ApiState>,
    BearerToken(token): BearerToken,
) -> Result<Response, ApiError> {
    let driver = state.coordinator.login(&token).await?;
    Ok(Json(driver).into_response())
}

async fn get_driver(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
) -> Result<Response, ApiError> {
    let driver_id = caller.driver_id;
    match state.store.get_driver(driver_id).await? {
        Some(driver) => Ok(Json(driver).into_response()),
        None => Err(ApiError::NotFound(format!("driver {driver_id}"))),
    }
}

async fn ingest(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
) -> Result<Response, ApiError> {
    let outcome = state
        .coordinator
        .ingest(caller.driver_id, &caller.token)
        .await?;
    let status = match outcome {
        RunOutcome::Locked => StatusCode::CONFLICT,
        RunOutcome::Completed(_) => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn reset(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
) -> Result<Response, ApiError> {
    let driver_id = caller.driver_id;
    let deleted = state.store.reset_driver(driver_id).await?;
    tracing::info!(driver_id, deleted, "driver reset");
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

async fn driver_sessions(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Query(range): Query<Range>,
) -> Result<Response, ApiError> {
    let sessions = state
        .store
        .get_driver_sessions(caller.driver_id, range.from, range.to)
        .await?;
    Ok(Json(sessions).into_response())
}

async fn track_sessions(
    State(state): State<ApiState>,
    Path(track_id): Path<i64>,
    Query(range): Query<Range>,
) -> Result<Response, ApiError> {
    let sessions = state
        .store
        .get_track_sessions(track_id, range.from, range.to)
        .await?;
    Ok(Json(sessions).into_response())
}

async fn laps(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, subsession_id)): Path<(i64, i64)>,
) -> Result<Response, ApiError> {
    let laps = state
        .coordinator
        .load_laps(caller.driver_id, subsession_id, &caller.token)
        .await?;
    Ok(Json(laps).into_response())
}

async fn get_session(
    State(state): State<ApiState>,
    Path(subsession_id): Path<i64>,
) -> Result<Response, ApiError> {
    match state.store.get_session(subsession_id).await? {
        Some(detail) => Ok(Json(detail).into_response()),
        None => Err(ApiError::NotFound(format!("session {subsession_id}"))),
    }
}

#[derive(Deserialize, Debug)]
struct NoteBody {
    text: String,
    #[serde(default)]
    subsession_id: Option<i64>,
}

async fn create_note(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Json(body): Json<NoteBody>,
) -> Result<Response, ApiError> {
    let note = DriverNote {
        driver_id: caller.driver_id,
        timestamp: state.clock.now(),
        text: body.text,
        subsession_id: body.subsession_id,
    };
    let note = state.store.create_note(&note).await?;
    Ok((StatusCode::CREATED, Json(note)).into_response())
}

async fn list_notes(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Query(range): Query<Range>,
) -> Result<Response, ApiError> {
    let notes = state
        .store
        .list_notes(caller.driver_id, range.from, range.to)
        .await?;
    Ok(Json(notes).into_response())
}

/// Notes are addressed by the unix second they were written at.
fn note_time(timestamp: i64) -> Result<DateTime<Utc>, ApiError> {
    time_from_id(timestamp).ok_or_else(|| ApiError::InvalidPath(format!("timestamp {timestamp}")))
}

async fn get_note(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, timestamp)): Path<(i64, i64)>,
) -> Result<Response, ApiError> {
    match state
        .store
        .get_note(caller.driver_id, note_time(timestamp)?)
        .await?
    {
        Some(note) => Ok(Json(note).into_response()),
        None => Err(ApiError::NotFound(format!("note {timestamp}"))),
    }
}

async fn update_note(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, timestamp)): Path<(i64, i64)>,
    Json(body): Json<NoteBody>,
) -> Result<Response, ApiError> {
    let note = DriverNote {
        driver_id: caller.driver_id,
        timestamp: note_time(timestamp)?,
        text: body.text,
        subsession_id: body.subsession_id,
    };
    state.store.update_note(&note).await?;
    Ok(Json(note).into_response())
}

async fn delete_note(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, timestamp)): Path<(i64, i64)>,
) -> Result<Response, ApiError> {
    state
        .store
        .delete_note(caller.driver_id, note_time(timestamp)?)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize, Debug)]
struct JournalBody {
    notes: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Creates the entry or replaces its content, keeping the creation time.
async fn put_journal(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, subsession_id)): Path<(i64, i64)>,
    Json(body): Json<JournalBody>,
) -> Result<Response, ApiError> {
    let driver_id = caller.driver_id;
    let now = state.clock.now();
    let existing = state
        .store
        .get_journal_entry(driver_id, subsession_id)
        .await?;

    let mut entry = RaceJournalEntry {
        driver_id,
        subsession_id,
        created_at: now,
        updated_at: now,
        notes: body.notes,
        tags: body.tags,
    };
    match existing {
        Some(existing) => {
            entry.created_at = existing.created_at;
            state.store.update_journal_entry(&entry).await?;
            Ok(Json(entry).into_response())
        }
        None => {
            let entry = state.store.create_journal_entry(&entry).await?;
            Ok((StatusCode::CREATED, Json(entry)).into_response())
        }
    }
}

async fn get_journal(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, subsession_id)): Path<(i64, i64)>,
) -> Result<Response, ApiError> {
    match state
        .store
        .get_journal_entry(caller.driver_id, subsession_id)
        .await?
    {
        Some(entry) => Ok(Json(entry).into_response()),
        None => Err(ApiError::NotFound(format!(
            "journal entry for session {subsession_id}"
        ))),
    }
}

async fn list_journal(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
) -> Result<Response, ApiError> {
    let entries = state.store.list_journal_entries(caller.driver_id).await?;
    Ok(Json(entries).into_response())
}

async fn delete_journal(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, subsession_id)): Path<(i64, i64)>,
) -> Result<Response, ApiError> {
    state
        .store
        .delete_journal_entry(caller.driver_id, subsession_id)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn connect(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, connection_id)): Path<(i64, String)>,
) -> Result<Response, ApiError> {
    let notifier = state.notifier.ok_or(ApiError::NotificationsDisabled)?;
    let connection = notifier.register(caller.driver_id, &connection_id).await?;
    Ok(Json(connection).into_response())
}

async fn disconnect(
    State(state): State<ApiState>,
    caller: AuthorizedDriver,
    Path((_, connection_id)): Path<(i64, String)>,
) -> Result<Response, ApiError> {
    let notifier = state.notifier.ok_or(ApiError::NotificationsDisabled)?;
    notifier.disconnect(caller.driver_id, &connection_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn counters(State(state): State<ApiState>) -> Result<Response, ApiError> {
    Ok(Json(state.store.get_counters().await?).into_response())
}

async fn tracks(
    State(state): State<ApiState>,
    BearerToken(token): BearerToken,
) -> Result<Response, ApiError> {
    let tracks = state.source.tracks(&token).await.map_err(IngestError::from)?;
    Ok(Json(tracks.as_slice()).into_response())
}

async fn cars(
    State(state): State<ApiState>,
    BearerToken(token): BearerToken,
) -> Result<Response, ApiError> {
    let cars = state.source.cars(&token).await.map_err(IngestError::from)?;
    Ok(Json(cars.as_slice()).into_response())
}

async fn track_assets(
    State(state): State<ApiState>,
    BearerToken(token): BearerToken,
) -> Result<Response, ApiError> {
    let assets = state
        .source
        .track_assets(&token)
        .await
        .map_err(IngestError::from)?;
    Ok(Json(assets.as_ref()).into_response())
}

async fn car_assets(
    State(state): State<ApiState>,
    BearerToken(token): BearerToken,
) -> Result<Response, ApiError> {
    let assets = state
        .source
        .car_assets(&token)
        .await
        .map_err(IngestError::from)?;
    Ok(Json(assets.as_ref()).into_response())
}
