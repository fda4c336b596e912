//! HTTP API for challenges and runs
//!
//! Every failure is answered with a JSON body of the form `{"error": "..."}`.
//! Request bodies deserialize into typed structs whose fields are
//! [`Lenient`]: a wrongly typed field reads as absent, so the handler answers
//! with that field's validation message instead of a generic extractor
//! rejection.

use crate::error::SyncError;
use crate::runs;
use crate::store::RunStore;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use shared::{Challenge, ChallengeId, PlayerSlot, Progress, RunView, ValidationError};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn RunStore>,
}

impl ApiState {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/api/challenges",
            get(list_challenges)
                .post(create_challenge)
                .delete(delete_challenge),
        )
        .route("/api/runs", post(create_run))
        .route("/api/runs/:id", get(get_run).patch(update_progress))
        .route("/api/runs/:id/player", patch(update_player_progress))
        .route("/api/runs/:id/mode", patch(update_mode))
        .with_state(state)
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

    /// Maps a failed operation onto a response. `context` is what the caller
    /// sees when the store itself failed.
    fn from_sync(err: SyncError, context: &str) -> Self {
        let status = match &err {
            SyncError::Validation(_) | SyncError::InsufficientPool(_) => StatusCode::BAD_REQUEST,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Persistence(cause) => {
                error!("{}: {}", context, cause);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.public_message(context),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

/// A body field that is `None` when missing or of the wrong type
#[derive(Debug)]
struct Lenient<T>(Option<T>);

impl<T> Default for Lenient<T> {
    fn default() -> Self {
        Lenient(None)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Lenient<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Lenient(serde_json::from_value(value).ok()))
    }
}

#[derive(Debug, Deserialize)]
struct ChallengeBody {
    #[serde(default)]
    title: Lenient<String>,
    #[serde(default)]
    description: Lenient<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressBody {
    #[serde(default)]
    progress: Lenient<Vec<Lenient<i64>>>,
}

#[derive(Debug, Deserialize)]
struct PlayerProgressBody {
    #[serde(default)]
    player: Lenient<i64>,
    #[serde(default)]
    progress: Lenient<Vec<Lenient<i64>>>,
}

#[derive(Debug, Deserialize)]
struct ModeBody {
    #[serde(default, rename = "twoPlayerMode")]
    two_player_mode: Lenient<bool>,
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ValidationError> {
    serde_json::from_slice(body)
        .map_err(|e| ValidationError::Invalid(format!("Invalid JSON body: {}", e)))
}

fn parse_progress(field: Lenient<Vec<Lenient<i64>>>) -> Result<Progress, ValidationError> {
    let indices = field
        .0
        .ok_or(ValidationError::ProgressNotArray)?
        .into_iter()
        .map(|index| index.0.ok_or(ValidationError::IndexNotInteger))
        .collect::<Result<Vec<i64>, _>>()?;

    Progress::try_from_indices(indices)
}

fn parse_player(field: Lenient<i64>) -> Result<PlayerSlot, ValidationError> {
    PlayerSlot::from_number(field.0.ok_or(ValidationError::Player)?)
}

fn required_text(field: Lenient<String>, message: &str) -> Result<String, ApiError> {
    match field.0.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        _ => Err(ApiError::bad_request(message)),
    }
}

async fn list_challenges(State(state): State<ApiState>) -> Result<Json<Vec<Challenge>>, ApiError> {
    state
        .store
        .list_challenges()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_sync(e.into(), "Failed to fetch challenges"))
}

async fn create_challenge(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Challenge>), ApiError> {
    let body: ChallengeBody = parse_body(&body)?;
    let title = required_text(body.title, "Challenge title is required")?;
    let description = required_text(body.description, "Challenge description is required")?;

    let challenge = state
        .store
        .add_challenge(&title, &description)
        .await
        .map_err(|e| ApiError::from_sync(e.into(), "Failed to add challenge"))?;

    info!("Added challenge {} ({})", challenge.id, challenge.title);
    Ok((StatusCode::CREATED, Json(challenge)))
}

async fn delete_challenge(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let raw = params
        .get("id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("Challenge ID is required"))?;
    let id = raw
        .trim()
        .parse::<ChallengeId>()
        .map_err(|_| ApiError::bad_request("Invalid challenge ID"))?;

    let removed = state
        .store
        .delete_challenge(id)
        .await
        .map_err(|e| ApiError::from_sync(e.into(), "Failed to delete challenge"))?;

    if removed {
        info!("Deleted challenge {}", id);
    } else {
        debug!("Delete of unknown challenge {} ignored", id);
    }
    Ok(success())
}

async fn create_run(State(state): State<ApiState>) -> Result<(StatusCode, Json<RunView>), ApiError> {
    let run = runs::create_run(state.store.as_ref())
        .await
        .map_err(|e| ApiError::from_sync(e, "Failed to create bingo run"))?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunView>, ApiError> {
    runs::resolve_run(state.store.as_ref(), &run_id)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_sync(e, "Failed to fetch bingo run"))
}

async fn update_progress(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: ProgressBody = parse_body(&body)?;
    let progress = parse_progress(body.progress)?;

    state
        .store
        .update_progress(&run_id, progress)
        .await
        .map_err(|e| ApiError::from_sync(e.into(), "Failed to update progress"))?;

    debug!("Run {}: progress replaced over HTTP", run_id);
    Ok(success())
}

async fn update_player_progress(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: PlayerProgressBody = parse_body(&body)?;
    let player = parse_player(body.player)?;
    let progress = parse_progress(body.progress)?;

    state
        .store
        .update_player_progress(&run_id, player, progress)
        .await
        .map_err(|e| ApiError::from_sync(e.into(), "Failed to update player progress"))?;

    debug!("Run {}: player {} progress replaced over HTTP", run_id, player.number());
    Ok(success())
}

async fn update_mode(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: ModeBody = parse_body(&body)?;
    let two_player_mode = body.two_player_mode.0.ok_or(ValidationError::ModeNotBoolean)?;

    state
        .store
        .update_mode(&run_id, two_player_mode)
        .await
        .map_err(|e| ApiError::from_sync(e.into(), "Failed to update two-player mode"))?;

    debug!("Run {}: two-player mode set to {}", run_id, two_player_mode);
    Ok(success())
}
