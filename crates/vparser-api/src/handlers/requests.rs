//! `/requests` handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::debug;

use vparser_models::{ApiEnvelope, RequestPatch, RequestSubmission, VideoRequest};

use crate::auth::ApiClient;
use crate::error::{ApiPath, ApiResult};
use crate::services::CreateOutcome;
use crate::state::AppState;

pub const MSG_CREATED: &str = "Successfully added new request";
pub const MSG_DEFERRED: &str = "Request stored, queueing deferred";
pub const MSG_LISTED: &str = "Successfully got all the requests";
pub const MSG_FOUND: &str = "Successfully got the request info";
pub const MSG_UPDATED: &str = "Successfully updated request";
pub const MSG_DELETED: &str = "Successfully deleted request";

type EnvelopeResponse<T> = ApiResult<(StatusCode, Json<ApiEnvelope<T>>)>;

/// List all non-archived requests.
pub async fn list_requests(
    _client: ApiClient,
    State(state): State<AppState>,
) -> ApiResult<Json<ApiEnvelope<Vec<VideoRequest>>>> {
    let requests = state.lifecycle.list().await?;
    Ok(Json(ApiEnvelope::ok(MSG_LISTED, requests)))
}

/// Store a new request and queue it for processing.
///
/// Responds 202 when the row is stored but the broker did not confirm the
/// publish; the outbox relay queues it later.
pub async fn create_request(
    client: ApiClient,
    State(state): State<AppState>,
    body: Result<Json<RequestSubmission>, JsonRejection>,
) -> EnvelopeResponse<VideoRequest> {
    let Json(submission) = body?;

    let outcome = state.lifecycle.create(submission).await?;
    debug!(client = %client.client_id, name = %outcome.request().name, "Request created");

    let (status, message, request) = match outcome {
        CreateOutcome::Queued(request) => (StatusCode::OK, MSG_CREATED, request),
        CreateOutcome::Deferred(request) => (StatusCode::ACCEPTED, MSG_DEFERRED, request),
    };
    Ok((
        status,
        Json(ApiEnvelope::for_status(status.as_u16(), message, Some(request))),
    ))
}

pub async fn get_request(
    _client: ApiClient,
    State(state): State<AppState>,
    ApiPath(name): ApiPath<String>,
) -> ApiResult<Json<ApiEnvelope<VideoRequest>>> {
    let request = state.lifecycle.get(&name).await?;
    Ok(Json(ApiEnvelope::ok(MSG_FOUND, request)))
}

/// Update `description`, `processed` and/or `text_url`.
///
/// A missing request is reported before the body is looked at.
pub async fn update_request(
    _client: ApiClient,
    State(state): State<AppState>,
    ApiPath(name): ApiPath<String>,
    body: Result<Json<RequestPatch>, JsonRejection>,
) -> ApiResult<Json<ApiEnvelope<VideoRequest>>> {
    let current = state.lifecycle.get(&name).await?;
    let Json(patch) = body?;
    let request = state.lifecycle.apply_patch(current, patch).await?;
    Ok(Json(ApiEnvelope::ok(MSG_UPDATED, request)))
}

/// Archive a request. The row is kept; its name becomes reusable.
pub async fn delete_request(
    _client: ApiClient,
    State(state): State<AppState>,
    ApiPath(name): ApiPath<String>,
) -> ApiResult<Json<ApiEnvelope<()>>> {
    state.lifecycle.delete(&name).await?;
    Ok(Json(ApiEnvelope::empty(StatusCode::OK.as_u16(), MSG_DELETED)))
}
