//! Launch request submission and lifecycle

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use charon_core::model::{LaunchRequest, LaunchRequestStatus};

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::services::scheduler::SubmitSpec;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequestBody {
    pub instance_types: Vec<String>,
    pub regions: Vec<String>,
    pub ssh_public_key: String,
    #[serde(default)]
    pub attach_filesystem: bool,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequestBody {
    pub id: String,
}

/// GET /api/launch-requests: visible requests, newest first
pub async fn list_requests(
    State(state): State<AppState>,
    CurrentUser(candidate): CurrentUser,
) -> ApiResult<Json<Vec<LaunchRequest>>> {
    Ok(Json(state.scheduler().list_visible(&candidate).await?))
}

/// POST /api/launch-requests: submit
///
/// 201 when the greedy immediate dispatch fulfilled the request, 202 when
/// it was queued for the scheduler.
pub async fn submit_request(
    State(state): State<AppState>,
    CurrentUser(candidate): CurrentUser,
    Json(body): Json<SubmitRequestBody>,
) -> ApiResult<(StatusCode, Json<LaunchRequest>)> {
    let request = state
        .scheduler()
        .submit(
            &candidate,
            SubmitSpec {
                instance_types: body.instance_types,
                regions: body.regions,
                ssh_public_key: body.ssh_public_key,
                attach_filesystem: body.attach_filesystem,
            },
        )
        .await?;

    let status = if request.status == LaunchRequestStatus::Fulfilled {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(request)))
}

/// POST /api/launch-requests/cancel: cancel a queued request
pub async fn cancel_request(
    State(state): State<AppState>,
    CurrentUser(candidate): CurrentUser,
    Json(body): Json<CancelRequestBody>,
) -> ApiResult<Json<LaunchRequest>> {
    Ok(Json(state.scheduler().cancel(&candidate, &body.id).await?))
}
