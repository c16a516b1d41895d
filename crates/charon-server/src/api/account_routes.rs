//! Current-user profile

use axum::extract::State;
use axum::Json;
use chrono::Utc;

use charon_core::cost;
use charon_core::model::Candidate;

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/auth/me: profile with live spend
///
/// The cached `spentCents` can lag by a tick; this recomputes from the VM
/// history so the UI never shows stale budget numbers.
pub async fn me(
    State(state): State<AppState>,
    CurrentUser(mut candidate): CurrentUser,
) -> ApiResult<Json<Candidate>> {
    let vms = state.store.vms_of(&candidate.email).await?;
    candidate.spent_cents = cost::compute_spent(&vms, candidate.spent_reset_at, Utc::now());
    Ok(Json(candidate))
}
