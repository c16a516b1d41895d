//! Seed-complete callback from loader VMs

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use charon_core::model::{SeedState, SeedStatus};
use charon_core::Error;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedCompleteBody {
    pub filesystem_name: String,
    pub region: String,
}

/// POST /api/seed-complete: loader VM reports a finished download
///
/// Authenticated with the generated seed-complete secret rather than a
/// user token. Idempotent: repeated reports (a retried curl, or two
/// loaders after a lost claim race) all land on `ready`. The record is
/// upserted so a loader that outlived a stale-claim cleanup still marks
/// the filesystem seeded.
pub async fn seed_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SeedCompleteBody>,
) -> ApiResult<Json<SeedStatus>> {
    let settings = state.store.settings().await?;
    let presented = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::unauthenticated("expected a Bearer token"))?;
    if settings.seed_complete_secret.is_empty() || presented != settings.seed_complete_secret {
        return Err(Error::unauthenticated("invalid seed-complete secret").into());
    }
    if body.filesystem_name.is_empty() || body.region.is_empty() {
        return Err(Error::validation("filesystemName and region are required").into());
    }

    let now = Utc::now();
    let status = match state
        .store
        .seed_status(&body.filesystem_name, &body.region)
        .await?
    {
        Some(mut existing) => {
            if existing.status != SeedState::Ready {
                existing.status = SeedState::Ready;
                existing.completed_at = Some(now);
            }
            existing
        }
        None => SeedStatus {
            filesystem_name: body.filesystem_name.clone(),
            region: body.region.clone(),
            status: SeedState::Ready,
            seeding_instance_id: None,
            claimed_at: None,
            completed_at: Some(now),
        },
    };
    state.store.put_seed_status(&status).await?;

    tracing::info!(
        filesystem = %status.filesystem_name,
        region = %status.region,
        "Filesystem seeding complete"
    );
    Ok(Json(status))
}
