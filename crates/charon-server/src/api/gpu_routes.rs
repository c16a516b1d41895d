//! Instance-type catalog

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::collections::BTreeSet;

use charon_cloud::InstanceTypeInfo;

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuTypesResponse {
    pub types: Vec<InstanceTypeInfo>,
    pub all_regions: Vec<String>,
}

/// GET /api/gpu-types: catalog with live capacity
pub async fn list_gpu_types(
    State(state): State<AppState>,
    CurrentUser(_candidate): CurrentUser,
) -> ApiResult<Json<GpuTypesResponse>> {
    let types = state
        .cloud
        .list_instance_types()
        .await
        .map_err(charon_core::Error::from)?;

    let all_regions: BTreeSet<String> = types
        .iter()
        .flat_map(|t| t.regions.iter().cloned())
        .collect();

    Ok(Json(GpuTypesResponse {
        types,
        all_regions: all_regions.into_iter().collect(),
    }))
}
