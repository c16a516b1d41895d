//! Filesystem listing and admin deletion

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use charon_cloud::FilesystemInfo;
use charon_core::naming;

use crate::auth::{AdminUser, CurrentUser};
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DeleteFilesystemQuery {
    pub id: String,
}

/// GET /api/filesystems: own personal filesystems; admins see all
pub async fn list_filesystems(
    State(state): State<AppState>,
    CurrentUser(candidate): CurrentUser,
) -> ApiResult<Json<Vec<FilesystemInfo>>> {
    let mut filesystems = state
        .cloud
        .list_filesystems()
        .await
        .map_err(charon_core::Error::from)?;

    if !candidate.is_admin() {
        let prefix = naming::personal_fs_prefix(&candidate.email);
        filesystems.retain(|fs| fs.name.starts_with(&prefix));
    }
    filesystems.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(filesystems))
}

/// DELETE /api/admin/filesystems?id=...: admin only
pub async fn delete_filesystem(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<DeleteFilesystemQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .cloud
        .delete_filesystem(&query.id)
        .await
        .map_err(charon_core::Error::from)?;
    Ok(Json(json!({ "deleted": query.id })))
}
