//! Admin endpoints: candidates, quotas, settings

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use charon_core::cost;
use charon_core::model::{Candidate, Role, SeedSource, Settings};
use charon_core::Error;

use crate::auth::AdminUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCandidateBody {
    pub email: String,
    pub name: String,
    pub quota_dollars: i64,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveCandidateQuery {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetQuotaBody {
    pub email: String,
    pub quota_dollars: i64,
}

/// GET /api/admin/candidates: all candidates with live spend
pub async fn list_candidates(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<Vec<Candidate>>> {
    let now = Utc::now();
    let vms = state.store.list_vms().await?;
    let mut candidates = state.store.list_candidates().await?;
    for candidate in &mut candidates {
        let owned: Vec<_> = vms
            .iter()
            .filter(|vm| vm.candidate_email == candidate.email)
            .cloned()
            .collect();
        candidate.spent_cents = cost::compute_spent(&owned, candidate.spent_reset_at, now);
    }
    candidates.sort_by(|a, b| a.email.cmp(&b.email));
    Ok(Json(candidates))
}

/// POST /api/admin/candidates: add, or reactivate with a fresh spend reset
pub async fn add_candidate(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(body): Json<AddCandidateBody>,
) -> ApiResult<(StatusCode, Json<Candidate>)> {
    let email = body.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(Error::validation("a valid email is required").into());
    }
    if body.quota_dollars < 0 {
        return Err(Error::validation("quotaDollars must not be negative").into());
    }

    let now = Utc::now();
    let candidate = match state.store.candidate(&email).await? {
        Some(mut existing) => {
            // Re-adding resets the spend window; old VMs stop counting
            existing.name = body.name;
            existing.role = body.role.unwrap_or(existing.role);
            existing.quota_dollars = body.quota_dollars;
            existing.deactivated_at = None;
            existing.spent_reset_at = Some(now);
            existing.spent_cents = 0;
            existing.added_by = admin.email.clone();
            existing
        }
        None => Candidate {
            email: email.clone(),
            name: body.name,
            role: body.role.unwrap_or(Role::Candidate),
            quota_dollars: body.quota_dollars,
            spent_cents: 0,
            added_at: now,
            added_by: admin.email.clone(),
            spent_reset_at: None,
            deactivated_at: None,
        },
    };
    state.store.put_candidate(&candidate).await?;
    tracing::info!(candidate = %candidate.email, by = %admin.email, "Candidate added");
    Ok((StatusCode::CREATED, Json(candidate)))
}

/// DELETE /api/admin/candidates?email=...: deactivate (record is kept)
pub async fn remove_candidate(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Query(query): Query<RemoveCandidateQuery>,
) -> ApiResult<Json<Candidate>> {
    let mut candidate = state.store.require_candidate(&query.email).await?;
    if candidate.email == admin.email {
        return Err(Error::validation("you cannot remove yourself").into());
    }
    candidate.deactivated_at = Some(Utc::now());
    state.store.put_candidate(&candidate).await?;
    tracing::info!(candidate = %candidate.email, by = %admin.email, "Candidate deactivated");
    Ok(Json(candidate))
}

/// POST /api/admin/quota: change a candidate's quota
pub async fn set_quota(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(body): Json<SetQuotaBody>,
) -> ApiResult<Json<Candidate>> {
    if body.quota_dollars < 0 {
        return Err(Error::validation("quotaDollars must not be negative").into());
    }
    let mut candidate = state.store.require_candidate(&body.email).await?;
    candidate.quota_dollars = body.quota_dollars;
    state.store.put_candidate(&candidate).await?;
    Ok(Json(candidate))
}

/// GET /api/admin/settings: settings with secrets masked
pub async fn get_settings(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<Settings>> {
    let settings = state.store.settings().await?;
    Ok(Json(masked(&settings)))
}

/// PUT /api/admin/settings: replace settings
///
/// A masked placeholder sent back unchanged keeps the stored secret, so
/// the UI can round-trip the document without ever holding real keys. The
/// seed-complete secret is never client-settable.
pub async fn put_settings(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(mut incoming): Json<Settings>,
) -> ApiResult<Json<Settings>> {
    validate_settings(&incoming)?;
    let stored = state.store.settings().await?;

    if is_masked(&incoming.lambda_api_key, &stored.lambda_api_key) {
        incoming.lambda_api_key = stored.lambda_api_key.clone();
    }
    for fs in &mut incoming.default_filesystems {
        let stored_source = stored
            .default_filesystems
            .iter()
            .find(|s| s.name == fs.name)
            .map(|s| &s.source);
        unmask_source(&mut fs.source, stored_source);
    }
    incoming.seed_complete_secret = stored.seed_complete_secret.clone();

    state.store.put_settings(&incoming).await?;
    tracing::info!(by = %admin.email, "Settings updated");
    Ok(Json(masked(&incoming)))
}

/// Filesystem names end up in mount paths and shell scripts, so they are
/// restricted to the provider's safe charset
fn validate_settings(settings: &Settings) -> Result<(), Error> {
    let mut seen = std::collections::BTreeSet::new();
    for fs in &settings.default_filesystems {
        let ok_name = !fs.name.is_empty()
            && fs
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !ok_name {
            return Err(Error::validation(format!(
                "filesystem name {:?} must be lowercase [a-z0-9-]",
                fs.name
            )));
        }
        if !seen.insert(&fs.name) {
            return Err(Error::validation(format!(
                "duplicate default filesystem {}",
                fs.name
            )));
        }
        if fs.source_url.trim().is_empty() {
            return Err(Error::validation(format!(
                "filesystem {} has no sourceUrl",
                fs.name
            )));
        }
    }
    Ok(())
}

/// Replace the tail of a secret with a short masked form
fn mask_secret(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        "\u{2022}\u{2022}\u{2022}\u{2022}".to_string()
    } else {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("\u{2022}\u{2022}\u{2022}\u{2022}{}", tail)
    }
}

/// Whether an incoming value is the masked form of the stored one
fn is_masked(incoming: &str, stored: &str) -> bool {
    incoming == mask_secret(stored) || incoming.starts_with('\u{2022}')
}

fn masked(settings: &Settings) -> Settings {
    let mut masked_settings = settings.clone();
    masked_settings.lambda_api_key = mask_secret(&settings.lambda_api_key);
    masked_settings.seed_complete_secret = mask_secret(&settings.seed_complete_secret);
    for fs in &mut masked_settings.default_filesystems {
        match &mut fs.source {
            SeedSource::S3 {
                secret_access_key, ..
            } => *secret_access_key = mask_secret(secret_access_key),
            SeedSource::Gcs {
                service_account_json,
            } => *service_account_json = mask_secret(service_account_json),
        }
    }
    masked_settings
}

fn unmask_source(incoming: &mut SeedSource, stored: Option<&SeedSource>) {
    match (incoming, stored) {
        (
            SeedSource::S3 {
                secret_access_key, ..
            },
            Some(SeedSource::S3 {
                secret_access_key: stored_key,
                ..
            }),
        ) => {
            if is_masked(secret_access_key, stored_key) {
                *secret_access_key = stored_key.clone();
            }
        }
        (
            SeedSource::Gcs {
                service_account_json,
            },
            Some(SeedSource::Gcs {
                service_account_json: stored_json,
            }),
        ) => {
            if is_masked(service_account_json, stored_json) {
                *service_account_json = stored_json.clone();
            }
        }
        _ => {}
    }
}
