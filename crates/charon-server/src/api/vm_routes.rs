//! VM listing and lifecycle

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;

use charon_core::model::{TerminationReason, Vm, VmStatus};
use charon_core::{cost, Error};

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchVmRequest {
    pub instance_type: String,
    pub region: String,
    pub ssh_public_key: String,
    #[serde(default)]
    pub attach_filesystem: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdRequest {
    pub instance_id: String,
}

/// GET /api/vms: visible VMs with an opportunistic upstream refresh
///
/// Status and IP are refreshed from upstream and persisted; accrued cost
/// in the response is computed live but only the reconciler writes it
/// back, so cost ownership stays in one place.
pub async fn list_vms(
    State(state): State<AppState>,
    CurrentUser(candidate): CurrentUser,
) -> ApiResult<Json<Vec<Vm>>> {
    let now = Utc::now();
    let mut vms = if candidate.is_admin() {
        state.store.list_vms().await?
    } else {
        state.store.vms_of(&candidate.email).await?
    };

    match state.cloud.list_instances().await {
        Ok(instances) => {
            let by_id: HashMap<_, _> = instances.into_iter().map(|i| (i.id.clone(), i)).collect();
            for vm in vms.iter_mut().filter(|vm| vm.is_active()) {
                if let Some(info) = by_id.get(&vm.instance_id) {
                    vm.status = info.status;
                    if info.ip_address.is_some() {
                        vm.ip_address = info.ip_address.clone();
                    }
                    vm.last_checked_at = Some(now);
                    state.store.put_vm(vm).await?;
                }
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "Skipping VM refresh, returning stored records");
        }
    }

    for vm in vms.iter_mut().filter(|vm| vm.is_active()) {
        vm.accrued_cents = cost::vm_accrued_cents(vm, now);
    }
    vms.sort_by(|a, b| b.launched_at.cmp(&a.launched_at));
    Ok(Json(vms))
}

/// POST /api/vms/launch: immediate single-shot launch
pub async fn launch_vm(
    State(state): State<AppState>,
    CurrentUser(candidate): CurrentUser,
    Json(body): Json<LaunchVmRequest>,
) -> ApiResult<(StatusCode, Json<Vm>)> {
    let vm = state
        .scheduler()
        .launch_now(
            &candidate,
            &body.instance_type,
            &body.region,
            &body.ssh_public_key,
            body.attach_filesystem,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

/// POST /api/vms/terminate: user-requested termination
pub async fn terminate_vm(
    State(state): State<AppState>,
    CurrentUser(candidate): CurrentUser,
    Json(body): Json<InstanceIdRequest>,
) -> ApiResult<Json<Vm>> {
    let mut vm = state
        .store
        .vm(&body.instance_id)
        .await?
        .ok_or_else(|| Error::not_found("no such VM"))?;
    if !candidate.is_admin() && vm.candidate_email != candidate.email {
        return Err(Error::forbidden("not your VM").into());
    }
    if !vm.is_active() {
        // Termination is idempotent at the upstream; locally a second
        // request is a well-formed conflict and the record is untouched
        return Err(Error::conflict("VM is already terminated").into());
    }

    state
        .cloud
        .terminate(std::slice::from_ref(&vm.instance_id))
        .await
        .map_err(charon_core::Error::from)?;

    let now = Utc::now();
    vm.terminated_at = Some(now);
    vm.termination_reason = Some(TerminationReason::UserRequested);
    vm.status = VmStatus::Terminated;
    vm.accrued_cents = cost::vm_accrued_cents(&vm, now);
    state.store.put_vm(&vm).await?;

    // Update the cached spend right away instead of waiting for the tick
    if let Some(mut owner) = state.store.candidate(&vm.candidate_email).await? {
        let vms = state.store.vms_of(&owner.email).await?;
        owner.spent_cents = cost::compute_spent(&vms, owner.spent_reset_at, now);
        state.store.put_candidate(&owner).await?;
    }

    // Last VM gone: the upstream SSH key has no further use
    if let Err(err) = state
        .scheduler()
        .cleanup_ssh_keys(&vm.candidate_email)
        .await
    {
        tracing::warn!(candidate = %vm.candidate_email, error = %err, "SSH key cleanup failed");
    }

    Ok(Json(vm))
}

/// POST /api/vms/restart: upstream restart
pub async fn restart_vm(
    State(state): State<AppState>,
    CurrentUser(candidate): CurrentUser,
    Json(body): Json<InstanceIdRequest>,
) -> ApiResult<Json<Vm>> {
    let mut vm = state
        .store
        .vm(&body.instance_id)
        .await?
        .ok_or_else(|| Error::not_found("no such VM"))?;
    if !candidate.is_admin() && vm.candidate_email != candidate.email {
        return Err(Error::forbidden("not your VM").into());
    }
    if !vm.is_active() {
        return Err(Error::conflict("VM is terminated").into());
    }

    state
        .cloud
        .restart(&vm.instance_id)
        .await
        .map_err(charon_core::Error::from)?;

    vm.status = VmStatus::Restarting;
    state.store.put_vm(&vm).await?;
    Ok(Json(vm))
}
