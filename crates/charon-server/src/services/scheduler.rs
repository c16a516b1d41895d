//! Launch-request scheduler
//!
//! Admission runs inside the HTTP request: validate, guard, and try a
//! greedy immediate dispatch; anything that cannot launch right now is
//! queued. The queue drains FIFO by creation time on every reconciler
//! tick. A request is flipped to `provisioning` and persisted before the
//! upstream launch call, so an overlapping tick never dispatches it twice;
//! `provisioning` requests whose attempt went quiet are retried after two
//! tick periods.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use charon_cloud::{CloudError, CloudProvider, InstanceTypeInfo, LaunchSpec};
use charon_core::model::{
    Candidate, LaunchRequest, LaunchRequestStatus, SshKeyRecord, Vm, VmStatus,
};
use charon_core::{cost, naming, AppConfig, Error, Result, Store};

use crate::services::resolver::FilesystemResolver;

/// Failure reason recorded when a queued request's candidate disappears
const REASON_CANDIDATE_DEACTIVATED: &str = "candidate_deactivated";
/// Failure reason recorded when the hard quota check fails at dispatch
const REASON_INSUFFICIENT_QUOTA: &str = "insufficient_quota";

/// A user's submission, already deserialized and trimmed
#[derive(Debug, Clone)]
pub struct SubmitSpec {
    pub instance_types: Vec<String>,
    pub regions: Vec<String>,
    pub ssh_public_key: String,
    pub attach_filesystem: bool,
}

/// Launch-request scheduler
pub struct Scheduler {
    store: Store,
    cloud: Arc<dyn CloudProvider>,
    config: Arc<AppConfig>,
}

impl Scheduler {
    pub fn new(store: Store, cloud: Arc<dyn CloudProvider>, config: Arc<AppConfig>) -> Self {
        Self {
            store,
            cloud,
            config,
        }
    }

    fn resolver(&self) -> FilesystemResolver {
        FilesystemResolver::new(self.store.clone(), self.cloud.clone(), self.config.clone())
    }

    /// Submit a launch request; returns it as `fulfilled` (immediate
    /// dispatch succeeded) or `queued`
    pub async fn submit(&self, candidate: &Candidate, spec: SubmitSpec) -> Result<LaunchRequest> {
        let catalog = self.validated_catalog(&spec).await?;
        self.guard_single_flight(candidate).await?;

        let now = Utc::now();
        let remaining = self.remaining_cents(candidate, now).await?;
        if !candidate.is_admin() {
            let cheapest = spec
                .instance_types
                .iter()
                .filter_map(|name| catalog.iter().find(|t| &t.name == name))
                .map(|t| t.price_cents_per_hour)
                .min()
                .unwrap_or(0);
            if remaining < cheapest {
                return Err(Error::quota_exhausted(
                    "remaining budget does not cover the cheapest selected instance type",
                ));
            }
        }

        let ssh_key_name = self
            .ensure_ssh_key(&candidate.email, &spec.ssh_public_key)
            .await?;

        let mut request = LaunchRequest {
            id: Uuid::new_v4().to_string(),
            candidate_email: candidate.email.clone(),
            instance_types: spec.instance_types.clone(),
            regions: spec.regions.clone(),
            ssh_public_key: spec.ssh_public_key.clone(),
            attach_filesystem: spec.attach_filesystem,
            status: LaunchRequestStatus::Queued,
            created_at: now,
            attempts: 0,
            last_attempt_at: None,
            fulfilled_at: None,
            fulfilled_instance_id: None,
            failure_reason: None,
            cancelled_at: None,
        };

        // Greedy immediate dispatch: first (type, region) pair in the
        // caller's preference order that has capacity and fits the budget
        if let Some((type_info, region)) = pick_capacity(&catalog, &spec.instance_types, &spec.regions)
        {
            let affordable = candidate.is_admin() || remaining >= type_info.price_cents_per_hour;
            if affordable {
                match self
                    .launch_vm(candidate, type_info, &region, &ssh_key_name, spec.attach_filesystem, &catalog)
                    .await
                {
                    Ok(vm) => {
                        request.status = LaunchRequestStatus::Fulfilled;
                        request.fulfilled_at = Some(Utc::now());
                        request.fulfilled_instance_id = Some(vm.instance_id.clone());
                        self.store.put_launch_request(&request).await?;
                        return Ok(request);
                    }
                    Err(err) => {
                        tracing::warn!(
                            candidate = %candidate.email,
                            error = %err,
                            "Immediate dispatch failed, queueing request"
                        );
                    }
                }
            }
        }

        self.store.put_launch_request(&request).await?;
        Ok(request)
    }

    /// One-shot launch for an explicit (type, region); never queues
    pub async fn launch_now(
        &self,
        candidate: &Candidate,
        instance_type: &str,
        region: &str,
        ssh_public_key: &str,
        attach_filesystem: bool,
    ) -> Result<Vm> {
        let spec = SubmitSpec {
            instance_types: vec![instance_type.to_string()],
            regions: vec![region.to_string()],
            ssh_public_key: ssh_public_key.to_string(),
            attach_filesystem,
        };
        let catalog = self.validated_catalog(&spec).await?;
        self.guard_single_flight(candidate).await?;

        let type_info = catalog
            .iter()
            .find(|t| t.name == instance_type)
            .ok_or_else(|| Error::validation(format!("unknown instance type {}", instance_type)))?;
        if !type_info.has_capacity_in(region) {
            return Err(Error::capacity_unavailable(format!(
                "{} has no capacity in {}",
                instance_type, region
            )));
        }

        if !candidate.is_admin() {
            let remaining = self.remaining_cents(candidate, Utc::now()).await?;
            if remaining < type_info.price_cents_per_hour {
                return Err(Error::quota_exhausted(
                    "remaining budget does not cover this instance type",
                ));
            }
        }

        let ssh_key_name = self.ensure_ssh_key(&candidate.email, ssh_public_key).await?;
        self.launch_vm(candidate, type_info, region, &ssh_key_name, attach_filesystem, &catalog)
            .await
    }

    /// Cancel a queued request
    pub async fn cancel(&self, candidate: &Candidate, request_id: &str) -> Result<LaunchRequest> {
        let mut request = self
            .store
            .launch_request(request_id)
            .await?
            .ok_or_else(|| Error::not_found("no such launch request"))?;

        if !candidate.is_admin() && request.candidate_email != candidate.email {
            return Err(Error::forbidden("not your launch request"));
        }
        if request.status != LaunchRequestStatus::Queued {
            return Err(Error::conflict("only queued requests can be cancelled"));
        }

        request.status = LaunchRequestStatus::Cancelled;
        request.cancelled_at = Some(Utc::now());
        self.store.put_launch_request(&request).await?;

        // The submit path registered an SSH key for this request; with the
        // request dead it may have nothing left to use it
        self.try_cleanup_ssh_keys(&request.candidate_email).await;
        Ok(request)
    }

    /// Launch requests visible to the caller, newest first
    pub async fn list_visible(&self, candidate: &Candidate) -> Result<Vec<LaunchRequest>> {
        let mut requests = self.store.list_launch_requests().await?;
        if !candidate.is_admin() {
            requests.retain(|r| r.candidate_email == candidate.email);
        }
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    /// Drain the queue, oldest first; called from the reconciler tick
    pub async fn process_queue(&self) -> Result<()> {
        let now = Utc::now();
        let retry_after = Duration::seconds(2 * self.config.reconcile_interval_secs as i64);

        let mut pending: Vec<LaunchRequest> = self
            .store
            .list_launch_requests()
            .await?
            .into_iter()
            .filter(|r| match r.status {
                LaunchRequestStatus::Queued => true,
                // A provisioning request whose launch attempt went quiet is
                // retried after two tick periods
                LaunchRequestStatus::Provisioning => r
                    .last_attempt_at
                    .map(|at| now - at > retry_after)
                    .unwrap_or(true),
                _ => false,
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let catalog = self
            .cloud
            .list_instance_types()
            .await
            .map_err(charon_core::Error::from)?;

        let mut launched_this_tick: HashSet<String> = HashSet::new();
        for request in pending {
            let id = request.id.clone();
            if let Err(err) = self
                .dispatch_one(request, &catalog, &mut launched_this_tick, now)
                .await
            {
                tracing::warn!(request = %id, error = %err, "Dispatch failed, will retry next tick");
            }
        }
        Ok(())
    }

    async fn dispatch_one(
        &self,
        mut request: LaunchRequest,
        catalog: &[InstanceTypeInfo],
        launched_this_tick: &mut HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let candidate = match self.store.active_candidate(&request.candidate_email).await? {
            Some(candidate) => candidate,
            None => {
                request.status = LaunchRequestStatus::Cancelled;
                request.cancelled_at = Some(now);
                request.failure_reason = Some(REASON_CANDIDATE_DEACTIVATED.to_string());
                self.store.put_launch_request(&request).await?;
                self.try_cleanup_ssh_keys(&request.candidate_email).await;
                return Ok(());
            }
        };

        // One active VM per non-admin; skip until the next tick
        if !candidate.is_admin() {
            if launched_this_tick.contains(&candidate.email) {
                return Ok(());
            }
            let has_active = self
                .store
                .vms_of(&candidate.email)
                .await?
                .iter()
                .any(Vm::is_active);
            if has_active {
                return Ok(());
            }
        }

        let Some((type_info, region)) =
            pick_capacity(catalog, &request.instance_types, &request.regions)
        else {
            request.attempts += 1;
            request.last_attempt_at = Some(now);
            request.status = LaunchRequestStatus::Queued;
            return self.store.put_launch_request(&request).await;
        };

        if !candidate.is_admin() {
            let remaining = self.remaining_cents(&candidate, now).await?;
            if remaining < type_info.price_cents_per_hour {
                request.status = LaunchRequestStatus::Failed;
                request.failure_reason = Some(REASON_INSUFFICIENT_QUOTA.to_string());
                self.store.put_launch_request(&request).await?;
                self.try_cleanup_ssh_keys(&request.candidate_email).await;
                return Ok(());
            }
        }

        // Persist `provisioning` before the launch call so an overlapping
        // tick cannot dispatch the same request twice
        request.status = LaunchRequestStatus::Provisioning;
        request.last_attempt_at = Some(now);
        self.store.put_launch_request(&request).await?;

        let ssh_key_name = self
            .ensure_ssh_key(&candidate.email, &request.ssh_public_key)
            .await?;

        match self
            .launch_vm(
                &candidate,
                type_info,
                &region,
                &ssh_key_name,
                request.attach_filesystem,
                catalog,
            )
            .await
        {
            Ok(vm) => {
                request.status = LaunchRequestStatus::Fulfilled;
                request.fulfilled_at = Some(Utc::now());
                request.fulfilled_instance_id = Some(vm.instance_id.clone());
                launched_this_tick.insert(candidate.email.clone());
                self.store.put_launch_request(&request).await
            }
            Err(Error::UpstreamPermanent(reason)) => {
                request.status = LaunchRequestStatus::Failed;
                request.failure_reason = Some(reason);
                self.store.put_launch_request(&request).await?;
                self.try_cleanup_ssh_keys(&request.candidate_email).await;
                Ok(())
            }
            Err(err) => {
                // Transient: back to queued, retried next tick
                tracing::warn!(request = %request.id, error = %err, "Launch failed, requeueing");
                request.status = LaunchRequestStatus::Queued;
                request.attempts += 1;
                self.store.put_launch_request(&request).await
            }
        }
    }

    /// Register the user's SSH key upstream under its deterministic name
    ///
    /// The provider treats an existing name as success, so concurrent
    /// launches collapse onto one upstream record.
    pub async fn ensure_ssh_key(&self, email: &str, public_key: &str) -> Result<String> {
        let key_name = naming::ssh_key_name(email);
        self.cloud
            .add_ssh_key(&key_name, public_key)
            .await
            .map_err(charon_core::Error::from)?;
        self.store
            .put_ssh_key(&SshKeyRecord {
                email: email.to_lowercase(),
                key_name: key_name.clone(),
                public_key: public_key.to_string(),
                registered_at: Utc::now(),
            })
            .await?;
        Ok(key_name)
    }

    /// Drop upstream and local SSH keys once a candidate has no active VM
    /// and no pending launch request
    ///
    /// Counterpart of [`ensure_ssh_key`]: registration happens at submit,
    /// before it is known whether the request will ever produce a VM, so a
    /// request that dies as `cancelled` or `failed` must hand its key back
    /// here.
    pub(crate) async fn cleanup_ssh_keys(&self, email: &str) -> Result<()> {
        let records = self.store.ssh_keys_of(email).await?;
        if records.is_empty() {
            return Ok(());
        }
        let has_active = self
            .store
            .vms_of(email)
            .await?
            .iter()
            .any(Vm::is_active);
        if has_active {
            return Ok(());
        }
        // Keep the key while a request is still waiting to dispatch
        let has_pending = self
            .store
            .list_launch_requests()
            .await?
            .iter()
            .any(|r| r.candidate_email == email && r.is_pending());
        if has_pending {
            return Ok(());
        }

        let upstream = self
            .cloud
            .list_ssh_keys()
            .await
            .map_err(charon_core::Error::from)?;
        for record in records {
            if let Some(key) = upstream.iter().find(|k| k.name == record.key_name) {
                self.cloud
                    .delete_ssh_key(&key.id)
                    .await
                    .map_err(charon_core::Error::from)?;
            }
            self.store.delete_ssh_key(&record.email, &record.key_name).await?;
            tracing::info!(candidate = %email, key = %record.key_name, "Removed orphaned SSH key");
        }
        Ok(())
    }

    /// Best-effort [`cleanup_ssh_keys`]; failures are logged, the next
    /// reconciler tick retries
    async fn try_cleanup_ssh_keys(&self, email: &str) {
        if let Err(err) = self.cleanup_ssh_keys(email).await {
            tracing::warn!(candidate = %email, error = %err, "SSH key cleanup failed");
        }
    }

    /// Quota minus authoritative spend, in cents
    async fn remaining_cents(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<i64> {
        let vms = self.store.vms_of(&candidate.email).await?;
        let spent = cost::compute_spent(&vms, candidate.spent_reset_at, now);
        Ok(candidate.quota_cents() - spent)
    }

    async fn validated_catalog(&self, spec: &SubmitSpec) -> Result<Vec<InstanceTypeInfo>> {
        if spec.instance_types.is_empty() {
            return Err(Error::validation("instanceTypes must not be empty"));
        }
        if spec.regions.is_empty() {
            return Err(Error::validation("regions must not be empty"));
        }
        if spec.ssh_public_key.trim().is_empty() {
            return Err(Error::validation("sshPublicKey is required"));
        }

        let catalog = self
            .cloud
            .list_instance_types()
            .await
            .map_err(charon_core::Error::from)?;
        for name in &spec.instance_types {
            if !catalog.iter().any(|t| &t.name == name) {
                return Err(Error::validation(format!("unknown instance type {}", name)));
            }
        }
        Ok(catalog)
    }

    /// Reject when a non-admin already has an active VM or a pending request
    async fn guard_single_flight(&self, candidate: &Candidate) -> Result<()> {
        if candidate.is_admin() {
            return Ok(());
        }
        let has_active_vm = self
            .store
            .vms_of(&candidate.email)
            .await?
            .iter()
            .any(Vm::is_active);
        if has_active_vm {
            return Err(Error::conflict("you already have an active VM"));
        }
        let has_pending = self
            .store
            .list_launch_requests()
            .await?
            .iter()
            .any(|r| r.candidate_email == candidate.email && r.is_pending());
        if has_pending {
            return Err(Error::conflict("a launch request is already in flight"));
        }
        Ok(())
    }

    /// Resolve filesystems, compose user data, launch, and record the VM
    async fn launch_vm(
        &self,
        candidate: &Candidate,
        type_info: &InstanceTypeInfo,
        region: &str,
        ssh_key_name: &str,
        attach_filesystem: bool,
        catalog: &[InstanceTypeInfo],
    ) -> Result<Vm> {
        let resolver = self.resolver();
        let resolution = resolver
            .resolve(region, &candidate.email, attach_filesystem, ssh_key_name, catalog)
            .await?;

        let settings = self.store.settings().await?;
        let user_data = charon_core::userdata::compose_user_data(
            &settings.setup_script,
            &resolution.remount_script,
        );

        let launch_spec = LaunchSpec {
            region: region.to_string(),
            instance_type: type_info.name.clone(),
            ssh_key_names: vec![ssh_key_name.to_string()],
            filesystem_names: resolution.filesystem_names.clone(),
            name: Some(format!("{}-vm", naming::sanitize_email(&candidate.email))),
            user_data: Some(user_data),
        };

        let instance_id = self
            .cloud
            .launch(&launch_spec)
            .await
            .map_err(classify_launch_error)?;

        let vm = Vm {
            instance_id,
            candidate_email: candidate.email.clone(),
            instance_type: type_info.name.clone(),
            region: region.to_string(),
            price_cents_per_hour: type_info.price_cents_per_hour,
            launched_at: Utc::now(),
            status: VmStatus::Launching,
            ip_address: None,
            ssh_key_name: ssh_key_name.to_string(),
            terminated_at: None,
            termination_reason: None,
            last_checked_at: None,
            accrued_cents: 0,
        };
        self.store.put_vm(&vm).await?;

        tracing::info!(
            candidate = %candidate.email,
            instance_id = %vm.instance_id,
            instance_type = %vm.instance_type,
            region = %vm.region,
            "Launched VM"
        );

        // Loaders ride along after the user's VM is recorded; their
        // failures never fail the user's launch
        resolver.launch_loaders(&resolution.loaders).await;

        Ok(vm)
    }
}

/// First (type, region) pair in caller preference order with capacity
fn pick_capacity<'a>(
    catalog: &'a [InstanceTypeInfo],
    instance_types: &[String],
    regions: &[String],
) -> Option<(&'a InstanceTypeInfo, String)> {
    for type_name in instance_types {
        let Some(type_info) = catalog.iter().find(|t| &t.name == type_name) else {
            continue;
        };
        for region in regions {
            if type_info.has_capacity_in(region) {
                return Some((type_info, region.clone()));
            }
        }
    }
    None
}

fn classify_launch_error(err: CloudError) -> Error {
    match err {
        CloudError::Permanent(msg) => Error::UpstreamPermanent(msg),
        other => Error::UpstreamTransient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charon_cloud::LocalCloud;
    use charon_core::model::Role;
    use charon_core::store::memory_store;

    fn config() -> Arc<AppConfig> {
        Arc::new(AppConfig::default())
    }

    fn candidate(email: &str, quota_dollars: i64) -> Candidate {
        Candidate {
            email: email.into(),
            name: "Test".into(),
            role: Role::Candidate,
            quota_dollars,
            spent_cents: 0,
            added_at: Utc::now(),
            added_by: "admin@example.org".into(),
            spent_reset_at: None,
            deactivated_at: None,
        }
    }

    fn spec() -> SubmitSpec {
        SubmitSpec {
            instance_types: vec!["gpu_1x_a100".into()],
            regions: vec!["us-west-1".into()],
            ssh_public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 alice".into(),
            attach_filesystem: false,
        }
    }

    async fn setup(capacity: &[&str]) -> (Store, Arc<LocalCloud>, Scheduler) {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        cloud.set_capacity("gpu_1x_a100", 110, capacity).await;
        let scheduler = Scheduler::new(store.clone(), cloud.clone(), config());
        (store, cloud, scheduler)
    }

    #[tokio::test]
    async fn test_immediate_dispatch_with_capacity() {
        let (store, _cloud, scheduler) = setup(&["us-west-1"]).await;
        let alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();

        let request = scheduler.submit(&alice, spec()).await.unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Fulfilled);

        let vm = store
            .vm(request.fulfilled_instance_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vm.price_cents_per_hour, 110);
        assert_eq!(vm.status, VmStatus::Launching);
        assert_eq!(vm.ssh_key_name, "web-alice-example-org");
    }

    #[tokio::test]
    async fn test_no_capacity_queues() {
        let (_store, _cloud, scheduler) = setup(&[]).await;
        let alice = candidate("alice@example.org", 50);

        let request = scheduler.submit(&alice, spec()).await.unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Queued);
    }

    #[tokio::test]
    async fn test_queued_request_fulfilled_after_capacity_appears() {
        let (store, cloud, scheduler) = setup(&[]).await;
        let alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();

        let request = scheduler.submit(&alice, spec()).await.unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Queued);

        cloud.set_capacity("gpu_1x_a100", 110, &["us-west-1"]).await;
        scheduler.process_queue().await.unwrap();

        let request = store.launch_request(&request.id).await.unwrap().unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Fulfilled);
        assert!(request.fulfilled_instance_id.is_some());
    }

    #[tokio::test]
    async fn test_active_vm_blocks_new_submissions() {
        let (store, _cloud, scheduler) = setup(&["us-west-1"]).await;
        let alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();

        let first = scheduler.submit(&alice, spec()).await.unwrap();
        assert_eq!(first.status, LaunchRequestStatus::Fulfilled);

        // One active VM per candidate: both the queue path and the
        // single-shot path refuse a second
        let err = scheduler.submit(&alice, spec()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let err = scheduler
            .launch_now(&alice, "gpu_1x_a100", "us-west-1", "ssh-ed25519 AAAA", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_submissions() {
        let (store, _cloud, scheduler) = setup(&["us-west-1"]).await;
        let alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();

        let empty_types = SubmitSpec {
            instance_types: vec![],
            ..spec()
        };
        assert!(matches!(
            scheduler.submit(&alice, empty_types).await.unwrap_err(),
            Error::Validation(_)
        ));

        let unknown_type = SubmitSpec {
            instance_types: vec!["gpu_64x_unobtainium".into()],
            ..spec()
        };
        assert!(matches!(
            scheduler.submit(&alice, unknown_type).await.unwrap_err(),
            Error::Validation(_)
        ));

        let no_key = SubmitSpec {
            ssh_public_key: "  ".into(),
            ..spec()
        };
        assert!(matches!(
            scheduler.submit(&alice, no_key).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_user_data_carries_setup_and_remounts() {
        let (store, cloud, scheduler) = setup(&["us-east-1"]).await;
        let alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();
        store
            .put_settings(&charon_core::model::Settings {
                lambda_api_key: "key".into(),
                setup_script: "#!/bin/sh\napt-get install -y htop".into(),
                default_filesystems: vec![charon_core::model::DefaultFilesystem {
                    name: "shared-data".into(),
                    source_url: "s3://datasets/shared".into(),
                    source: charon_core::model::SeedSource::S3 {
                        access_key_id: "AKIA".into(),
                        secret_access_key: "secret".into(),
                        endpoint_url: None,
                    },
                    download_script: None,
                }],
                seed_complete_secret: "sekrit".into(),
            })
            .await
            .unwrap();

        let vm = scheduler
            .launch_now(&alice, "gpu_1x_a100", "us-east-1", "ssh-ed25519 AAAA", true)
            .await
            .unwrap();

        let user_data = cloud.user_data_of(&vm.instance_id).await.unwrap();
        assert!(user_data.starts_with("#!/bin/bash\nset -euo pipefail\n"));
        assert!(user_data.contains("apt-get install -y htop"));
        assert!(user_data.contains("remount,ro /lambda/nfs/shared-data"));

        // The launch attached both the personal and the shared filesystem
        let specs = cloud.launched_specs().await;
        let user_vm_spec = specs
            .iter()
            .find(|s| s.user_data.as_deref() == Some(user_data.as_str()))
            .unwrap();
        assert!(user_vm_spec
            .filesystem_names
            .contains(&"fs-alice-example-org-us-east-1".to_string()));
        assert!(user_vm_spec
            .filesystem_names
            .contains(&"shared-data".to_string()));
    }

    #[tokio::test]
    async fn test_second_pending_request_conflicts() {
        let (_store, _cloud, scheduler) = setup(&[]).await;
        let alice = candidate("alice@example.org", 50);

        let first = scheduler.submit(&alice, spec()).await.unwrap();
        assert_eq!(first.status, LaunchRequestStatus::Queued);

        let err = scheduler.submit(&alice, spec()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_only_from_queued() {
        let (store, cloud, scheduler) = setup(&[]).await;
        let alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();

        let request = scheduler.submit(&alice, spec()).await.unwrap();

        // Admission registered the key even though nothing launched yet
        assert!(store
            .ssh_key("alice@example.org", "web-alice-example-org")
            .await
            .unwrap()
            .is_some());

        let cancelled = scheduler.cancel(&alice, &request.id).await.unwrap();
        assert_eq!(cancelled.status, LaunchRequestStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        // No VM was created for it, and the key was handed back both
        // locally and upstream
        assert!(store.list_vms().await.unwrap().is_empty());
        assert!(store
            .ssh_key("alice@example.org", "web-alice-example-org")
            .await
            .unwrap()
            .is_none());
        assert!(cloud.list_ssh_keys().await.unwrap().is_empty());

        // Cancelling a terminal request is a conflict
        let err = scheduler.cancel(&alice, &request.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // And the record did not change
        let request = store.launch_request(&request.id).await.unwrap().unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Cancelled);

        // Capacity appearing later must not resurrect it
        cloud.set_capacity("gpu_1x_a100", 110, &["us-west-1"]).await;
        scheduler.process_queue().await.unwrap();
        let request = store.launch_request(&request.id).await.unwrap().unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_soft_quota_rejects_at_admission() {
        let (store, _cloud, scheduler) = setup(&["us-west-1"]).await;
        // 100 cents of quota cannot cover a 110-cents-per-hour instance
        let alice = candidate("alice@example.org", 1);
        store.put_candidate(&alice).await.unwrap();

        let err = scheduler.submit(&alice, spec()).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExhausted(_)));
    }

    #[tokio::test]
    async fn test_dispatch_fails_request_when_quota_gone() {
        let (store, cloud, scheduler) = setup(&[]).await;
        let alice = candidate("alice@example.org", 1);
        store.put_candidate(&alice).await.unwrap();

        // Queued while affordable (100 cents of quota >= cheapest at 90)
        cloud.set_capacity("gpu_1x_t4", 90, &[]).await;
        let request = scheduler
            .submit(
                &alice,
                SubmitSpec {
                    instance_types: vec!["gpu_1x_t4".into()],
                    ..spec()
                },
            )
            .await
            .unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Queued);

        // Burn the budget with an old terminated VM, then add capacity
        let vm = Vm {
            instance_id: "inst-old".into(),
            candidate_email: alice.email.clone(),
            instance_type: "gpu_1x_t4".into(),
            region: "us-west-1".into(),
            price_cents_per_hour: 90,
            launched_at: Utc::now() - Duration::hours(2),
            status: VmStatus::Terminated,
            ip_address: None,
            ssh_key_name: "web-alice-example-org".into(),
            terminated_at: Some(Utc::now() - Duration::hours(1)),
            termination_reason: None,
            last_checked_at: None,
            accrued_cents: 90,
        };
        store.put_vm(&vm).await.unwrap();
        cloud.set_capacity("gpu_1x_t4", 90, &["us-west-1"]).await;

        scheduler.process_queue().await.unwrap();

        let request = store.launch_request(&request.id).await.unwrap().unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Failed);
        assert_eq!(request.failure_reason.as_deref(), Some("insufficient_quota"));

        // No VM came out of the request, so its SSH key was reclaimed
        assert!(store
            .ssh_key("alice@example.org", "web-alice-example-org")
            .await
            .unwrap()
            .is_none());
        assert!(cloud.list_ssh_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_cancels_for_deactivated_candidate() {
        let (store, cloud, scheduler) = setup(&[]).await;
        let mut alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();

        let request = scheduler.submit(&alice, spec()).await.unwrap();

        alice.deactivated_at = Some(Utc::now());
        store.put_candidate(&alice).await.unwrap();
        cloud.set_capacity("gpu_1x_a100", 110, &["us-west-1"]).await;

        scheduler.process_queue().await.unwrap();

        let request = store.launch_request(&request.id).await.unwrap().unwrap();
        assert_eq!(request.status, LaunchRequestStatus::Cancelled);
        assert_eq!(
            request.failure_reason.as_deref(),
            Some("candidate_deactivated")
        );

        // The deactivated candidate's key goes with the request
        assert!(store
            .ssh_key("alice@example.org", "web-alice-example-org")
            .await
            .unwrap()
            .is_none());
        assert!(cloud.list_ssh_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_launch_failure_requeues() {
        let (store, cloud, scheduler) = setup(&[]).await;
        let alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();

        let request = scheduler.submit(&alice, spec()).await.unwrap();
        cloud.set_capacity("gpu_1x_a100", 110, &["us-west-1"]).await;
        cloud.fail_next_launch().await;

        scheduler.process_queue().await.unwrap();
        let requeued = store.launch_request(&request.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, LaunchRequestStatus::Queued);
        assert_eq!(requeued.attempts, 1);

        // Next tick succeeds
        scheduler.process_queue().await.unwrap();
        let fulfilled = store.launch_request(&request.id).await.unwrap().unwrap();
        assert_eq!(fulfilled.status, LaunchRequestStatus::Fulfilled);
    }

    #[tokio::test]
    async fn test_fifo_order_and_one_vm_per_user() {
        let (store, cloud, scheduler) = setup(&[]).await;
        let alice = candidate("alice@example.org", 50);
        let bob = candidate("bob@ex.com", 50);
        store.put_candidate(&alice).await.unwrap();
        store.put_candidate(&bob).await.unwrap();

        let first = scheduler.submit(&alice, spec()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = scheduler.submit(&bob, spec()).await.unwrap();

        cloud.set_capacity("gpu_1x_a100", 110, &["us-west-1"]).await;
        scheduler.process_queue().await.unwrap();

        let first = store.launch_request(&first.id).await.unwrap().unwrap();
        let second = store.launch_request(&second.id).await.unwrap().unwrap();
        assert_eq!(first.status, LaunchRequestStatus::Fulfilled);
        assert_eq!(second.status, LaunchRequestStatus::Fulfilled);

        // Each user has exactly one active VM
        for email in ["alice@example.org", "bob@ex.com"] {
            let active = store
                .vms_of(email)
                .await
                .unwrap()
                .iter()
                .filter(|vm| vm.is_active())
                .count();
            assert_eq!(active, 1);
        }
    }

    #[tokio::test]
    async fn test_launch_now_reports_capacity_unavailable() {
        let (store, _cloud, scheduler) = setup(&["us-west-1"]).await;
        let alice = candidate("alice@example.org", 50);
        store.put_candidate(&alice).await.unwrap();

        let err = scheduler
            .launch_now(&alice, "gpu_1x_a100", "us-east-1", "ssh-ed25519 AAAA", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapacityUnavailable(_)));

        let vm = scheduler
            .launch_now(&alice, "gpu_1x_a100", "us-west-1", "ssh-ed25519 AAAA", false)
            .await
            .unwrap();
        assert_eq!(vm.region, "us-west-1");
    }
}
