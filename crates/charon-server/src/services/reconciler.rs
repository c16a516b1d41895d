//! Reconciler
//!
//! The scheduled tick that makes local records converge on upstream truth:
//! Pass A syncs VM state and accrues cost, enforces quota and account
//! removal, and cleans up orphaned SSH keys; Pass B drains the launch
//! queue; Pass C deletes stale seed claims. Every pass is idempotent and
//! logs-and-continues on per-item failure, so a partially failed tick is
//! repaired by the next one.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use charon_cloud::{CloudProvider, InstanceInfo};
use charon_core::model::{SeedState, TerminationReason, Vm, VmStatus};
use charon_core::{cost, AppConfig, Result, Store};

use crate::services::scheduler::Scheduler;

/// The scheduled reconciliation task
pub struct Reconciler {
    store: Store,
    cloud: Arc<dyn CloudProvider>,
    config: Arc<AppConfig>,
}

impl Reconciler {
    pub fn new(store: Store, cloud: Arc<dyn CloudProvider>, config: Arc<AppConfig>) -> Self {
        Self {
            store,
            cloud,
            config,
        }
    }

    /// Tick forever on the configured cadence
    pub async fn run_loop(self) {
        let period = std::time::Duration::from_secs(self.config.reconcile_interval_secs);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "Reconciler tick failed");
            }
        }
    }

    /// One full tick at the current instant
    pub async fn tick(&self) -> Result<()> {
        self.tick_at(Utc::now()).await
    }

    /// One full tick at an explicit instant (tests inject time here)
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<()> {
        if let Err(err) = self.sync_vms(now).await {
            tracing::error!(error = %err, "VM sync pass failed");
        }
        if let Err(err) = self.scheduler().process_queue().await {
            tracing::error!(error = %err, "Launch queue pass failed");
        }
        if let Err(err) = self.clean_stale_seed_claims(now).await {
            tracing::error!(error = %err, "Seed claim cleanup pass failed");
        }
        Ok(())
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.store.clone(), self.cloud.clone(), self.config.clone())
    }

    /// Pass A: VM sync, cost accrual, quota and account enforcement
    async fn sync_vms(&self, now: DateTime<Utc>) -> Result<()> {
        let upstream: HashMap<String, InstanceInfo> = self
            .cloud
            .list_instances()
            .await
            .map_err(charon_core::Error::from)?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();

        let mut touched: BTreeSet<String> = BTreeSet::new();

        for mut vm in self.store.list_vms().await? {
            if !vm.is_active() {
                continue;
            }
            touched.insert(vm.candidate_email.clone());

            let result = match upstream.get(&vm.instance_id) {
                None => self.finalize_external(&mut vm, now).await,
                Some(info) if info.status == VmStatus::Terminated => {
                    self.finalize_external(&mut vm, now).await
                }
                Some(info) => {
                    vm.status = info.status;
                    if info.ip_address.is_some() {
                        vm.ip_address = info.ip_address.clone();
                    }
                    vm.last_checked_at = Some(now);
                    vm.accrued_cents = cost::vm_accrued_cents(&vm, now);
                    self.store.put_vm(&vm).await
                }
            };
            if let Err(err) = result {
                tracing::warn!(instance_id = %vm.instance_id, error = %err, "VM sync failed");
            }
        }

        // Refresh the cached spend for every candidate whose VMs we looked
        // at; the computed value is authoritative
        for email in &touched {
            if let Err(err) = self.refresh_spent(email, now).await {
                tracing::warn!(candidate = %email, error = %err, "Spend refresh failed");
            }
        }

        // Decide which active VMs must die, then issue one batched
        // upstream terminate; records are only marked once upstream agrees
        let kills = self.collect_kills(now).await?;
        let mut killed_emails: BTreeSet<String> = BTreeSet::new();
        if !kills.is_empty() {
            let ids: Vec<String> = kills.keys().cloned().collect();
            match self.cloud.terminate(&ids).await {
                Ok(()) => {
                    for (instance_id, reason) in kills {
                        match self.store.vm(&instance_id).await? {
                            Some(mut vm) if vm.is_active() => {
                                vm.terminated_at = Some(now);
                                vm.termination_reason = Some(reason);
                                vm.status = VmStatus::Terminated;
                                vm.accrued_cents = cost::vm_accrued_cents(&vm, now);
                                self.store.put_vm(&vm).await?;
                                killed_emails.insert(vm.candidate_email.clone());
                                tracing::info!(
                                    instance_id = %vm.instance_id,
                                    candidate = %vm.candidate_email,
                                    reason = ?reason,
                                    "Terminated VM"
                                );
                            }
                            _ => {}
                        }
                    }
                }
                Err(err) => {
                    // Leave the records active; the next tick retries
                    tracing::error!(error = %err, "Batched terminate failed");
                }
            }
        }
        for email in killed_emails {
            if let Err(err) = self.refresh_spent(&email, now).await {
                tracing::warn!(candidate = %email, error = %err, "Spend refresh failed");
            }
        }

        // Walk the stored key records rather than the candidates touched
        // above: a key registered for a request that died without ever
        // producing a VM has an owner with no VM records at all
        let owners: BTreeSet<String> = self
            .store
            .list_ssh_keys()
            .await?
            .into_iter()
            .map(|record| record.email)
            .collect();
        let scheduler = self.scheduler();
        for email in owners {
            if let Err(err) = scheduler.cleanup_ssh_keys(&email).await {
                tracing::warn!(candidate = %email, error = %err, "SSH key cleanup failed");
            }
        }

        Ok(())
    }

    async fn finalize_external(&self, vm: &mut Vm, now: DateTime<Utc>) -> Result<()> {
        vm.terminated_at = Some(now);
        vm.termination_reason = Some(TerminationReason::TerminatedExternally);
        vm.status = VmStatus::Terminated;
        vm.last_checked_at = Some(now);
        vm.accrued_cents = cost::vm_accrued_cents(vm, now);
        tracing::info!(
            instance_id = %vm.instance_id,
            candidate = %vm.candidate_email,
            "VM no longer reported upstream, marking terminated"
        );
        self.store.put_vm(vm).await
    }

    async fn refresh_spent(&self, email: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(mut candidate) = self.store.candidate(email).await? else {
            return Ok(());
        };
        let vms = self.store.vms_of(email).await?;
        candidate.spent_cents = cost::compute_spent(&vms, candidate.spent_reset_at, now);
        self.store.put_candidate(&candidate).await
    }

    /// Active VMs that must be terminated, with their reasons
    ///
    /// Account removal wins over quota when both apply.
    async fn collect_kills(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, TerminationReason>> {
        let mut kills = BTreeMap::new();
        let vms = self.store.list_vms().await?;
        let max_age = self.config.max_vm_hours.map(Duration::hours);

        let mut by_email: BTreeMap<&str, Vec<&Vm>> = BTreeMap::new();
        for vm in vms.iter().filter(|vm| vm.is_active()) {
            by_email.entry(&vm.candidate_email).or_default().push(vm);
        }

        for (email, active) in by_email {
            let candidate = self.store.candidate(email).await?;
            let account_gone = match &candidate {
                None => true,
                Some(c) => !c.is_active(),
            };
            let over_quota = candidate
                .as_ref()
                .map(|c| {
                    !c.is_admin()
                        && cost::compute_spent(
                            &self.owned(&vms, email),
                            c.spent_reset_at,
                            now,
                        ) >= c.quota_cents()
                })
                .unwrap_or(false);

            for vm in active {
                if account_gone {
                    kills.insert(vm.instance_id.clone(), TerminationReason::AccountRemoved);
                } else if over_quota {
                    kills.insert(vm.instance_id.clone(), TerminationReason::QuotaExceeded);
                } else if let Some(max_age) = max_age {
                    if now - vm.launched_at > max_age {
                        kills.insert(vm.instance_id.clone(), TerminationReason::MaxHoursExceeded);
                    }
                }
            }
        }
        Ok(kills)
    }

    fn owned(&self, vms: &[Vm], email: &str) -> Vec<Vm> {
        vms.iter()
            .filter(|vm| vm.candidate_email == email)
            .cloned()
            .collect()
    }

    /// Pass C: delete `seeding` claims past the staleness window
    async fn clean_stale_seed_claims(&self, now: DateTime<Utc>) -> Result<()> {
        let stale_after = Duration::minutes(self.config.seed_stale_minutes);
        for status in self.store.list_seed_status().await? {
            if status.status != SeedState::Seeding {
                continue;
            }
            let stale = status
                .claimed_at
                .map(|claimed| now - claimed >= stale_after)
                .unwrap_or(true);
            if stale {
                tracing::warn!(
                    filesystem = %status.filesystem_name,
                    region = %status.region,
                    "Deleting stale seed claim"
                );
                self.store
                    .delete_seed_status(&status.filesystem_name, &status.region)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charon_cloud::LocalCloud;
    use charon_core::model::{Candidate, Role, SeedStatus};
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

    async fn launched_vm(
        store: &Store,
        cloud: &LocalCloud,
        email: &str,
        price: i64,
        launched_at: DateTime<Utc>,
    ) -> Vm {
        cloud.set_capacity("gpu_1x_a100", price, &["us-west-1"]).await;
        let id = cloud
            .launch(&charon_cloud::LaunchSpec {
                region: "us-west-1".into(),
                instance_type: "gpu_1x_a100".into(),
                ssh_key_names: vec!["web-test".into()],
                filesystem_names: vec![],
                name: None,
                user_data: None,
            })
            .await
            .unwrap();
        let vm = Vm {
            instance_id: id,
            candidate_email: email.into(),
            instance_type: "gpu_1x_a100".into(),
            region: "us-west-1".into(),
            price_cents_per_hour: price,
            launched_at,
            status: VmStatus::Launching,
            ip_address: None,
            ssh_key_name: "web-test".into(),
            terminated_at: None,
            termination_reason: None,
            last_checked_at: None,
            accrued_cents: 0,
        };
        store.put_vm(&vm).await.unwrap();
        vm
    }

    #[tokio::test]
    async fn test_quota_exceeded_terminates() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config());

        // Bob has a 1-dollar quota and a 200-cents-per-hour VM running for
        // 31 minutes: accrued = ceil(31 * 200 / 60) = 104 > 100
        store.put_candidate(&candidate("bob@ex.com", 1)).await.unwrap();
        let now = Utc::now();
        let vm = launched_vm(&store, &cloud, "bob@ex.com", 200, now - Duration::minutes(31)).await;

        reconciler.tick_at(now).await.unwrap();

        let vm = store.vm(&vm.instance_id).await.unwrap().unwrap();
        assert!(!vm.is_active());
        assert_eq!(vm.termination_reason, Some(TerminationReason::QuotaExceeded));
        assert_eq!(vm.accrued_cents, 104);

        let bob = store.candidate("bob@ex.com").await.unwrap().unwrap();
        assert_eq!(bob.spent_cents, 104);

        // Idempotent: another tick leaves the terminated record alone
        reconciler.tick_at(now + Duration::minutes(1)).await.unwrap();
        let vm_after = store.vm(&vm.instance_id).await.unwrap().unwrap();
        assert_eq!(vm_after.terminated_at, vm.terminated_at);
        assert_eq!(vm_after.accrued_cents, 104);
    }

    #[tokio::test]
    async fn test_under_quota_vm_keeps_running() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config());

        store.put_candidate(&candidate("alice@example.org", 50)).await.unwrap();
        let now = Utc::now();
        let vm =
            launched_vm(&store, &cloud, "alice@example.org", 110, now - Duration::minutes(30)).await;

        reconciler.tick_at(now).await.unwrap();

        let vm = store.vm(&vm.instance_id).await.unwrap().unwrap();
        assert!(vm.is_active());
        // Status and accrual were refreshed from upstream
        assert_eq!(vm.status, VmStatus::Booting);
        assert_eq!(vm.accrued_cents, 55);
        assert!(vm.ip_address.is_some());

        let alice = store.candidate("alice@example.org").await.unwrap().unwrap();
        assert_eq!(alice.spent_cents, 55);
    }

    #[tokio::test]
    async fn test_externally_terminated_vm_is_finalized() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config());

        store.put_candidate(&candidate("alice@example.org", 50)).await.unwrap();
        let now = Utc::now();
        let vm =
            launched_vm(&store, &cloud, "alice@example.org", 110, now - Duration::minutes(10)).await;
        cloud.drop_instance(&vm.instance_id).await;

        reconciler.tick_at(now).await.unwrap();

        let vm = store.vm(&vm.instance_id).await.unwrap().unwrap();
        assert!(!vm.is_active());
        assert_eq!(
            vm.termination_reason,
            Some(TerminationReason::TerminatedExternally)
        );
    }

    #[tokio::test]
    async fn test_deactivated_account_loses_vms_and_keys() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config());

        let mut alice = candidate("alice@example.org", 50);
        alice.deactivated_at = Some(Utc::now());
        store.put_candidate(&alice).await.unwrap();

        let now = Utc::now();
        let vm =
            launched_vm(&store, &cloud, "alice@example.org", 110, now - Duration::minutes(5)).await;
        let key = cloud.add_ssh_key("web-test", "ssh-ed25519 AAAA").await.unwrap();
        store
            .put_ssh_key(&charon_core::model::SshKeyRecord {
                email: "alice@example.org".into(),
                key_name: "web-test".into(),
                public_key: key.public_key,
                registered_at: now,
            })
            .await
            .unwrap();

        reconciler.tick_at(now).await.unwrap();

        let vm = store.vm(&vm.instance_id).await.unwrap().unwrap();
        assert_eq!(vm.termination_reason, Some(TerminationReason::AccountRemoved));

        // Key is gone both locally and upstream
        assert!(store.ssh_key("alice@example.org", "web-test").await.unwrap().is_none());
        assert!(cloud.list_ssh_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_ssh_key_without_any_vm_is_reclaimed() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config());
        let now = Utc::now();

        // A submit registered the key, then the request died without ever
        // producing a VM; the owner has zero VM records
        store.put_candidate(&candidate("alice@example.org", 50)).await.unwrap();
        let key = cloud
            .add_ssh_key("web-alice-example-org", "ssh-ed25519 AAAA")
            .await
            .unwrap();
        store
            .put_ssh_key(&charon_core::model::SshKeyRecord {
                email: "alice@example.org".into(),
                key_name: "web-alice-example-org".into(),
                public_key: key.public_key,
                registered_at: now,
            })
            .await
            .unwrap();

        reconciler.tick_at(now).await.unwrap();

        assert!(store
            .ssh_key("alice@example.org", "web-alice-example-org")
            .await
            .unwrap()
            .is_none());
        assert!(cloud.list_ssh_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ssh_key_kept_while_request_is_pending() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config());
        let now = Utc::now();

        store.put_candidate(&candidate("alice@example.org", 50)).await.unwrap();
        let key = cloud
            .add_ssh_key("web-alice-example-org", "ssh-ed25519 AAAA")
            .await
            .unwrap();
        store
            .put_ssh_key(&charon_core::model::SshKeyRecord {
                email: "alice@example.org".into(),
                key_name: "web-alice-example-org".into(),
                public_key: key.public_key,
                registered_at: now,
            })
            .await
            .unwrap();
        store
            .put_launch_request(&charon_core::model::LaunchRequest {
                id: "r1".into(),
                candidate_email: "alice@example.org".into(),
                instance_types: vec!["gpu_1x_a100".into()],
                regions: vec!["us-west-1".into()],
                ssh_public_key: "ssh-ed25519 AAAA".into(),
                attach_filesystem: false,
                status: charon_core::model::LaunchRequestStatus::Queued,
                created_at: now,
                attempts: 0,
                last_attempt_at: None,
                fulfilled_at: None,
                fulfilled_instance_id: None,
                failure_reason: None,
                cancelled_at: None,
            })
            .await
            .unwrap();

        reconciler.tick_at(now).await.unwrap();

        // Still queued (no capacity), so the key must survive the tick
        assert!(store
            .ssh_key("alice@example.org", "web-alice-example-org")
            .await
            .unwrap()
            .is_some());
        assert_eq!(cloud.list_ssh_keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_max_hours_policy_when_enabled() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let config = Arc::new(AppConfig {
            max_vm_hours: Some(24),
            ..AppConfig::default()
        });
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config);

        store.put_candidate(&candidate("alice@example.org", 5000)).await.unwrap();
        let now = Utc::now();
        let vm =
            launched_vm(&store, &cloud, "alice@example.org", 110, now - Duration::hours(25)).await;

        reconciler.tick_at(now).await.unwrap();

        let vm = store.vm(&vm.instance_id).await.unwrap().unwrap();
        assert_eq!(
            vm.termination_reason,
            Some(TerminationReason::MaxHoursExceeded)
        );
    }

    #[tokio::test]
    async fn test_stale_seed_claims_are_deleted() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config());
        let now = Utc::now();

        store
            .put_seed_status(&SeedStatus {
                filesystem_name: "shared-data".into(),
                region: "us-east-1".into(),
                status: SeedState::Seeding,
                seeding_instance_id: None,
                claimed_at: Some(now - Duration::minutes(90)),
                completed_at: None,
            })
            .await
            .unwrap();
        store
            .put_seed_status(&SeedStatus {
                filesystem_name: "models".into(),
                region: "us-east-1".into(),
                status: SeedState::Ready,
                seeding_instance_id: None,
                claimed_at: Some(now - Duration::minutes(300)),
                completed_at: Some(now - Duration::minutes(200)),
            })
            .await
            .unwrap();

        reconciler.tick_at(now).await.unwrap();

        assert!(store.seed_status("shared-data", "us-east-1").await.unwrap().is_none());
        // Ready records are never cleaned up
        assert!(store.seed_status("models", "us-east-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reactivated_candidate_spend_excludes_old_vms() {
        let store = memory_store();
        let cloud = Arc::new(LocalCloud::new());
        let reconciler = Reconciler::new(store.clone(), cloud.clone(), config());
        let now = Utc::now();

        // Carol's old VM accrued 45 cents before she was removed
        let old = Vm {
            instance_id: "inst-old".into(),
            candidate_email: "carol@ex.com".into(),
            instance_type: "gpu_1x_a100".into(),
            region: "us-west-1".into(),
            price_cents_per_hour: 90,
            launched_at: now - Duration::hours(3),
            status: VmStatus::Terminated,
            ip_address: None,
            ssh_key_name: "web-carol-ex-com".into(),
            terminated_at: Some(now - Duration::hours(2) - Duration::minutes(30)),
            termination_reason: Some(TerminationReason::UserRequested),
            last_checked_at: None,
            accrued_cents: 45,
        };
        store.put_vm(&old).await.unwrap();

        // Re-added with a fresh reset
        let mut carol = candidate("carol@ex.com", 50);
        carol.spent_cents = 45;
        carol.spent_reset_at = Some(now - Duration::hours(1));
        store.put_candidate(&carol).await.unwrap();

        // A new VM launched after the reset accrues from zero
        launched_vm(&store, &cloud, "carol@ex.com", 60, now - Duration::minutes(10)).await;

        reconciler.tick_at(now).await.unwrap();

        let carol = store.candidate("carol@ex.com").await.unwrap().unwrap();
        // 10 minutes at 60 cents/hour => 10 cents; old VM excluded
        assert_eq!(carol.spent_cents, 10);
    }
}
