//! Filesystem resolver
//!
//! Turns "attach these filesystems to this VM" into upstream state: the
//! names to pass to launch, the loader VMs that must run to seed newly
//! created shared filesystems, and the shell fragment that remounts shared
//! filesystems read-only on the user's VM.
//!
//! The seed lock is a single-key claim record per (filesystem, region).
//! Claiming is last-writer-wins; a lost race at worst runs two loaders
//! against the same filesystem, which is harmless because both write the
//! same tree and both report completion.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use charon_cloud::{CloudProvider, InstanceTypeInfo, LaunchSpec};
use charon_core::model::{DefaultFilesystem, SeedState, SeedStatus, Settings};
use charon_core::userdata::{remount_readonly_command, LoaderScript};
use charon_core::{naming, AppConfig, Result, Store};

/// A loader VM that still has to be launched
#[derive(Debug, Clone)]
pub struct LoaderVm {
    pub filesystem_name: String,
    pub region: String,
    pub spec: LaunchSpec,
}

/// Resolver output for one user VM launch
#[derive(Debug, Default)]
pub struct Resolution {
    /// Filesystem names to attach at launch
    pub filesystem_names: Vec<String>,
    /// Shell fragment appended to the user VM's setup script
    pub remount_script: String,
    /// Loader VMs to launch after the resolution
    pub loaders: Vec<LoaderVm>,
}

/// Outcome of a seed-lock claim attempt
#[derive(Debug, PartialEq, Eq)]
pub enum SeedClaim {
    /// Seeding finished earlier; nothing to do
    AlreadyReady,
    /// A live claim exists; someone else is seeding
    AlreadySeeding,
    /// This caller holds the claim and must launch a loader
    Claimed,
}

/// Resolves filesystem attachments against the store and the provider
pub struct FilesystemResolver {
    store: Store,
    cloud: Arc<dyn CloudProvider>,
    config: Arc<AppConfig>,
}

impl FilesystemResolver {
    pub fn new(store: Store, cloud: Arc<dyn CloudProvider>, config: Arc<AppConfig>) -> Self {
        Self {
            store,
            cloud,
            config,
        }
    }

    /// Resolve all attachments for one launch
    ///
    /// `catalog` is the tick's instance-type listing, used to pick an
    /// instance type for loader VMs; `ssh_key_name` must already be
    /// registered upstream.
    pub async fn resolve(
        &self,
        region: &str,
        candidate_email: &str,
        attach_personal: bool,
        ssh_key_name: &str,
        catalog: &[InstanceTypeInfo],
    ) -> Result<Resolution> {
        let settings = self.store.settings().await?;
        let existing = self.cloud.list_filesystems().await.map_err(charon_core::Error::from)?;
        let exists = |name: &str| existing.iter().any(|fs| fs.name == name && fs.region == region);

        let mut resolution = Resolution::default();

        if attach_personal {
            let name = naming::personal_fs_name(candidate_email, region);
            if !exists(&name) {
                self.cloud
                    .create_filesystem(&name, region)
                    .await
                    .map_err(charon_core::Error::from)?;
            }
            // Personal filesystems stay read-write; no remount entry
            resolution.filesystem_names.push(name);
        }

        for default_fs in &settings.default_filesystems {
            let already_there = exists(&default_fs.name);
            if !already_there {
                self.cloud
                    .create_filesystem(&default_fs.name, region)
                    .await
                    .map_err(charon_core::Error::from)?;

                if self.claim_seed_lock(&default_fs.name, region, Utc::now()).await?
                    == SeedClaim::Claimed
                {
                    match self.loader_for(default_fs, region, ssh_key_name, &settings, catalog) {
                        Some(loader) => resolution.loaders.push(loader),
                        None => {
                            // No instance type has capacity here; release the
                            // claim so a later launch can retry promptly
                            tracing::warn!(
                                filesystem = %default_fs.name,
                                region,
                                "No capacity for a loader VM, releasing seed claim"
                            );
                            self.store.delete_seed_status(&default_fs.name, region).await?;
                        }
                    }
                }
            }

            // The user's VM attaches the filesystem either way; data shows
            // up once the loader finishes
            resolution.filesystem_names.push(default_fs.name.clone());
            if !resolution.remount_script.is_empty() {
                resolution.remount_script.push('\n');
            }
            resolution
                .remount_script
                .push_str(&remount_readonly_command(&default_fs.name));
        }

        Ok(resolution)
    }

    /// Attempt to take the seed lock for (filesystem, region)
    ///
    /// Last-writer-wins on the claim record itself; see the module docs for
    /// why a lost race is tolerable.
    pub async fn claim_seed_lock(
        &self,
        filesystem_name: &str,
        region: &str,
        now: DateTime<Utc>,
    ) -> Result<SeedClaim> {
        let stale_after = Duration::minutes(self.config.seed_stale_minutes);

        if let Some(current) = self.store.seed_status(filesystem_name, region).await? {
            match current.status {
                SeedState::Ready => return Ok(SeedClaim::AlreadyReady),
                SeedState::Seeding => {
                    let fresh = current
                        .claimed_at
                        .map(|claimed| now - claimed < stale_after)
                        .unwrap_or(false);
                    if fresh {
                        return Ok(SeedClaim::AlreadySeeding);
                    }
                    // Stale claim: fall through and take it over
                }
            }
        }

        self.store
            .put_seed_status(&SeedStatus {
                filesystem_name: filesystem_name.to_string(),
                region: region.to_string(),
                status: SeedState::Seeding,
                seeding_instance_id: None,
                claimed_at: Some(now),
                completed_at: None,
            })
            .await?;
        Ok(SeedClaim::Claimed)
    }

    /// Launch the loader VMs from a resolution, best effort
    ///
    /// A loader that fails to launch releases its claim so the next
    /// resolution can try again without waiting out the stale window.
    pub async fn launch_loaders(&self, loaders: &[LoaderVm]) {
        for loader in loaders {
            match self.cloud.launch(&loader.spec).await {
                Ok(instance_id) => {
                    tracing::info!(
                        filesystem = %loader.filesystem_name,
                        region = %loader.region,
                        instance_id = %instance_id,
                        "Launched seeding loader VM"
                    );
                    if let Ok(Some(mut status)) = self
                        .store
                        .seed_status(&loader.filesystem_name, &loader.region)
                        .await
                    {
                        status.seeding_instance_id = Some(instance_id);
                        if let Err(err) = self.store.put_seed_status(&status).await {
                            tracing::warn!(error = %err, "Failed to record loader instance id");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        filesystem = %loader.filesystem_name,
                        region = %loader.region,
                        error = %err,
                        "Loader VM launch failed, releasing seed claim"
                    );
                    let _ = self
                        .store
                        .delete_seed_status(&loader.filesystem_name, &loader.region)
                        .await;
                }
            }
        }
    }

    fn loader_for(
        &self,
        default_fs: &DefaultFilesystem,
        region: &str,
        ssh_key_name: &str,
        settings: &Settings,
        catalog: &[InstanceTypeInfo],
    ) -> Option<LoaderVm> {
        // Cheapest type with capacity in the region; the loader only needs
        // bandwidth, not GPUs
        let loader_type = catalog
            .iter()
            .filter(|t| t.has_capacity_in(region))
            .min_by_key(|t| t.price_cents_per_hour)?;

        let script = LoaderScript {
            filesystem_name: &default_fs.name,
            region,
            source_url: &default_fs.source_url,
            source: &default_fs.source,
            download_script: default_fs.download_script.as_deref(),
            app_base_url: &self.config.base_url,
            seed_complete_secret: &settings.seed_complete_secret,
        }
        .render();

        Some(LoaderVm {
            filesystem_name: default_fs.name.clone(),
            region: region.to_string(),
            spec: LaunchSpec {
                region: region.to_string(),
                instance_type: loader_type.name.clone(),
                ssh_key_names: vec![ssh_key_name.to_string()],
                filesystem_names: vec![default_fs.name.clone()],
                name: Some(format!("seed-{}-{}", default_fs.name, region)),
                user_data: Some(script),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charon_cloud::LocalCloud;
    use charon_core::model::SeedSource;
    use charon_core::store::memory_store;

    fn config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            base_url: "https://gpu.example.org".into(),
            ..AppConfig::default()
        })
    }

    fn shared_data_settings() -> Settings {
        Settings {
            lambda_api_key: "key".into(),
            setup_script: String::new(),
            default_filesystems: vec![DefaultFilesystem {
                name: "shared-data".into(),
                source_url: "s3://datasets/shared".into(),
                source: SeedSource::S3 {
                    access_key_id: "AKIA".into(),
                    secret_access_key: "secret".into(),
                    endpoint_url: None,
                },
                download_script: None,
            }],
            seed_complete_secret: "sekrit".into(),
        }
    }

    async fn setup() -> (Store, Arc<LocalCloud>, FilesystemResolver) {
        let store = memory_store();
        store.put_settings(&shared_data_settings()).await.unwrap();
        let cloud = Arc::new(LocalCloud::new());
        cloud.set_capacity("gpu_1x_a100", 110, &["us-east-1"]).await;
        let resolver = FilesystemResolver::new(store.clone(), cloud.clone(), config());
        (store, cloud, resolver)
    }

    fn catalog() -> Vec<InstanceTypeInfo> {
        vec![InstanceTypeInfo {
            name: "gpu_1x_a100".into(),
            description: "1x A100".into(),
            price_cents_per_hour: 110,
            regions: vec!["us-east-1".into()],
        }]
    }

    #[tokio::test]
    async fn test_first_resolution_creates_and_claims() {
        let (store, cloud, resolver) = setup().await;

        let resolution = resolver
            .resolve("us-east-1", "alice@example.org", false, "web-alice", &catalog())
            .await
            .unwrap();

        assert_eq!(resolution.filesystem_names, vec!["shared-data".to_string()]);
        assert!(resolution.remount_script.contains("remount,ro /lambda/nfs/shared-data"));
        assert_eq!(resolution.loaders.len(), 1);

        // Filesystem now exists upstream and a seeding claim is recorded
        assert_eq!(cloud.list_filesystems().await.unwrap().len(), 1);
        let status = store.seed_status("shared-data", "us-east-1").await.unwrap().unwrap();
        assert_eq!(status.status, SeedState::Seeding);
    }

    #[tokio::test]
    async fn test_seeding_race_yields_one_loader() {
        let (_store, _cloud, resolver) = setup().await;

        let first = resolver
            .resolve("us-east-1", "alice@example.org", false, "web-alice", &catalog())
            .await
            .unwrap();
        let second = resolver
            .resolve("us-east-1", "bob@ex.com", false, "web-bob", &catalog())
            .await
            .unwrap();

        // Exactly one resolution carries the loader; both attach and remount
        assert_eq!(first.loaders.len() + second.loaders.len(), 1);
        assert_eq!(second.filesystem_names, vec!["shared-data".to_string()]);
        assert!(second.remount_script.contains("remount,ro"));
    }

    #[tokio::test]
    async fn test_ready_filesystem_attaches_without_loader() {
        let (store, _cloud, resolver) = setup().await;

        let first = resolver
            .resolve("us-east-1", "alice@example.org", false, "web-alice", &catalog())
            .await
            .unwrap();
        resolver.launch_loaders(&first.loaders).await;

        let mut status = store.seed_status("shared-data", "us-east-1").await.unwrap().unwrap();
        status.status = SeedState::Ready;
        status.completed_at = Some(Utc::now());
        store.put_seed_status(&status).await.unwrap();

        let second = resolver
            .resolve("us-east-1", "bob@ex.com", false, "web-bob", &catalog())
            .await
            .unwrap();
        assert!(second.loaders.is_empty());
        assert!(second.remount_script.contains("remount,ro"));
    }

    #[tokio::test]
    async fn test_stale_claim_is_retaken() {
        let (store, _cloud, resolver) = setup().await;
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

        let claim = resolver.claim_seed_lock("shared-data", "us-east-1", now).await.unwrap();
        assert_eq!(claim, SeedClaim::Claimed);
    }

    #[tokio::test]
    async fn test_personal_filesystem_stays_read_write() {
        let (_store, cloud, resolver) = setup().await;

        let resolution = resolver
            .resolve("us-east-1", "alice@example.org", true, "web-alice", &catalog())
            .await
            .unwrap();

        assert!(resolution
            .filesystem_names
            .contains(&"fs-alice-example-org-us-east-1".to_string()));
        // The remount fragment covers shared filesystems only
        assert!(!resolution.remount_script.contains("fs-alice-example-org"));

        // Resolving again attaches the same filesystem without recreating
        let again = resolver
            .resolve("us-east-1", "alice@example.org", true, "web-alice", &catalog())
            .await
            .unwrap();
        assert!(again
            .filesystem_names
            .contains(&"fs-alice-example-org-us-east-1".to_string()));
        let personal: Vec<_> = cloud
            .list_filesystems()
            .await
            .unwrap()
            .into_iter()
            .filter(|fs| fs.name.starts_with("fs-alice"))
            .collect();
        assert_eq!(personal.len(), 1);
    }

    #[tokio::test]
    async fn test_loader_launch_failure_releases_claim() {
        let (store, cloud, resolver) = setup().await;

        let resolution = resolver
            .resolve("us-east-1", "alice@example.org", false, "web-alice", &catalog())
            .await
            .unwrap();
        cloud.fail_next_launch().await;
        resolver.launch_loaders(&resolution.loaders).await;

        assert!(store.seed_status("shared-data", "us-east-1").await.unwrap().is_none());
    }
}
