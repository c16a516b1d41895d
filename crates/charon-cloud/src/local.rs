//! In-process cloud for tests and local development
//!
//! Behaves like the upstream API against an in-memory inventory: capacity
//! is whatever the catalog says, launches allocate ids and fake IPs, and
//! test knobs can inject capacity changes, failures, and externally
//! terminated instances.

use async_trait::async_trait;
use charon_core::model::VmStatus;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::provider::{CloudError, CloudProvider, CloudResult};
use crate::types::{FilesystemInfo, InstanceInfo, InstanceTypeInfo, LaunchSpec, SshKeyInfo};

struct LocalInstance {
    info: InstanceInfo,
    user_data: Option<String>,
}

#[derive(Default)]
struct Inner {
    catalog: Vec<InstanceTypeInfo>,
    instances: BTreeMap<String, LocalInstance>,
    ssh_keys: BTreeMap<String, SshKeyInfo>,
    filesystems: BTreeMap<String, FilesystemInfo>,
    launched: Vec<LaunchSpec>,
    fail_next_launch: bool,
    next_id: u64,
}

impl Inner {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06}", prefix, self.next_id)
    }
}

/// Local cloud provider
pub struct LocalCloud {
    inner: Mutex<Inner>,
}

impl LocalCloud {
    /// Empty inventory; tests add capacity explicitly
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Inventory loaded with a small built-in catalog, for dev mode
    pub fn with_default_catalog() -> Self {
        let catalog = vec![
            InstanceTypeInfo {
                name: "gpu_1x_a100".into(),
                description: "1x A100 (40 GB SXM4)".into(),
                price_cents_per_hour: 110,
                regions: vec!["us-west-1".into(), "us-east-1".into()],
            },
            InstanceTypeInfo {
                name: "gpu_8x_a100".into(),
                description: "8x A100 (40 GB SXM4)".into(),
                price_cents_per_hour: 880,
                regions: vec!["us-east-1".into()],
            },
            InstanceTypeInfo {
                name: "gpu_1x_h100".into(),
                description: "1x H100 (80 GB PCIe)".into(),
                price_cents_per_hour: 249,
                regions: vec!["us-west-1".into(), "europe-central-1".into()],
            },
        ];
        Self {
            inner: Mutex::new(Inner {
                catalog,
                ..Inner::default()
            }),
        }
    }

    // ── Test knobs ───────────────────────────────────────────────────────

    /// Replace the whole catalog
    pub async fn set_catalog(&self, catalog: Vec<InstanceTypeInfo>) {
        self.inner.lock().await.catalog = catalog;
    }

    /// Set the regions with capacity for one instance type, adding the
    /// type if it is new
    pub async fn set_capacity(&self, name: &str, price_cents_per_hour: i64, regions: &[&str]) {
        let mut inner = self.inner.lock().await;
        let regions: Vec<String> = regions.iter().map(|r| r.to_string()).collect();
        match inner.catalog.iter_mut().find(|t| t.name == name) {
            Some(entry) => entry.regions = regions,
            None => inner.catalog.push(InstanceTypeInfo {
                name: name.into(),
                description: name.into(),
                price_cents_per_hour,
                regions,
            }),
        }
    }

    /// Make the next launch fail with a transient error
    pub async fn fail_next_launch(&self) {
        self.inner.lock().await.fail_next_launch = true;
    }

    /// Forget an instance entirely, as if it vanished upstream
    pub async fn drop_instance(&self, instance_id: &str) {
        self.inner.lock().await.instances.remove(instance_id);
    }

    /// Force an instance's reported status
    pub async fn set_instance_status(&self, instance_id: &str, status: VmStatus) {
        if let Some(instance) = self.inner.lock().await.instances.get_mut(instance_id) {
            instance.info.status = status;
        }
    }

    /// Specs of every launch accepted so far, in order
    pub async fn launched_specs(&self) -> Vec<LaunchSpec> {
        self.inner.lock().await.launched.clone()
    }

    /// User data injected into a launched instance
    pub async fn user_data_of(&self, instance_id: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .and_then(|i| i.user_data.clone())
    }
}

impl Default for LocalCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for LocalCloud {
    async fn list_instance_types(&self) -> CloudResult<Vec<InstanceTypeInfo>> {
        Ok(self.inner.lock().await.catalog.clone())
    }

    async fn launch(&self, spec: &LaunchSpec) -> CloudResult<String> {
        let mut inner = self.inner.lock().await;
        if inner.fail_next_launch {
            inner.fail_next_launch = false;
            return Err(CloudError::Transient("injected launch failure".into()));
        }
        let Some(entry) = inner.catalog.iter().find(|t| t.name == spec.instance_type) else {
            return Err(CloudError::Permanent(format!(
                "unknown instance type {}",
                spec.instance_type
            )));
        };
        if !entry.has_capacity_in(&spec.region) {
            return Err(CloudError::Transient(format!(
                "no capacity for {} in {}",
                spec.instance_type, spec.region
            )));
        }
        let price = entry.price_cents_per_hour;
        let id = inner.next("inst");
        let ip = format!("10.0.0.{}", inner.next_id % 250 + 1);
        inner.instances.insert(
            id.clone(),
            LocalInstance {
                info: InstanceInfo {
                    id: id.clone(),
                    status: VmStatus::Booting,
                    region: spec.region.clone(),
                    instance_type: spec.instance_type.clone(),
                    ip_address: Some(ip),
                    price_cents_per_hour: Some(price),
                },
                user_data: spec.user_data.clone(),
            },
        );
        inner.launched.push(spec.clone());
        Ok(id)
    }

    async fn terminate(&self, instance_ids: &[String]) -> CloudResult<()> {
        let mut inner = self.inner.lock().await;
        for id in instance_ids {
            if let Some(instance) = inner.instances.get_mut(id) {
                instance.info.status = VmStatus::Terminated;
            }
        }
        Ok(())
    }

    async fn restart(&self, instance_id: &str) -> CloudResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.info.status = VmStatus::Booting;
                Ok(())
            }
            None => Err(CloudError::NotFound(format!("no instance {}", instance_id))),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> CloudResult<Option<InstanceInfo>> {
        Ok(self
            .inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|i| i.info.clone()))
    }

    async fn list_instances(&self) -> CloudResult<Vec<InstanceInfo>> {
        Ok(self
            .inner
            .lock()
            .await
            .instances
            .values()
            .map(|i| i.info.clone())
            .collect())
    }

    async fn list_ssh_keys(&self) -> CloudResult<Vec<SshKeyInfo>> {
        Ok(self.inner.lock().await.ssh_keys.values().cloned().collect())
    }

    async fn add_ssh_key(&self, name: &str, public_key: &str) -> CloudResult<SshKeyInfo> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.ssh_keys.get(name) {
            return Ok(existing.clone());
        }
        let id = inner.next("key");
        let key = SshKeyInfo {
            id,
            name: name.into(),
            public_key: public_key.into(),
        };
        inner.ssh_keys.insert(name.into(), key.clone());
        Ok(key)
    }

    async fn delete_ssh_key(&self, key_id: &str) -> CloudResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ssh_keys.retain(|_, key| key.id != key_id);
        Ok(())
    }

    async fn list_filesystems(&self) -> CloudResult<Vec<FilesystemInfo>> {
        Ok(self.inner.lock().await.filesystems.values().cloned().collect())
    }

    async fn create_filesystem(&self, name: &str, region: &str) -> CloudResult<FilesystemInfo> {
        let mut inner = self.inner.lock().await;
        let key = format!("{}|{}", name, region);
        if let Some(existing) = inner.filesystems.get(&key) {
            return Ok(existing.clone());
        }
        let id = inner.next("fs");
        let fs = FilesystemInfo {
            id,
            name: name.into(),
            region: region.into(),
            mount_point: Some(format!("/lambda/nfs/{}", name)),
            in_use: false,
        };
        inner.filesystems.insert(key, fs.clone());
        Ok(fs)
    }

    async fn delete_filesystem(&self, filesystem_id: &str) -> CloudResult<()> {
        let mut inner = self.inner.lock().await;
        inner.filesystems.retain(|_, fs| fs.id != filesystem_id);
        Ok(())
    }
}
