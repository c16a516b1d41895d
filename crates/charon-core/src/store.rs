//! State store contract and typed collection accessors
//!
//! The backing store is a strongly-consistent key-value blob store: get,
//! put, delete, and list over JSON documents, one collection per record
//! type. There are no multi-key transactions; callers read, mutate in
//! memory, and write back, relying on monotone per-record ownership.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{Candidate, LaunchRequest, SeedStatus, Settings, SshKeyRecord, Vm};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Logical collections
pub mod collections {
    pub const CANDIDATES: &str = "candidates";
    pub const VMS: &str = "vms";
    pub const LAUNCH_REQUESTS: &str = "launch-requests";
    pub const SSH_KEYS: &str = "ssh-keys";
    pub const SEED_STATUS: &str = "seed-status";
    pub const SETTINGS: &str = "settings";
}

/// The settings collection holds a single record under this key
pub const SETTINGS_KEY: &str = "settings";

/// Key-value storage interface
///
/// All operations are strongly consistent on a single key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get a document by key, `None` if absent
    async fn get(&self, collection: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Put a document, overwriting any existing value (last writer wins)
    async fn put(&self, collection: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Delete a key; deleting an absent key is not an error
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;

    /// List all (key, document) pairs in a collection
    async fn list(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>>;

    /// List the pairs whose key starts with `prefix`
    ///
    /// Backends with ordered keys can serve this without a full scan; the
    /// default just filters [`list`].
    async fn list_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(self
            .list(collection)
            .await?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect())
    }
}

/// Typed accessors layered over a [`StateStore`]
///
/// Documents that fail to parse are logged and skipped on list so one bad
/// record cannot wedge a reconciler tick.
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn StateStore>,
}

impl Store {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self { inner }
    }

    /// Access the raw key-value interface
    pub fn raw(&self) -> &dyn StateStore {
        self.inner.as_ref()
    }

    async fn get_typed<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        match self.inner.get(collection, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn put_typed<T: Serialize>(&self, collection: &str, key: &str, record: &T) -> Result<()> {
        self.inner
            .put(collection, key, serde_json::to_value(record)?)
            .await
    }

    async fn list_typed<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        self.parse_all(collection, self.inner.list(collection).await?)
    }

    async fn list_prefix_typed<T: DeserializeOwned>(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<T>> {
        self.parse_all(collection, self.inner.list_prefix(collection, prefix).await?)
    }

    fn parse_all<T: DeserializeOwned>(
        &self,
        collection: &str,
        pairs: Vec<(String, serde_json::Value)>,
    ) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for (key, value) in pairs {
            match serde_json::from_value(value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(collection, key = %key, error = %err, "Skipping unparseable record");
                }
            }
        }
        Ok(records)
    }

    // ---- candidates ----

    pub async fn candidate(&self, email: &str) -> Result<Option<Candidate>> {
        self.get_typed(collections::CANDIDATES, &email.to_lowercase())
            .await
    }

    /// Candidate by email, or a not-found error
    pub async fn require_candidate(&self, email: &str) -> Result<Candidate> {
        self.candidate(email)
            .await?
            .ok_or_else(|| Error::not_found(format!("no candidate {}", email)))
    }

    pub async fn put_candidate(&self, candidate: &Candidate) -> Result<()> {
        self.put_typed(collections::CANDIDATES, &candidate.email.to_lowercase(), candidate)
            .await
    }

    pub async fn list_candidates(&self) -> Result<Vec<Candidate>> {
        self.list_typed(collections::CANDIDATES).await
    }

    // ---- vms ----

    pub async fn vm(&self, instance_id: &str) -> Result<Option<Vm>> {
        self.get_typed(collections::VMS, instance_id).await
    }

    pub async fn put_vm(&self, vm: &Vm) -> Result<()> {
        self.put_typed(collections::VMS, &vm.instance_id, vm).await
    }

    pub async fn list_vms(&self) -> Result<Vec<Vm>> {
        self.list_typed(collections::VMS).await
    }

    /// All VM records for one candidate, active and terminated
    pub async fn vms_of(&self, email: &str) -> Result<Vec<Vm>> {
        let email = email.to_lowercase();
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.candidate_email == email)
            .collect())
    }

    // ---- launch requests ----

    pub async fn launch_request(&self, id: &str) -> Result<Option<LaunchRequest>> {
        self.get_typed(collections::LAUNCH_REQUESTS, id).await
    }

    pub async fn put_launch_request(&self, request: &LaunchRequest) -> Result<()> {
        self.put_typed(collections::LAUNCH_REQUESTS, &request.id, request)
            .await
    }

    pub async fn list_launch_requests(&self) -> Result<Vec<LaunchRequest>> {
        self.list_typed(collections::LAUNCH_REQUESTS).await
    }

    // ---- ssh keys ----

    pub async fn ssh_key(&self, email: &str, key_name: &str) -> Result<Option<SshKeyRecord>> {
        self.get_typed(collections::SSH_KEYS, &SshKeyRecord::store_key(email, key_name))
            .await
    }

    pub async fn put_ssh_key(&self, record: &SshKeyRecord) -> Result<()> {
        self.put_typed(
            collections::SSH_KEYS,
            &SshKeyRecord::store_key(&record.email, &record.key_name),
            record,
        )
        .await
    }

    pub async fn delete_ssh_key(&self, email: &str, key_name: &str) -> Result<()> {
        self.inner
            .delete(collections::SSH_KEYS, &SshKeyRecord::store_key(email, key_name))
            .await
    }

    pub async fn ssh_keys_of(&self, email: &str) -> Result<Vec<SshKeyRecord>> {
        // Keys are stored as `email|keyName`, so this is a prefix scan
        let prefix = format!("{}|", email.to_lowercase());
        self.list_prefix_typed(collections::SSH_KEYS, &prefix).await
    }

    pub async fn list_ssh_keys(&self) -> Result<Vec<SshKeyRecord>> {
        self.list_typed(collections::SSH_KEYS).await
    }

    // ---- seed status ----

    pub async fn seed_status(&self, filesystem_name: &str, region: &str) -> Result<Option<SeedStatus>> {
        self.get_typed(
            collections::SEED_STATUS,
            &SeedStatus::store_key(filesystem_name, region),
        )
        .await
    }

    pub async fn put_seed_status(&self, status: &SeedStatus) -> Result<()> {
        self.put_typed(
            collections::SEED_STATUS,
            &SeedStatus::store_key(&status.filesystem_name, &status.region),
            status,
        )
        .await
    }

    pub async fn delete_seed_status(&self, filesystem_name: &str, region: &str) -> Result<()> {
        self.inner
            .delete(
                collections::SEED_STATUS,
                &SeedStatus::store_key(filesystem_name, region),
            )
            .await
    }

    pub async fn list_seed_status(&self) -> Result<Vec<SeedStatus>> {
        self.list_typed(collections::SEED_STATUS).await
    }

    // ---- settings ----

    /// Current settings; an empty default before first configuration
    pub async fn settings(&self) -> Result<Settings> {
        Ok(self
            .get_typed(collections::SETTINGS, SETTINGS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn put_settings(&self, settings: &Settings) -> Result<()> {
        self.put_typed(collections::SETTINGS, SETTINGS_KEY, settings)
            .await
    }

    /// Candidate record, but only while it is not deactivated
    pub async fn active_candidate(&self, email: &str) -> Result<Option<Candidate>> {
        Ok(self.candidate(email).await?.filter(|c| c.is_active()))
    }
}

/// Convenience constructor for tests and dev mode
pub fn memory_store() -> Store {
    Store::new(Arc::new(MemoryStore::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use chrono::Utc;

    fn candidate(email: &str) -> Candidate {
        Candidate {
            email: email.into(),
            name: "Test".into(),
            role: Role::Candidate,
            quota_dollars: 50,
            spent_cents: 0,
            added_at: Utc::now(),
            added_by: "admin@example.org".into(),
            spent_reset_at: None,
            deactivated_at: None,
        }
    }

    #[tokio::test]
    async fn test_candidate_roundtrip_lowercases_key() {
        let store = memory_store();
        store.put_candidate(&candidate("alice@example.org")).await.unwrap();

        let found = store.candidate("Alice@Example.org").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().email, "alice@example.org");
    }

    #[tokio::test]
    async fn test_settings_default_before_first_put() {
        let store = memory_store();
        let settings = store.settings().await.unwrap();
        assert!(settings.lambda_api_key.is_empty());
        assert!(settings.default_filesystems.is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_unparseable_records() {
        let store = memory_store();
        store.put_candidate(&candidate("alice@example.org")).await.unwrap();
        store
            .raw()
            .put(
                collections::CANDIDATES,
                "broken@example.org",
                serde_json::json!({"email": 42}),
            )
            .await
            .unwrap();

        let listed = store.list_candidates().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].email, "alice@example.org");
    }
}
