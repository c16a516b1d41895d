//! In-memory state store for tests and local development

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::StateStore;
use crate::error::Result;

/// Map-backed store; strongly consistent by construction
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<(String, String), serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let data = self.data.read().await;
        Ok(data.get(&(collection.to_string(), key.to_string())).cloned())
    }

    async fn put(&self, collection: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert((collection.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.remove(&(collection.to_string(), key.to_string()));
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let data = self.data.read().await;
        Ok(data
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn list_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        let data = self.data.read().await;
        Ok(data
            .range((collection.to_string(), prefix.to_string())..)
            .take_while(|((c, k), _)| c == collection && k.starts_with(prefix))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("vms", "i-1", json!({"a": 1})).await.unwrap();

        assert_eq!(store.get("vms", "i-1").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.get("vms", "i-2").await.unwrap(), None);
        assert_eq!(store.get("candidates", "i-1").await.unwrap(), None);

        store.delete("vms", "i-1").await.unwrap();
        assert_eq!(store.get("vms", "i-1").await.unwrap(), None);

        // Deleting an absent key is fine
        store.delete("vms", "i-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_collection() {
        let store = MemoryStore::new();
        store.put("vms", "i-1", json!(1)).await.unwrap();
        store.put("vms", "i-2", json!(2)).await.unwrap();
        store.put("candidates", "a@b.c", json!(3)).await.unwrap();

        let listed = store.list("vms").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|(k, _)| k.starts_with("i-")));
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = MemoryStore::new();
        store.put("ssh-keys", "a@b.c|web-a", json!(1)).await.unwrap();
        store.put("ssh-keys", "a@b.c|web-a2", json!(2)).await.unwrap();
        store.put("ssh-keys", "z@b.c|web-z", json!(3)).await.unwrap();

        let listed = store.list_prefix("ssh-keys", "a@b.c|").await.unwrap();
        assert_eq!(listed.len(), 2);

        // The scan must not leak into another collection
        store.put("zz", "a@b.c|web-a", json!(4)).await.unwrap();
        let listed = store.list_prefix("ssh-keys", "a@b.c|").await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
