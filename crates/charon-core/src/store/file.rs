//! File-backed state store
//!
//! One JSON document per record under `<root>/<collection>/<key>.json`.
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a crash mid-write never leaves a truncated document. Keys are
//! encoded into filename-safe form and decoded back on list.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;

use super::StateStore;
use crate::error::{Error, Result};

/// Directory-per-collection JSON store
pub struct FileStore {
    root: PathBuf,
    // Serializes writers; readers go straight to the filesystem
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root
            .join(collection)
            .join(format!("{}.json", encode_key(key)))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.record_path(collection, key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, collection: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(collection, key);
        let dir = path
            .parent()
            .ok_or_else(|| Error::internal("record path has no parent"))?;
        fs::create_dir_all(dir).await?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&value)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(collection, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let dir = self.root.join(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = decode_key(stem);
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(value) => records.push((key, value)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable document");
                }
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@')
}

/// Encode a store key into a filename-safe form
///
/// Plain characters pass through; everything else (including `%` itself and
/// the `|` used in composite keys) becomes `%XX`.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        let c = byte as char;
        if is_plain(c) && c != '%' {
            out.push(c);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Inverse of [`encode_key`]; undecodable sequences pass through unchanged
pub fn decode_key(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            if let Some(hex) = encoded.get(i + 1..i + 3) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_encoding_roundtrip() {
        for key in [
            "alice@example.org",
            "shared-data|us-east-1",
            "alice@example.org|web-alice-example-org",
            "weird key/with%stuff",
        ] {
            let encoded = encode_key(key);
            assert!(!encoded.contains('|'));
            assert!(!encoded.contains('/'));
            assert_eq!(decode_key(&encoded), key);
        }
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store
            .put("seed-status", "shared-data|us-east-1", json!({"status": "seeding"}))
            .await
            .unwrap();

        let value = store.get("seed-status", "shared-data|us-east-1").await.unwrap();
        assert_eq!(value, Some(json!({"status": "seeding"})));

        let listed = store.list("seed-status").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "shared-data|us-east-1");

        store.delete("seed-status", "shared-data|us-east-1").await.unwrap();
        assert!(store.get("seed-status", "shared-data|us-east-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_missing_collection_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.list("vms").await.unwrap().is_empty());
    }
}
