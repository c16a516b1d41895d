//! HTTP client for the Lambda-style GPU cloud API
//!
//! Auth is HTTP Basic with the API key as the username. The key is read
//! through [`ApiKeySource`] on every call, so an admin rotating the key in
//! settings takes effect without a restart. All filesystem operations share
//! one path constant; the upstream accepts `/file-systems` for GET, POST,
//! and DELETE.

use async_trait::async_trait;
use charon_core::model::VmStatus;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::provider::{CloudError, CloudProvider, CloudResult};
use crate::types::{FilesystemInfo, InstanceInfo, InstanceTypeInfo, LaunchSpec, SshKeyInfo};

/// Timeout for data fetches
const DATA_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for launch, which the upstream serves noticeably slower
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The one place the filesystem path convention lives
const FILESYSTEMS_PATH: &str = "/file-systems";

/// Source of the upstream API key
///
/// The control plane stores the key in settings; the client asks for it on
/// each call rather than caching it at construction.
#[async_trait]
pub trait ApiKeySource: Send + Sync {
    async fn api_key(&self) -> CloudResult<String>;
}

/// A fixed key, for tests and one-off tooling
pub struct StaticApiKey(pub String);

#[async_trait]
impl ApiKeySource for StaticApiKey {
    async fn api_key(&self) -> CloudResult<String> {
        Ok(self.0.clone())
    }
}

/// Client for the upstream REST API
pub struct LambdaCloud {
    base_url: String,
    client: reqwest::Client,
    key_source: Arc<dyn ApiKeySource>,
}

impl LambdaCloud {
    pub fn new(base_url: impl Into<String>, key_source: Arc<dyn ApiKeySource>) -> CloudResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CloudError::Permanent(format!("http client init: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            key_source,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        timeout: Duration,
    ) -> CloudResult<T> {
        let response = self.send(method, path, body, timeout).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CloudError::Permanent(format!("invalid response from {}: {}", path, e)))
    }

    /// Like [`request`] but discards the body; DELETE responses are empty
    async fn request_no_body(
        &self,
        method: reqwest::Method,
        path: &str,
        timeout: Duration,
    ) -> CloudResult<()> {
        self.send(method, path, None, timeout).await?;
        Ok(())
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        timeout: Duration,
    ) -> CloudResult<reqwest::Response> {
        let api_key = self.key_source.api_key().await?;
        tracing::debug!(%method, path, "Upstream request");
        let mut builder = self
            .client
            .request(method, self.url(path))
            .basic_auth(&api_key, None::<&str>)
            .timeout(timeout);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| CloudError::Transient(format!("request to {} failed: {}", path, err)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = match response.json::<ErrorEnvelope>().await {
            Ok(envelope) => envelope.error.describe(),
            Err(_) => status.to_string(),
        };

        Err(match status.as_u16() {
            401 | 403 => CloudError::Unauthorized(detail),
            404 => CloudError::NotFound(detail),
            429 => CloudError::Transient(detail),
            code if code >= 500 => CloudError::Transient(detail),
            _ if is_already_exists(&detail) => CloudError::AlreadyExists(detail),
            _ => CloudError::Permanent(detail),
        })
    }
}

/// Duplicate-name rejections come back as generic 4xx with a recognizable
/// message; both key and filesystem creation hit this under concurrency
fn is_already_exists(detail: &str) -> bool {
    let detail = detail.to_lowercase();
    detail.contains("already exists") || detail.contains("already in use") || detail.contains("duplicate")
}

#[async_trait]
impl CloudProvider for LambdaCloud {
    async fn list_instance_types(&self) -> CloudResult<Vec<InstanceTypeInfo>> {
        let envelope: Envelope<std::collections::BTreeMap<String, WireInstanceTypeEntry>> = self
            .request(reqwest::Method::GET, "/instance-types", None, DATA_TIMEOUT)
            .await?;
        Ok(envelope
            .data
            .into_values()
            .map(|entry| InstanceTypeInfo {
                name: entry.instance_type.name,
                description: entry.instance_type.description.unwrap_or_default(),
                price_cents_per_hour: entry.instance_type.price_cents_per_hour,
                regions: entry
                    .regions_with_capacity_available
                    .into_iter()
                    .map(|r| r.name)
                    .collect(),
            })
            .collect())
    }

    async fn launch(&self, spec: &LaunchSpec) -> CloudResult<String> {
        let body = json!({
            "region_name": spec.region,
            "instance_type_name": spec.instance_type,
            "ssh_key_names": spec.ssh_key_names,
            "file_system_names": spec.filesystem_names,
            "name": spec.name,
            "user_data": spec.user_data,
        });
        let envelope: Envelope<WireLaunchData> = self
            .request(
                reqwest::Method::POST,
                "/instance-operations/launch",
                Some(body),
                LAUNCH_TIMEOUT,
            )
            .await?;
        envelope
            .data
            .instance_ids
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::Permanent("launch returned no instance id".into()))
    }

    async fn terminate(&self, instance_ids: &[String]) -> CloudResult<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let _: Envelope<serde_json::Value> = self
            .request(
                reqwest::Method::POST,
                "/instance-operations/terminate",
                Some(json!({ "instance_ids": instance_ids })),
                LAUNCH_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn restart(&self, instance_id: &str) -> CloudResult<()> {
        let _: Envelope<serde_json::Value> = self
            .request(
                reqwest::Method::POST,
                "/instance-operations/restart",
                Some(json!({ "instance_ids": [instance_id] })),
                LAUNCH_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> CloudResult<Option<InstanceInfo>> {
        let path = format!("/instances/{}", instance_id);
        match self
            .request::<Envelope<WireInstance>>(reqwest::Method::GET, &path, None, DATA_TIMEOUT)
            .await
        {
            Ok(envelope) => Ok(Some(envelope.data.into())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_instances(&self) -> CloudResult<Vec<InstanceInfo>> {
        let envelope: Envelope<Vec<WireInstance>> = self
            .request(reqwest::Method::GET, "/instances", None, DATA_TIMEOUT)
            .await?;
        Ok(envelope.data.into_iter().map(Into::into).collect())
    }

    async fn list_ssh_keys(&self) -> CloudResult<Vec<SshKeyInfo>> {
        let envelope: Envelope<Vec<WireSshKey>> = self
            .request(reqwest::Method::GET, "/ssh-keys", None, DATA_TIMEOUT)
            .await?;
        Ok(envelope.data.into_iter().map(Into::into).collect())
    }

    async fn add_ssh_key(&self, name: &str, public_key: &str) -> CloudResult<SshKeyInfo> {
        let body = json!({ "name": name, "public_key": public_key });
        match self
            .request::<Envelope<WireSshKey>>(reqwest::Method::POST, "/ssh-keys", Some(body), DATA_TIMEOUT)
            .await
        {
            Ok(envelope) => Ok(envelope.data.into()),
            Err(CloudError::AlreadyExists(_)) => {
                // Deterministic names make this a success; return the
                // record that won the race
                self.list_ssh_keys()
                    .await?
                    .into_iter()
                    .find(|key| key.name == name)
                    .ok_or_else(|| {
                        CloudError::Permanent(format!("key {} exists but is not listed", name))
                    })
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_ssh_key(&self, key_id: &str) -> CloudResult<()> {
        let path = format!("/ssh-keys/{}", key_id);
        match self
            .request_no_body(reqwest::Method::DELETE, &path, DATA_TIMEOUT)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn list_filesystems(&self) -> CloudResult<Vec<FilesystemInfo>> {
        let envelope: Envelope<Vec<WireFilesystem>> = self
            .request(reqwest::Method::GET, FILESYSTEMS_PATH, None, DATA_TIMEOUT)
            .await?;
        Ok(envelope.data.into_iter().map(Into::into).collect())
    }

    async fn create_filesystem(&self, name: &str, region: &str) -> CloudResult<FilesystemInfo> {
        let body = json!({ "name": name, "region": region });
        match self
            .request::<Envelope<WireFilesystem>>(
                reqwest::Method::POST,
                FILESYSTEMS_PATH,
                Some(body),
                DATA_TIMEOUT,
            )
            .await
        {
            Ok(envelope) => Ok(envelope.data.into()),
            Err(CloudError::AlreadyExists(_)) => self
                .list_filesystems()
                .await?
                .into_iter()
                .find(|fs| fs.name == name && fs.region == region)
                .ok_or_else(|| {
                    CloudError::Permanent(format!("filesystem {} exists but is not listed", name))
                }),
            Err(err) => Err(err),
        }
    }

    async fn delete_filesystem(&self, filesystem_id: &str) -> CloudResult<()> {
        let path = format!("{}/{}", FILESYSTEMS_PATH, filesystem_id);
        match self
            .request_no_body(reqwest::Method::DELETE, &path, DATA_TIMEOUT)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

// ── Wire shapes ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: WireError,
}

#[derive(Deserialize, Default)]
struct WireError {
    code: Option<String>,
    message: Option<String>,
}

impl WireError {
    fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "upstream error".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct WireInstanceTypeEntry {
    instance_type: WireInstanceType,
    #[serde(default)]
    regions_with_capacity_available: Vec<WireRegion>,
}

#[derive(Deserialize)]
struct WireInstanceType {
    name: String,
    description: Option<String>,
    price_cents_per_hour: i64,
}

#[derive(Deserialize)]
struct WireRegion {
    name: String,
}

#[derive(Deserialize)]
struct WireLaunchData {
    #[serde(default)]
    instance_ids: Vec<String>,
}

#[derive(Deserialize)]
struct WireInstance {
    id: String,
    status: VmStatus,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    region: Option<WireRegion>,
    #[serde(default)]
    instance_type: Option<WireInstanceBrief>,
}

#[derive(Deserialize)]
struct WireInstanceBrief {
    name: String,
    #[serde(default)]
    price_cents_per_hour: Option<i64>,
}

impl From<WireInstance> for InstanceInfo {
    fn from(wire: WireInstance) -> Self {
        InstanceInfo {
            id: wire.id,
            status: wire.status,
            region: wire.region.map(|r| r.name).unwrap_or_default(),
            instance_type: wire
                .instance_type
                .as_ref()
                .map(|t| t.name.clone())
                .unwrap_or_default(),
            ip_address: wire.ip,
            price_cents_per_hour: wire.instance_type.and_then(|t| t.price_cents_per_hour),
        }
    }
}

#[derive(Deserialize)]
struct WireSshKey {
    id: String,
    name: String,
    public_key: String,
}

impl From<WireSshKey> for SshKeyInfo {
    fn from(wire: WireSshKey) -> Self {
        SshKeyInfo {
            id: wire.id,
            name: wire.name,
            public_key: wire.public_key,
        }
    }
}

#[derive(Deserialize)]
struct WireFilesystem {
    id: String,
    name: String,
    #[serde(default)]
    region: Option<WireRegion>,
    #[serde(default)]
    mount_point: Option<String>,
    #[serde(default)]
    is_in_use: Option<bool>,
}

impl From<WireFilesystem> for FilesystemInfo {
    fn from(wire: WireFilesystem) -> Self {
        FilesystemInfo {
            id: wire.id,
            name: wire.name,
            region: wire.region.map(|r| r.name).unwrap_or_default(),
            mount_point: wire.mount_point,
            in_use: wire.is_in_use.unwrap_or(false),
        }
    }
}
