//! Cloud provider trait and error kinds

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{FilesystemInfo, InstanceInfo, InstanceTypeInfo, LaunchSpec, SshKeyInfo};

/// Result type alias for provider operations
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Upstream call failures, split by what the caller should do next
#[derive(Error, Debug)]
pub enum CloudError {
    /// Worth retrying later (timeouts, 5xx, rate limits)
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Retrying the same call will fail again
    #[error("permanent upstream error: {0}")]
    Permanent(String),

    /// The named resource already exists upstream
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The referenced resource does not exist upstream
    #[error("not found: {0}")]
    NotFound(String),

    /// The API key was rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<CloudError> for charon_core::Error {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Transient(msg) => charon_core::Error::UpstreamTransient(msg),
            CloudError::Permanent(msg) => charon_core::Error::UpstreamPermanent(msg),
            CloudError::AlreadyExists(msg) => charon_core::Error::Conflict(msg),
            CloudError::NotFound(msg) => charon_core::Error::NotFound(msg),
            CloudError::Unauthorized(msg) => charon_core::Error::UpstreamPermanent(msg),
        }
    }
}

/// Typed wrapper over the upstream GPU cloud API
///
/// Contract notes:
/// - `add_ssh_key` and `create_filesystem` return the existing resource
///   when the name is already taken; concurrent launches compute the same
///   deterministic names and must collapse onto one upstream record.
/// - `terminate` takes a batch so a reconciler tick issues one call for
///   the union of VMs it decided to kill.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Instance types with live per-region capacity
    async fn list_instance_types(&self) -> CloudResult<Vec<InstanceTypeInfo>>;

    /// Launch one instance; returns the upstream instance id
    async fn launch(&self, spec: &LaunchSpec) -> CloudResult<String>;

    /// Terminate a batch of instances
    async fn terminate(&self, instance_ids: &[String]) -> CloudResult<()>;

    /// Restart a running instance
    async fn restart(&self, instance_id: &str) -> CloudResult<()>;

    /// One instance by id, `None` when upstream no longer knows it
    async fn get_instance(&self, instance_id: &str) -> CloudResult<Option<InstanceInfo>>;

    /// All instances visible to the account
    async fn list_instances(&self) -> CloudResult<Vec<InstanceInfo>>;

    async fn list_ssh_keys(&self) -> CloudResult<Vec<SshKeyInfo>>;

    /// Register a key; an existing key under the same name is a success
    async fn add_ssh_key(&self, name: &str, public_key: &str) -> CloudResult<SshKeyInfo>;

    async fn delete_ssh_key(&self, key_id: &str) -> CloudResult<()>;

    async fn list_filesystems(&self) -> CloudResult<Vec<FilesystemInfo>>;

    /// Create a filesystem; an existing (name, region) is a success
    async fn create_filesystem(&self, name: &str, region: &str) -> CloudResult<FilesystemInfo>;

    async fn delete_filesystem(&self, filesystem_id: &str) -> CloudResult<()>;
}
