//! Domain-facing types for the upstream cloud
//!
//! These are what the rest of the control plane sees; the raw wire shapes
//! live next to the HTTP client.

use charon_core::model::VmStatus;
use serde::{Deserialize, Serialize};

/// An instance type together with the regions that currently have capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeInfo {
    pub name: String,
    pub description: String,
    pub price_cents_per_hour: i64,
    /// Regions with capacity available right now
    pub regions: Vec<String>,
}

impl InstanceTypeInfo {
    pub fn has_capacity_in(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r == region)
    }
}

/// A live upstream instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: String,
    pub status: VmStatus,
    pub region: String,
    pub instance_type: String,
    pub ip_address: Option<String>,
    pub price_cents_per_hour: Option<i64>,
}

/// A registered SSH key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyInfo {
    pub id: String,
    pub name: String,
    pub public_key: String,
}

/// A persistent network filesystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemInfo {
    pub id: String,
    pub name: String,
    pub region: String,
    pub mount_point: Option<String>,
    pub in_use: bool,
}

/// Everything needed to launch one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub region: String,
    pub instance_type: String,
    pub ssh_key_names: Vec<String>,
    pub filesystem_names: Vec<String>,
    /// Display name shown in the upstream console
    pub name: Option<String>,
    pub user_data: Option<String>,
}
