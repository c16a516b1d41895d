//! Control-plane records
//!
//! Every record is a plain value serialized as a self-describing JSON
//! document with camelCase field names, so documents written by earlier
//! deployments keep deserializing. Timestamps are UTC; money is integer
//! cents, prices are integer cents per hour.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Candidate role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular allow-listed user
    Candidate,
    /// Operator with unrestricted visibility
    Admin,
}

/// A user on the allow-list with a dollar quota
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Lowercased email, primary key
    pub email: String,

    /// Display name from the identity provider
    pub name: String,

    pub role: Role,

    /// Budget ceiling in whole dollars
    pub quota_dollars: i64,

    /// Cached spend in cents; authoritative value is recomputed from VMs
    pub spent_cents: i64,

    pub added_at: DateTime<Utc>,

    /// Email of the admin who added this candidate, or "bootstrap"
    pub added_by: String,

    /// VMs launched before this instant are excluded from spend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spent_reset_at: Option<DateTime<Utc>>,

    /// Set instead of deleting the record when an admin removes the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }

    /// Quota in cents
    pub fn quota_cents(&self) -> i64 {
        self.quota_dollars * 100
    }
}

/// Upstream instance status
///
/// Wire values follow the provider's strings; anything unrecognized maps to
/// `Unknown` so new upstream states never break deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Launching,
    Booting,
    Active,
    Unhealthy,
    Restarting,
    Terminating,
    Terminated,
    #[serde(other)]
    Unknown,
}

/// Why a VM was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// User asked for it through the API
    UserRequested,
    /// Candidate spend reached the quota
    QuotaExceeded,
    /// Candidate was removed or deactivated
    AccountRemoved,
    /// Upstream no longer reports the instance
    TerminatedExternally,
    /// Optional max-hours policy fired
    MaxHoursExceeded,
}

/// A provisioned upstream GPU instance, tracked locally by id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    /// Upstream instance id, primary key
    pub instance_id: String,

    pub candidate_email: String,

    pub instance_type: String,

    pub region: String,

    /// Price at dispatch time; accrual always uses this snapshot
    pub price_cents_per_hour: i64,

    pub launched_at: DateTime<Utc>,

    pub status: VmStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    pub ssh_key_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,

    /// Cost accrued so far, maintained by the reconciler
    #[serde(default)]
    pub accrued_cents: i64,
}

impl Vm {
    /// A VM is active until `terminated_at` is set
    pub fn is_active(&self) -> bool {
        self.terminated_at.is_none()
    }
}

/// Launch request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchRequestStatus {
    Queued,
    Provisioning,
    Fulfilled,
    Cancelled,
    Failed,
}

/// A user's request for one VM out of acceptable (type, region) choices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    /// Random uuid, primary key
    pub id: String,

    pub candidate_email: String,

    /// Acceptable instance types, in preference order
    pub instance_types: Vec<String>,

    /// Acceptable regions, in preference order
    pub regions: Vec<String>,

    pub ssh_public_key: String,

    /// Whether to attach the user's personal filesystem
    #[serde(default)]
    pub attach_filesystem: bool,

    pub status: LaunchRequestStatus,

    pub created_at: DateTime<Utc>,

    /// Dispatch attempts that found no capacity
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_instance_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl LaunchRequest {
    /// Terminal states are never mutated again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            LaunchRequestStatus::Fulfilled
                | LaunchRequestStatus::Cancelled
                | LaunchRequestStatus::Failed
        )
    }

    /// Queued or provisioning, i.e. counts against the one-in-flight guard
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            LaunchRequestStatus::Queued | LaunchRequestStatus::Provisioning
        )
    }
}

/// An SSH public key registered upstream on behalf of a user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyRecord {
    pub email: String,
    pub key_name: String,
    pub public_key: String,
    pub registered_at: DateTime<Utc>,
}

impl SshKeyRecord {
    /// Store key: `email|keyName`
    pub fn store_key(email: &str, key_name: &str) -> String {
        format!("{}|{}", email, key_name)
    }
}

/// Seed progress for one (filesystem, region)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedState {
    Seeding,
    Ready,
}

/// Single-writer claim record for shared-filesystem seeding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedStatus {
    pub filesystem_name: String,
    pub region: String,
    pub status: SeedState,

    /// Loader VM holding the claim, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeding_instance_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SeedStatus {
    /// Store key: `filesystemName|region`
    pub fn store_key(filesystem_name: &str, region: &str) -> String {
        format!("{}|{}", filesystem_name, region)
    }
}

/// Credential shape for a seed source
///
/// The two supported object stores come with different credential material,
/// so the variant carries it inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SeedSource {
    /// S3-compatible store, fetched with the aws cli
    #[serde(rename_all = "camelCase")]
    S3 {
        access_key_id: String,
        secret_access_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint_url: Option<String>,
    },
    /// Google Cloud Storage, fetched with gsutil
    #[serde(rename_all = "camelCase")]
    Gcs { service_account_json: String },
}

/// A shared filesystem auto-created and seeded in each region on first use
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultFilesystem {
    /// Filesystem name; also the last path segment of the mount point
    pub name: String,

    /// Source tree to download, e.g. `s3://bucket/prefix`
    pub source_url: String,

    pub source: SeedSource,

    /// Admin override for the download commands; receives `$NFS_PATH` and
    /// `$CREDS_FILE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_script: Option<String>,
}

/// Singleton settings record, mutated only via the admin settings endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Upstream API key; used as the Basic-auth username
    #[serde(default)]
    pub lambda_api_key: String,

    /// Post-boot setup script injected into every user VM
    #[serde(default)]
    pub setup_script: String,

    #[serde(default)]
    pub default_filesystems: Vec<DefaultFilesystem>,

    /// Bearer secret for seed-complete callbacks; generated once at startup
    #[serde(default)]
    pub seed_complete_secret: String,
}
