//! Application configuration
//!
//! Loaded from a YAML file with `CHARON_*` environment overrides on top, so
//! a container deployment can run file-less.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{Error, Result};

/// Quota granted to auto-bootstrapped admin candidates
pub const ADMIN_BOOTSTRAP_QUOTA_DOLLARS: i64 = 9999;

/// Control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Listen address for the HTTP API
    pub bind_addr: String,

    /// Public base URL, used in loader-VM callback URLs
    pub base_url: String,

    /// Root directory of the file-backed state store
    pub data_dir: PathBuf,

    /// Emails that auto-bootstrap as admins on first sign-in
    pub admin_emails: Vec<String>,

    /// JWKS document used to verify bearer tokens
    pub jwks_url: String,

    /// Expected `iss` claim; unchecked when unset
    pub jwt_issuer: Option<String>,

    /// Expected `aud` claim; unchecked when unset
    pub jwt_audience: Option<String>,

    /// Reconciler tick period
    pub reconcile_interval_secs: u64,

    /// Age after which a `seeding` claim is considered abandoned
    pub seed_stale_minutes: i64,

    /// Optional hard runtime ceiling per VM; off by default
    pub max_vm_hours: Option<i64>,

    /// Upstream API base URL
    pub provider_base_url: String,

    /// Use the in-process local cloud instead of the upstream API
    pub local_cloud: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            base_url: "http://localhost:8080".to_string(),
            data_dir: PathBuf::from("charon-data"),
            admin_emails: Vec::new(),
            jwks_url: String::new(),
            jwt_issuer: None,
            jwt_audience: None,
            reconcile_interval_secs: 60,
            seed_stale_minutes: 60,
            max_vm_hours: None,
            provider_base_url: "https://cloud.lambdalabs.com/api/v1".to_string(),
            local_cloud: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from an explicit file
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::validation(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(path).await?;
        let mut config: AppConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::validation(format!("invalid config: {}", e)))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from the default locations, falling back to defaults + env
    pub async fn load_default() -> Result<Self> {
        let local = PathBuf::from("charon.yaml");
        if local.exists() {
            return Self::load_from_file(&local).await;
        }
        if let Ok(home) = std::env::var("HOME") {
            let global = PathBuf::from(home).join(".charon/config.yaml");
            if global.exists() {
                return Self::load_from_file(&global).await;
            }
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `CHARON_*` environment variables over the loaded values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CHARON_BIND") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("CHARON_BASE_URL") {
            self.base_url = v;
        }
        if let Ok(v) = std::env::var("CHARON_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHARON_ADMIN_EMAILS") {
            self.admin_emails = v
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("CHARON_JWKS_URL") {
            self.jwks_url = v;
        }
        if let Ok(v) = std::env::var("CHARON_JWT_ISSUER") {
            self.jwt_issuer = Some(v);
        }
        if let Ok(v) = std::env::var("CHARON_JWT_AUDIENCE") {
            self.jwt_audience = Some(v);
        }
        if let Ok(v) = std::env::var("CHARON_RECONCILE_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.reconcile_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("CHARON_MAX_VM_HOURS") {
            self.max_vm_hours = v.parse().ok();
        }
        if let Ok(v) = std::env::var("CHARON_PROVIDER_URL") {
            self.provider_base_url = v;
        }
        if let Ok(v) = std::env::var("CHARON_LOCAL_CLOUD") {
            self.local_cloud = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Whether an email is on the configured admin bootstrap list
    pub fn is_admin_email(&self, email: &str) -> bool {
        let email = email.to_lowercase();
        self.admin_emails.iter().any(|e| *e == email)
    }
}
