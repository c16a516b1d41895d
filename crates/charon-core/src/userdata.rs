//! Boot script composition
//!
//! Two scripts leave the control plane: the user VM's cloud-init user data
//! (admin setup script plus read-only remounts for shared filesystems) and
//! the loader VM script that populates a shared filesystem and reports
//! completion. Both are plain bash under `set -euo pipefail`.

use crate::model::SeedSource;

/// Where the provider mounts network filesystems on every VM
pub const MOUNT_ROOT: &str = "/lambda/nfs";

/// Remote path of the seed-complete callback
pub const SEED_COMPLETE_PATH: &str = "/api/seed-complete";

/// Mount path of a named filesystem on a VM
pub fn mount_path(filesystem_name: &str) -> String {
    format!("{}/{}", MOUNT_ROOT, filesystem_name)
}

/// Drop a leading `#!...` line so scripts can be spliced into a wrapper
pub fn strip_shebang(script: &str) -> &str {
    if script.starts_with("#!") {
        match script.find('\n') {
            Some(pos) => &script[pos + 1..],
            None => "",
        }
    } else {
        script
    }
}

/// One remount-read-only command for a shared filesystem
pub fn remount_readonly_command(filesystem_name: &str) -> String {
    format!("sudo mount -o remount,ro {}", mount_path(filesystem_name))
}

/// Compose the user VM's user data
///
/// The admin setup script runs first (its own shebang stripped), then the
/// resolver's read-only remounts for shared filesystems. Either part may be
/// empty.
pub fn compose_user_data(setup_script: &str, remount_script: &str) -> String {
    let mut out = String::from("#!/bin/bash\nset -euo pipefail\n");
    let setup = strip_shebang(setup_script).trim();
    if !setup.is_empty() {
        out.push('\n');
        out.push_str(setup);
        out.push('\n');
    }
    let remounts = remount_script.trim();
    if !remounts.is_empty() {
        out.push('\n');
        out.push_str(remounts);
        out.push('\n');
    }
    out
}

/// Everything the loader VM script needs baked in
pub struct LoaderScript<'a> {
    pub filesystem_name: &'a str,
    pub region: &'a str,
    pub source_url: &'a str,
    pub source: &'a SeedSource,
    /// Admin override for the fetch step; sees `$NFS_PATH` and `$CREDS_FILE`
    pub download_script: Option<&'a str>,
    pub app_base_url: &'a str,
    pub seed_complete_secret: &'a str,
}

impl LoaderScript<'_> {
    /// Render the loader VM user data
    ///
    /// The script downloads the source tree into the mount path, reports
    /// completion to the control plane, remounts the filesystem read-only,
    /// and powers the VM off. The completion callback runs before shutdown
    /// so the control plane can mark the filesystem ready even if the
    /// instance lingers.
    pub fn render(&self) -> String {
        let mut script = String::from("#!/bin/bash\nset -euo pipefail\n\n");
        script.push_str(&format!("NFS_PATH={}\n", mount_path(self.filesystem_name)));
        script.push_str("CREDS_FILE=/root/.seed-credentials\n");
        script.push_str("export NFS_PATH CREDS_FILE\n\n");

        script.push_str(&self.credentials_block());
        script.push('\n');

        match self.download_script {
            Some(custom) => {
                script.push_str(strip_shebang(custom).trim());
                script.push('\n');
            }
            None => script.push_str(&self.default_download_block()),
        }

        script.push('\n');
        script.push_str(&self.completion_block());
        script.push_str("sudo mount -o remount,ro \"$NFS_PATH\"\n");
        script.push_str("sudo shutdown -h now\n");
        script
    }

    fn credentials_block(&self) -> String {
        match self.source {
            SeedSource::S3 {
                access_key_id,
                secret_access_key,
                endpoint_url,
            } => {
                let mut block = String::from("cat > \"$CREDS_FILE\" <<'CREDS'\n");
                block.push_str(&format!("export AWS_ACCESS_KEY_ID={}\n", access_key_id));
                block.push_str(&format!("export AWS_SECRET_ACCESS_KEY={}\n", secret_access_key));
                if let Some(endpoint) = endpoint_url {
                    block.push_str(&format!("export AWS_ENDPOINT_URL={}\n", endpoint));
                }
                block.push_str("CREDS\nchmod 600 \"$CREDS_FILE\"\n");
                block
            }
            SeedSource::Gcs {
                service_account_json,
            } => {
                format!(
                    "cat > \"$CREDS_FILE\" <<'CREDS'\n{}\nCREDS\nchmod 600 \"$CREDS_FILE\"\n",
                    service_account_json.trim()
                )
            }
        }
    }

    fn default_download_block(&self) -> String {
        match self.source {
            SeedSource::S3 { endpoint_url, .. } => {
                let endpoint_flag = match endpoint_url {
                    Some(_) => " --endpoint-url \"$AWS_ENDPOINT_URL\"",
                    None => "",
                };
                format!(
                    concat!(
                        "if ! command -v aws >/dev/null; then sudo apt-get update -qq && sudo apt-get install -y -qq awscli; fi\n",
                        ". \"$CREDS_FILE\"\n",
                        "aws s3 sync{} \"{}\" \"$NFS_PATH\"\n",
                    ),
                    endpoint_flag, self.source_url
                )
            }
            SeedSource::Gcs { .. } => format!(
                concat!(
                    "command -v gsutil >/dev/null || curl -sSL https://sdk.cloud.google.com | bash >/dev/null\n",
                    "gcloud auth activate-service-account --key-file=\"$CREDS_FILE\"\n",
                    "gsutil -m rsync -r \"{}\" \"$NFS_PATH\"\n",
                ),
                self.source_url
            ),
        }
    }

    fn completion_block(&self) -> String {
        let body = serde_json::json!({
            "filesystemName": self.filesystem_name,
            "region": self.region,
        });
        format!(
            concat!(
                "curl -fsS -X POST \\\n",
                "  -H \"Authorization: Bearer {}\" \\\n",
                "  -H \"Content-Type: application/json\" \\\n",
                "  -d '{}' \\\n",
                "  \"{}{}\"\n",
            ),
            self.seed_complete_secret,
            body,
            self.app_base_url.trim_end_matches('/'),
            SEED_COMPLETE_PATH
        )
    }
}
