//! Deterministic resource names
//!
//! Upstream SSH keys and filesystems are named from the user's email, so a
//! retry or a concurrent launch computes the same name and collapses onto
//! the same upstream record instead of creating a duplicate.

/// Longest sanitized email fragment used inside generated names
const MAX_SANITIZED_LEN: usize = 40;

/// Lowercase an email and reduce it to `[a-z0-9-]`
///
/// Runs of non-alphanumeric characters collapse to a single `-`; leading
/// and trailing separators are trimmed; the result is length-bounded.
pub fn sanitize_email(email: &str) -> String {
    let mut out = String::with_capacity(email.len());
    let mut last_was_dash = true; // suppress a leading dash
    for c in email.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out.truncate(MAX_SANITIZED_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Deterministic upstream SSH key name for a user: `web-<sanitized>`
pub fn ssh_key_name(email: &str) -> String {
    format!("web-{}", sanitize_email(email))
}

/// Personal filesystem name for a user in a region: `fs-<sanitized>-<region>`
pub fn personal_fs_name(email: &str, region: &str) -> String {
    format!("fs-{}-{}", sanitize_email(email), region)
}

/// Prefix matching all personal filesystems of one user, any region
pub fn personal_fs_prefix(email: &str) -> String {
    format!("fs-{}-", sanitize_email(email))
}
