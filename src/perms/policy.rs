//! Policy file parsing.
//!
//! The current format is `syft.pub.yaml`; the legacy `syftperm.yaml`
//! (a flat list of path/user/permissions entries) is mapped into the
//! newer schema when auto-conversion is enabled. Unknown fields are
//! ignored in both formats.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Filename of the current policy format.
pub const POLICY_FILENAME: &str = "syft.pub.yaml";
/// Filename of the legacy policy format.
pub const LEGACY_POLICY_FILENAME: &str = "syftperm.yaml";

/// The wildcard principal.
pub const WILDCARD: &str = "*";

/// Error type for policy parsing.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("malformed policy file {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// A parsed policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    /// When set, policies in ancestor directories no longer apply to
    /// anything at or below this directory.
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// One rule: a glob, an access map, and an allow flag. Rules apply in
/// declared order; later matches override earlier ones per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    #[serde(default)]
    pub access: AccessMap,
    /// `false` makes a matching rule an explicit deny.
    #[serde(default = "default_allow")]
    pub allow: bool,
}

fn default_allow() -> bool {
    true
}

/// Principals per access tier. `*` grants to everyone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessMap {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admin: Vec<String>,
}

impl AccessMap {
    fn tier(&self, name: &str) -> &[String] {
        match name {
            "read" => &self.read,
            "create" => &self.create,
            "write" => &self.write,
            "admin" => &self.admin,
            _ => &[],
        }
    }

    /// True if `principal` (or the wildcard) is listed in `tier`.
    pub fn grants(&self, tier: &str, principal: &str) -> bool {
        self.tier(tier)
            .iter()
            .any(|p| p == WILDCARD || p == principal)
    }
}

/// One entry of the legacy `syftperm.yaml` format.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyEntry {
    pub path: String,
    pub user: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Parse the current policy format.
pub fn parse_policy(content: &str, path: &Path) -> Result<PolicyFile, PolicyError> {
    serde_yaml::from_str(content).map_err(|e| PolicyError::Malformed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Parse a legacy policy file and convert it into the newer schema.
///
/// Each legacy entry becomes one rule with the same pattern, the same
/// user, and the union of its listed permissions.
pub fn parse_legacy_policy(content: &str, path: &Path) -> Result<PolicyFile, PolicyError> {
    let entries: Vec<LegacyEntry> =
        serde_yaml::from_str(content).map_err(|e| PolicyError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(convert_legacy(entries))
}

fn convert_legacy(entries: Vec<LegacyEntry>) -> PolicyFile {
    let rules = entries
        .into_iter()
        .map(|entry| {
            let mut access = AccessMap::default();
            for perm in &entry.permissions {
                let user = entry.user.clone();
                match perm.as_str() {
                    "read" => access.read.push(user),
                    "create" => access.create.push(user),
                    "write" => access.write.push(user),
                    "admin" => access.admin.push(user),
                    // unknown permission names are ignored
                    _ => {}
                }
            }
            PolicyRule {
                pattern: entry.path,
                access,
                allow: true,
            }
        })
        .collect();
    PolicyFile {
        terminal: false,
        rules,
    }
}
