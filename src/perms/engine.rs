//! Effective-rights computation.
//!
//! For a (principal, path) pair the engine walks every directory from
//! the datasites root down to the target's parent, loads the policy
//! file in each (with an mtime-keyed parse cache), applies the terminal
//! cut, evaluates rules in declared order, then closes over the tier
//! hierarchy and the owner override.

use super::glob::glob_match;
use super::policy::{
    parse_legacy_policy, parse_policy, PolicyFile, LEGACY_POLICY_FILENAME, POLICY_FILENAME,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::warn;

/// The four access tiers, ordered. Each tier implies all lower ones:
/// admin > write > create > read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Read,
    Create,
    Write,
    Admin,
}

/// Computed rights for one (principal, path) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputedPermission {
    pub read: bool,
    pub create: bool,
    pub write: bool,
    pub admin: bool,
}

impl ComputedPermission {
    pub fn has(&self, level: AccessLevel) -> bool {
        match level {
            AccessLevel::Read => self.read,
            AccessLevel::Create => self.create,
            AccessLevel::Write => self.write,
            AccessLevel::Admin => self.admin,
        }
    }

    /// Close over the hierarchy: admin grants write, write grants
    /// create, create grants read.
    fn close_hierarchy(&mut self) {
        if self.admin {
            self.write = true;
        }
        if self.write {
            self.create = true;
        }
        if self.create {
            self.read = true;
        }
    }
}

struct CachedPolicy {
    mtime: SystemTime,
    /// `None` when the file was malformed and is being skipped.
    policy: Option<Arc<PolicyFile>>,
}

/// The permissions engine.
///
/// Policy files are read-only from the engine's perspective; parses are
/// cached keyed by file modification time.
pub struct PermissionEngine {
    datasites_root: PathBuf,
    /// Transparently map legacy `syftperm.yaml` files into the newer
    /// schema. Explicit constructor field rather than a process global.
    auto_convert_legacy: bool,
    cache: RwLock<HashMap<PathBuf, CachedPolicy>>,
}

impl PermissionEngine {
    pub fn new(datasites_root: impl Into<PathBuf>, auto_convert_legacy: bool) -> Self {
        Self {
            datasites_root: datasites_root.into(),
            auto_convert_legacy,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn datasites_root(&self) -> &Path {
        &self.datasites_root
    }

    /// Compute effective rights of `principal` on `rel_path` (relative
    /// to the datasites root).
    pub fn compute(&self, principal: &str, rel_path: &Path) -> ComputedPermission {
        let mut perm = ComputedPermission::default();

        // Queries are always relative to the datasites root; an
        // absolute path is a caller bug and grants nothing.
        if syftbox_types::ensure_relative(rel_path).is_err() {
            warn!(
                "permission query with absolute path {}, denying",
                rel_path.display()
            );
            return perm;
        }

        // Policy chain: the datasites root itself, then every ancestor
        // directory of the target, root-downward.
        let chain = self.policy_chain(rel_path);

        // Terminal cut: only the deepest terminal policy and everything
        // below it contribute.
        let start = chain
            .iter()
            .rposition(|(_, policy)| policy.terminal)
            .unwrap_or(0);

        for (policy_dir, policy) in &chain[start..] {
            // Glob patterns are anchored at the policy file's directory.
            let Ok(target) = rel_path.strip_prefix(policy_dir) else {
                continue;
            };
            let target = target.to_string_lossy().replace('\\', "/");
            for rule in &policy.rules {
                if !glob_match(&rule.pattern, &target) {
                    continue;
                }
                if rule.access.grants("read", principal) {
                    perm.read = rule.allow;
                }
                if rule.access.grants("create", principal) {
                    perm.create = rule.allow;
                }
                if rule.access.grants("write", principal) {
                    perm.write = rule.allow;
                }
                if rule.access.grants("admin", principal) {
                    perm.admin = rule.allow;
                }
            }
        }

        // Owner override: the datasite owning the subtree always holds
        // admin, regardless of what any policy says.
        if let Some(owner) = rel_path.components().next() {
            if owner.as_os_str() == principal {
                perm.admin = true;
            }
        }

        perm.close_hierarchy();
        perm
    }

    /// Collect the parsed policies at every level from the root to the
    /// target's parent directory, paired with the policy file's
    /// directory relative to the datasites root.
    fn policy_chain(&self, rel_path: &Path) -> Vec<(PathBuf, Arc<PolicyFile>)> {
        let mut chain = Vec::new();
        let mut level = PathBuf::new();

        if let Some(policy) = self.policy_at(&level) {
            chain.push((level.clone(), policy));
        }

        if let Some(parent) = rel_path.parent() {
            for component in parent.components() {
                level.push(component);
                if let Some(policy) = self.policy_at(&level) {
                    chain.push((level.clone(), policy));
                }
            }
        }

        chain
    }

    /// Load the policy in one directory, going through the mtime cache.
    fn policy_at(&self, rel_dir: &Path) -> Option<Arc<PolicyFile>> {
        let dir = self.datasites_root.join(rel_dir);
        let current_path = dir.join(POLICY_FILENAME);
        let legacy_path = dir.join(LEGACY_POLICY_FILENAME);

        let (path, legacy) = if current_path.exists() {
            (current_path, false)
        } else if self.auto_convert_legacy && legacy_path.exists() {
            (legacy_path, true)
        } else {
            return None;
        };

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;

        if let Some(cached) = self.cache.read().ok()?.get(&path) {
            if cached.mtime == mtime {
                return cached.policy.clone();
            }
        }

        let policy = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let parsed = if legacy {
                    parse_legacy_policy(&content, &path)
                } else {
                    parse_policy(&content, &path)
                };
                match parsed {
                    Ok(policy) => Some(Arc::new(policy)),
                    Err(e) => {
                        // A malformed file is skipped; the rest of the
                        // chain still applies.
                        warn!("skipping policy file: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("failed to read policy file {}: {}", path.display(), e);
                None
            }
        };

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                path,
                CachedPolicy {
                    mtime,
                    policy: policy.clone(),
                },
            );
        }

        policy
    }
}
