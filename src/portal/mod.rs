//! Portal Permissions (§4.2): resolves a portal alias to its filesystem
//! root and enforces the agent allowlist + security mode before any
//! executor is allowed to touch it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{PortalSpec, SecurityMode};
use crate::errors::{Result, RunnerError};

/// The kind of access an executor wants against a portal's working tree,
/// checked against the portal's subprocess-sandbox permission profile
/// (§4.2): `sandboxed` permits neither read nor write, `hybrid` permits
/// read only. `Git` covers the runner-level audit/revert pass, which runs
/// outside the sandboxed subprocess and is always permitted once the agent
/// check passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Git,
}

/// The registry built once from `RunnerConfig.portals`, plus a per-portal
/// mutex so a single writer touches a given portal's working tree at a
/// time (§4.8 wants git audit/revert serialized against concurrent steps).
pub struct PortalRegistry {
    portals: HashMap<String, PortalSpec>,
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl PortalRegistry {
    pub fn new(portals: HashMap<String, PortalSpec>) -> Self {
        let locks = portals
            .keys()
            .map(|alias| (alias.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self { portals, locks }
    }

    pub fn get(&self, alias: &str) -> Result<&PortalSpec> {
        self.portals
            .get(alias)
            .ok_or_else(|| RunnerError::PortalNotFound {
                portal: alias.to_string(),
            })
    }

    pub fn root(&self, alias: &str) -> Result<&Path> {
        Ok(self.get(alias)?.path.as_path())
    }

    pub fn security_mode(&self, alias: &str) -> Result<SecurityMode> {
        Ok(self.get(alias)?.security_mode)
    }

    /// The mutex serializing writers against this portal. Returns `None`
    /// for an alias that was never registered; callers should treat that
    /// the same as `PortalNotFound` from `get`.
    pub fn lock_for(&self, alias: &str) -> Option<Arc<Mutex<()>>> {
        self.locks.get(alias).cloned()
    }

    /// Checks whether `agent_id` may run on `portal`. A portal with no
    /// `allowed_agents` entries admits nobody; `"*"` admits any agent.
    pub fn check_agent(&self, portal: &str, agent_id: &str) -> Result<()> {
        let spec = self.get(portal)?;
        let allowed = spec
            .allowed_agents
            .iter()
            .any(|allowed| allowed == "*" || allowed == agent_id);
        if allowed {
            Ok(())
        } else {
            Err(RunnerError::PermissionDenied {
                agent: agent_id.to_string(),
                portal: portal.to_string(),
                reason: Some("agent not in portal allowlist".to_string()),
            })
        }
    }

    /// Checks whether `agent_id` may perform `op` against `portal`. Always
    /// runs `check_agent` first — an operation is never granted to an agent
    /// that fails the allowlist check, regardless of mode.
    pub fn check_operation(&self, portal: &str, agent_id: &str, op: Operation) -> Result<()> {
        self.check_agent(portal, agent_id)?;
        let mode = self.security_mode(portal)?;
        let denied = |reason: &str| {
            Err(RunnerError::PermissionDenied {
                agent: agent_id.to_string(),
                portal: portal.to_string(),
                reason: Some(reason.to_string()),
            })
        };
        match (op, mode) {
            (Operation::Git, _) => Ok(()),
            (Operation::Read, SecurityMode::Hybrid) => Ok(()),
            (Operation::Read, SecurityMode::Sandboxed) => {
                denied("sandboxed portals permit no filesystem access")
            }
            (Operation::Write, _) => denied("portal filesystem is read-only to agents"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(allowed_agents: Vec<&str>, mode: SecurityMode) -> PortalSpec {
        PortalSpec {
            path: PathBuf::from("/tmp/portal"),
            allowed_agents: allowed_agents.into_iter().map(String::from).collect(),
            security_mode: mode,
        }
    }

    fn registry() -> PortalRegistry {
        let mut portals = HashMap::new();
        portals.insert("alpha".to_string(), spec(vec!["reviewer"], SecurityMode::Sandboxed));
        portals.insert("beta".to_string(), spec(vec!["*"], SecurityMode::Hybrid));
        PortalRegistry::new(portals)
    }

    #[test]
    fn allows_agent_on_explicit_allowlist() {
        assert!(registry().check_agent("alpha", "reviewer").is_ok());
    }

    #[test]
    fn denies_agent_not_on_allowlist() {
        let err = registry().check_agent("alpha", "intruder").unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[test]
    fn wildcard_allows_any_agent() {
        assert!(registry().check_agent("beta", "anyone").is_ok());
    }

    #[test]
    fn unknown_portal_is_not_found() {
        let err = registry().check_agent("missing", "reviewer").unwrap_err();
        assert_eq!(err.kind(), "portal_not_found");
    }

    #[test]
    fn each_portal_gets_its_own_lock() {
        let registry = registry();
        let alpha = registry.lock_for("alpha").unwrap();
        let beta = registry.lock_for("beta").unwrap();
        assert!(!Arc::ptr_eq(&alpha, &beta));
    }

    #[tokio::test]
    async fn lock_serializes_concurrent_access() {
        let registry = registry();
        let lock = registry.lock_for("alpha").unwrap();
        let _guard = lock.lock().await;
        let lock2 = registry.lock_for("alpha").unwrap();
        assert!(lock2.try_lock().is_err());
    }

    #[test]
    fn sandboxed_portal_denies_read_and_write() {
        let registry = registry();
        assert_eq!(
            registry
                .check_operation("alpha", "reviewer", Operation::Read)
                .unwrap_err()
                .kind(),
            "permission_denied"
        );
        assert_eq!(
            registry
                .check_operation("alpha", "reviewer", Operation::Write)
                .unwrap_err()
                .kind(),
            "permission_denied"
        );
    }

    #[test]
    fn hybrid_portal_allows_read_denies_write() {
        let registry = registry();
        assert!(registry.check_operation("beta", "anyone", Operation::Read).is_ok());
        assert!(registry.check_operation("beta", "anyone", Operation::Write).is_err());
    }

    #[test]
    fn git_operation_allowed_in_either_mode_once_agent_passes() {
        let registry = registry();
        assert!(registry.check_operation("alpha", "reviewer", Operation::Git).is_ok());
        assert!(registry.check_operation("beta", "anyone", Operation::Git).is_ok());
    }

    #[test]
    fn operation_check_fails_agent_check_before_mode_check() {
        let registry = registry();
        let err = registry
            .check_operation("alpha", "intruder", Operation::Git)
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }
}
