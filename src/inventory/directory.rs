// Host directory: the console's record of which hosts belong to the cluster

use std::path::Path;

use parking_lot::RwLock;
use serde::Deserialize;

use super::{Host, HostRole, InventorySnapshot};
use crate::output::errors::OpsError;

/// Source of truth for known hosts.
///
/// Membership changes (`add_host`/`remove_host`) are only issued from
/// mutating operations, which run under the exclusive configuration lock.
pub trait HostDirectory: Send + Sync {
    /// Hosts in directory order, optionally filtered by role
    fn list_hosts(&self, role: Option<HostRole>) -> Result<Vec<Host>, OpsError>;

    fn find(&self, name: &str) -> Result<Option<Host>, OpsError> {
        Ok(self.list_hosts(None)?.into_iter().find(|h| h.name == name))
    }

    fn add_host(&self, host: Host) -> Result<(), OpsError>;

    fn remove_host(&self, name: &str) -> Result<Option<Host>, OpsError>;

    /// Snapshot of every known host
    fn snapshot(&self) -> Result<InventorySnapshot, OpsError> {
        Ok(InventorySnapshot::from_hosts(self.list_hosts(None)?))
    }
}

/// In-memory directory, optionally seeded from a YAML file
#[derive(Debug, Default)]
pub struct StaticDirectory {
    hosts: RwLock<Vec<Host>>,
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    defaults: DirectoryDefaults,
    #[serde(default)]
    hosts: Vec<Host>,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryDefaults {
    user: Option<String>,
    port: Option<u16>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        StaticDirectory::default()
    }

    pub fn with_hosts(hosts: impl IntoIterator<Item = Host>) -> Self {
        let snapshot = InventorySnapshot::from_hosts(hosts);
        StaticDirectory {
            hosts: RwLock::new(snapshot.hosts().to_vec()),
        }
    }

    /// Load a directory from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, OpsError> {
        let content = std::fs::read_to_string(path).map_err(|e| OpsError::Io {
            message: format!("Failed to read host directory: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        Self::parse_str(&content)
    }

    /// Parse a directory from YAML of the form `{ defaults: {user, port}, hosts: [...] }`
    pub fn parse_str(content: &str) -> Result<Self, OpsError> {
        let file: DirectoryFile = serde_yaml::from_str(content).map_err(|e| OpsError::Inventory {
            message: format!("Invalid host directory YAML: {}", e),
            suggestion: Some(
                "Each host needs at least 'name', 'address' and 'role'".to_string(),
            ),
        })?;

        let mut snapshot = InventorySnapshot::default();
        for mut host in file.hosts {
            if host.user.is_empty() {
                if let Some(user) = &file.defaults.user {
                    host.user = user.clone();
                }
            }
            if let Some(port) = file.defaults.port {
                if host.port == 22 {
                    host.port = port;
                }
            }

            let name = host.name.clone();
            if !snapshot.insert(host) {
                return Err(OpsError::Inventory {
                    message: format!("Duplicate host '{}' in host directory", name),
                    suggestion: None,
                });
            }
        }

        Ok(StaticDirectory {
            hosts: RwLock::new(snapshot.hosts().to_vec()),
        })
    }
}

impl HostDirectory for StaticDirectory {
    fn list_hosts(&self, role: Option<HostRole>) -> Result<Vec<Host>, OpsError> {
        Ok(self
            .hosts
            .read()
            .iter()
            .filter(|h| role.map_or(true, |r| h.role == r))
            .cloned()
            .collect())
    }

    fn add_host(&self, host: Host) -> Result<(), OpsError> {
        let mut hosts = self.hosts.write();
        if hosts.iter().any(|h| h.name == host.name) {
            return Err(OpsError::Membership {
                node: host.name,
                message: "already joined".to_string(),
            });
        }
        hosts.push(host);
        Ok(())
    }

    fn remove_host(&self, name: &str) -> Result<Option<Host>, OpsError> {
        let mut hosts = self.hosts.write();
        Ok(hosts
            .iter()
            .position(|h| h.name == name)
            .map(|idx| hosts.remove(idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECTORY: &str = r#"
defaults:
  user: ops
hosts:
  - name: cp-1
    address: 10.0.0.1
    role: control-plane
  - name: wk-1
    address: 10.0.0.11
    role: worker
    user: root
    port: 2200
  - name: deploy
    address: 127.0.0.1
    role: automation-target
"#;

    #[test]
    fn test_parse_directory() {
        let dir = StaticDirectory::parse_str(DIRECTORY).unwrap();
        let hosts = dir.list_hosts(None).unwrap();

        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].user, "ops");
        assert_eq!(hosts[1].user, "root");
        assert_eq!(hosts[1].port, 2200);
        assert_eq!(
            dir.list_hosts(Some(HostRole::Worker)).unwrap()[0].name,
            "wk-1"
        );
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let yaml = "hosts:\n  - {name: a, address: 1.1.1.1, role: worker}\n  - {name: a, address: 1.1.1.2, role: worker}\n";
        assert!(StaticDirectory::parse_str(yaml).is_err());
    }

    #[test]
    fn test_membership_changes() {
        let dir = StaticDirectory::parse_str(DIRECTORY).unwrap();

        dir.add_host(Host::new("wk-2", HostRole::Worker)).unwrap();
        assert!(dir.find("wk-2").unwrap().is_some());

        let again = dir.add_host(Host::new("wk-2", HostRole::Worker));
        assert!(matches!(again, Err(OpsError::Membership { .. })));

        assert!(dir.remove_host("wk-2").unwrap().is_some());
        assert!(dir.remove_host("wk-2").unwrap().is_none());
        assert_eq!(dir.snapshot().unwrap().len(), 3);
    }
}
