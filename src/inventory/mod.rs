// Inventory module: hosts, roles and snapshots of the cluster fleet

mod directory;
mod materialize;
mod rendered;

pub use directory::*;
pub use materialize::*;
pub use rendered::*;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Role a host plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostRole {
    ControlPlane,
    Worker,
    AutomationTarget,
}

impl HostRole {
    pub const ALL: [HostRole; 3] = [
        HostRole::ControlPlane,
        HostRole::Worker,
        HostRole::AutomationTarget,
    ];

    /// Group name used in rendered inventories
    pub fn group_name(&self) -> &'static str {
        match self {
            HostRole::ControlPlane => "control_plane",
            HostRole::Worker => "worker",
            HostRole::AutomationTarget => "automation_target",
        }
    }

    pub fn from_group_name(name: &str) -> Option<Self> {
        HostRole::ALL.into_iter().find(|r| r.group_name() == name)
    }

    /// Cluster members (control-plane and worker hosts)
    pub fn is_cluster_member(&self) -> bool {
        matches!(self, HostRole::ControlPlane | HostRole::Worker)
    }
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostRole::ControlPlane => "control-plane",
            HostRole::Worker => "worker",
            HostRole::AutomationTarget => "automation-target",
        };
        f.write_str(s)
    }
}

impl FromStr for HostRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "control-plane" | "master" => Ok(HostRole::ControlPlane),
            "worker" | "node" => Ok(HostRole::Worker),
            "automation-target" | "automation" => Ok(HostRole::AutomationTarget),
            other => Err(format!("unknown host role '{}'", other)),
        }
    }
}

/// A single host known to the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    pub role: HostRole,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

fn default_port() -> u16 {
    22
}

impl Host {
    pub fn new(name: impl Into<String>, role: HostRole) -> Self {
        let name = name.into();
        Host {
            address: name.clone(),
            name,
            port: 22,
            user: String::new(),
            role,
            vars: BTreeMap::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Get the SSH connection string (user@host:port)
    pub fn ssh_target(&self) -> String {
        if self.user.is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.address, self.port)
        }
    }

    /// Check if this host should use a local connection
    pub fn is_local(&self) -> bool {
        if self.vars.get("ansible_connection").map(String::as_str) == Some("local") {
            return true;
        }

        matches!(self.name.as_str(), "localhost" | "127.0.0.1" | "::1")
            || matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// Ordered set of hosts from which inventory files are rendered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    hosts: Vec<Host>,
}

impl InventorySnapshot {
    /// Build a snapshot, keeping the first occurrence of each host name
    pub fn from_hosts(hosts: impl IntoIterator<Item = Host>) -> Self {
        let mut snapshot = InventorySnapshot::default();
        for host in hosts {
            snapshot.insert(host);
        }
        snapshot
    }

    /// Insert a host; returns false if a host with that name is present
    pub fn insert(&mut self, host: Host) -> bool {
        if self.contains(&host.name) {
            return false;
        }
        self.hosts.push(host);
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Host> {
        let idx = self.hosts.iter().position(|h| h.name == name)?;
        Some(self.hosts.remove(idx))
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn with_role(&self, role: HostRole) -> Vec<&Host> {
        self.hosts.iter().filter(|h| h.role == role).collect()
    }

    /// Hosts whose role is in `roles`, restricted to `names` when given.
    ///
    /// `Some(&[])` selects nothing; `None` selects every host with a
    /// matching role. Order follows the snapshot.
    pub fn select(&self, names: Option<&[String]>, roles: &[HostRole]) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|h| roles.contains(&h.role))
            .filter(|h| names.map_or(true, |names| names.iter().any(|n| n == &h.name)))
            .cloned()
            .collect()
    }

    /// Stable content hash, used to tag rendered generations
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for host in &self.hosts {
            hasher.update(host.name.as_bytes());
            hasher.update([0]);
            hasher.update(host.address.as_bytes());
            hasher.update([0]);
            hasher.update(host.port.to_be_bytes());
            hasher.update(host.user.as_bytes());
            hasher.update([0]);
            hasher.update(host.role.group_name().as_bytes());
            for (k, v) in &host.vars {
                hasher.update(k.as_bytes());
                hasher.update([b'=']);
                hasher.update(v.as_bytes());
                hasher.update([0]);
            }
            hasher.update([b'\n']);
        }
        format!("{:x}", hasher.finalize())
    }
}
