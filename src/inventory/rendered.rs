// Ansible-style YAML inventory rendering and parsing

use std::path::Path;

use serde_yaml::{Mapping, Value as YamlValue};

use super::{Host, HostRole, InventorySnapshot};
use crate::output::errors::OpsError;

const HOST_KEY: &str = "ansible_host";
const PORT_KEY: &str = "ansible_port";
const USER_KEY: &str = "ansible_user";
const ORDER_KEY: &str = "clusterops_host_order";

/// Render a snapshot as a YAML inventory grouped by role.
///
/// Hosts keep snapshot order inside their group; groups with no hosts are
/// still emitted so playbooks can reference them unconditionally. The full
/// snapshot order is recorded under `all.vars` so parsing can restore it.
pub fn render_inventory(snapshot: &InventorySnapshot) -> Result<String, OpsError> {
    let mut children = Mapping::new();

    for role in HostRole::ALL {
        let mut hosts = Mapping::new();
        for host in snapshot.with_role(role) {
            let mut vars = Mapping::new();
            vars.insert(HOST_KEY.into(), host.address.clone().into());
            vars.insert(PORT_KEY.into(), YamlValue::Number(host.port.into()));
            if !host.user.is_empty() {
                vars.insert(USER_KEY.into(), host.user.clone().into());
            }
            for (k, v) in &host.vars {
                vars.insert(k.clone().into(), v.clone().into());
            }
            hosts.insert(host.name.clone().into(), YamlValue::Mapping(vars));
        }

        let mut group = Mapping::new();
        group.insert("hosts".into(), YamlValue::Mapping(hosts));
        children.insert(role.group_name().into(), YamlValue::Mapping(group));
    }

    let order: Vec<YamlValue> = snapshot
        .hosts()
        .iter()
        .map(|h| YamlValue::String(h.name.clone()))
        .collect();
    let mut all_vars = Mapping::new();
    all_vars.insert(ORDER_KEY.into(), YamlValue::Sequence(order));

    let mut all = Mapping::new();
    all.insert("vars".into(), YamlValue::Mapping(all_vars));
    all.insert("children".into(), YamlValue::Mapping(children));
    let mut root = Mapping::new();
    root.insert("all".into(), YamlValue::Mapping(all));

    serde_yaml::to_string(&YamlValue::Mapping(root)).map_err(|e| OpsError::Inventory {
        message: format!("Failed to render inventory: {}", e),
        suggestion: None,
    })
}

/// Parse a rendered inventory file back into a snapshot
pub fn parse_rendered_file(path: &Path) -> Result<InventorySnapshot, OpsError> {
    let content = std::fs::read_to_string(path).map_err(|e| OpsError::Io {
        message: format!("Failed to read inventory file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    parse_rendered(&content)
}

/// Parse a rendered inventory from a YAML string
pub fn parse_rendered(content: &str) -> Result<InventorySnapshot, OpsError> {
    let yaml: YamlValue = serde_yaml::from_str(content).map_err(|e| OpsError::Inventory {
        message: format!("Invalid inventory YAML: {}", e),
        suggestion: Some("Re-render the inventory from the host directory".to_string()),
    })?;

    let children = yaml
        .get("all")
        .and_then(|all| all.get("children"))
        .and_then(|c| c.as_mapping())
        .ok_or_else(|| OpsError::Inventory {
            message: "Inventory has no 'all.children' section".to_string(),
            suggestion: None,
        })?;

    let mut snapshot = InventorySnapshot::default();

    for (group_name, group) in children {
        let Some(role) = group_name.as_str().and_then(HostRole::from_group_name) else {
            continue;
        };

        let Some(hosts) = group.get("hosts").and_then(|h| h.as_mapping()) else {
            continue;
        };

        for (name, vars) in hosts {
            let Some(name) = name.as_str() else {
                continue;
            };

            let mut host = Host::new(name, role);
            if let Some(vars) = vars.as_mapping() {
                parse_host_vars(&mut host, vars)?;
            }
            snapshot.insert(host);
        }
    }

    if let Some(order) = yaml
        .get("all")
        .and_then(|all| all.get("vars"))
        .and_then(|vars| vars.get(ORDER_KEY))
        .and_then(|order| order.as_sequence())
    {
        let order: Vec<&str> = order.iter().filter_map(|name| name.as_str()).collect();
        restore_order(&mut snapshot, &order);
    }

    Ok(snapshot)
}

/// Sort hosts by their position in `order`; unlisted hosts go last in
/// group order
fn restore_order(snapshot: &mut InventorySnapshot, order: &[&str]) {
    snapshot.hosts.sort_by_key(|host| {
        order
            .iter()
            .position(|name| *name == host.name)
            .unwrap_or(usize::MAX)
    });
}

fn parse_host_vars(host: &mut Host, vars: &Mapping) -> Result<(), OpsError> {
    for (key, value) in vars {
        let Some(key) = key.as_str() else {
            continue;
        };

        match key {
            HOST_KEY => {
                if let Some(addr) = value.as_str() {
                    host.address = addr.to_string();
                }
            }
            PORT_KEY => {
                host.port = value
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| OpsError::Inventory {
                        message: format!("Invalid port for host '{}'", host.name),
                        suggestion: Some("Ports must be between 1 and 65535".to_string()),
                    })?;
            }
            USER_KEY => {
                if let Some(user) = value.as_str() {
                    host.user = user.to_string();
                }
            }
            _ => {
                let rendered = match value {
                    YamlValue::String(s) => s.clone(),
                    YamlValue::Bool(b) => b.to_string(),
                    YamlValue::Number(n) => n.to_string(),
                    _ => continue,
                };
                host.vars.insert(key.to_string(), rendered);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_then_parse_preserves_fleet() {
        let snapshot = InventorySnapshot::from_hosts(vec![
            Host::new("cp-1", HostRole::ControlPlane)
                .with_address("10.0.0.1")
                .with_user("ops"),
            Host::new("wk-1", HostRole::Worker)
                .with_address("10.0.0.11")
                .with_port(2222)
                .with_var("zone", "b"),
            Host::new("deploy", HostRole::AutomationTarget).with_address("127.0.0.1"),
        ]);

        let yaml = render_inventory(&snapshot).unwrap();
        assert!(yaml.contains("control_plane"));
        assert!(yaml.contains("ansible_host: 10.0.0.11"));

        let parsed = parse_rendered(&yaml).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_mixed_role_order_survives_reload() {
        let snapshot = InventorySnapshot::from_hosts(vec![
            Host::new("wk-2", HostRole::Worker).with_address("10.0.0.12"),
            Host::new("cp-1", HostRole::ControlPlane).with_address("10.0.0.1"),
            Host::new("deploy", HostRole::AutomationTarget).with_address("127.0.0.1"),
            Host::new("wk-1", HostRole::Worker).with_address("10.0.0.11"),
        ]);

        let parsed = parse_rendered(&render_inventory(&snapshot).unwrap()).unwrap();
        let names: Vec<&str> = parsed.hosts().iter().map(|h| h.name.as_str()).collect();

        assert_eq!(names, vec!["wk-2", "cp-1", "deploy", "wk-1"]);
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_inventory_without_order_is_role_major() {
        let yaml = r#"
all:
  children:
    worker:
      hosts:
        wk-1: {ansible_host: 10.0.0.11}
    control_plane:
      hosts:
        cp-1: {ansible_host: 10.0.0.1}
"#;
        let parsed = parse_rendered(yaml).unwrap();
        let names: Vec<&str> = parsed.hosts().iter().map(|h| h.name.as_str()).collect();

        assert_eq!(names, vec!["wk-1", "cp-1"]);
    }

    #[test]
    fn test_empty_groups_are_rendered() {
        let yaml = render_inventory(&InventorySnapshot::default()).unwrap();
        let parsed = parse_rendered(&yaml).unwrap();

        assert!(parsed.is_empty());
        assert!(yaml.contains("automation_target"));
    }

    #[test]
    fn test_parse_rejects_foreign_layout() {
        assert!(parse_rendered("hosts: [a, b]").is_err());
    }
}
