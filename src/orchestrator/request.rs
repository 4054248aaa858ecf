// Operation requests as accepted over the wire, and their validation

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::executor::Credentials;
use crate::inventory::HostRole;
use crate::output::errors::ValidationError;
use crate::tasks::TaskKind;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9._-]*[a-zA-Z0-9])?$").unwrap());

/// A request to start one long-running operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "kebab-case")]
pub enum OperationRequest {
    InstallTooling(ToolingParams),
    UninstallTooling(ToolingParams),
    InstallComponent(ComponentParams),
    UninstallComponent(ComponentParams),
    InstallAddon(AddonParams),
    UninstallAddon(AddonParams),
    JoinNode(JoinNodeParams),
    RemoveNode(RemoveNodeParams),
    RunScript(ScriptParams),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolingParams {
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
    #[serde(default)]
    pub credentials: Option<CredentialsSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentParams {
    #[serde(default)]
    pub component: String,
    /// Restrict to these hosts; an empty list selects nothing
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonParams {
    #[serde(default)]
    pub addon: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinNodeParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    pub role: HostRole,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub credentials: Option<CredentialsSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveNodeParams {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptParams {
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
    #[serde(default)]
    pub credentials: Option<CredentialsSpec>,
}

/// Credentials as they arrive in a request body
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsSpec {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

impl CredentialsSpec {
    pub fn to_credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone().map(Zeroizing::new),
            private_key: self.private_key.clone(),
        }
    }
}

impl Drop for CredentialsSpec {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl fmt::Debug for CredentialsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsSpec")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

impl OperationRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            OperationRequest::InstallTooling(_) => TaskKind::InstallTooling,
            OperationRequest::UninstallTooling(_) => TaskKind::UninstallTooling,
            OperationRequest::InstallComponent(_) => TaskKind::InstallComponent,
            OperationRequest::UninstallComponent(_) => TaskKind::UninstallComponent,
            OperationRequest::InstallAddon(_) => TaskKind::InstallAddon,
            OperationRequest::UninstallAddon(_) => TaskKind::UninstallAddon,
            OperationRequest::JoinNode(_) => TaskKind::JoinNode,
            OperationRequest::RemoveNode(_) => TaskKind::RemoveNode,
            OperationRequest::RunScript(_) => TaskKind::RunScript,
        }
    }

    /// Credential slot of requests that reach hosts over SSH
    pub fn credentials_mut(&mut self) -> Option<&mut Option<CredentialsSpec>> {
        match self {
            OperationRequest::InstallTooling(p) | OperationRequest::UninstallTooling(p) => {
                Some(&mut p.credentials)
            }
            OperationRequest::JoinNode(p) => Some(&mut p.credentials),
            OperationRequest::RunScript(p) => Some(&mut p.credentials),
            _ => None,
        }
    }

    /// Check required fields; a request that fails here never becomes a task
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            OperationRequest::InstallTooling(p) | OperationRequest::UninstallTooling(p) => {
                validate_hosts(p.hosts.as_deref())
            }
            OperationRequest::InstallComponent(p) | OperationRequest::UninstallComponent(p) => {
                validate_name("component", &p.component)?;
                validate_hosts(p.hosts.as_deref())
            }
            OperationRequest::InstallAddon(p) | OperationRequest::UninstallAddon(p) => {
                validate_name("addon", &p.addon)
            }
            OperationRequest::JoinNode(p) => {
                validate_name("name", &p.name)?;
                if p.address.trim().is_empty() {
                    return Err(ValidationError::MissingField("address"));
                }
                if !p.role.is_cluster_member() {
                    return Err(ValidationError::InvalidValue {
                        field: "role",
                        reason: format!("{} hosts cannot join the cluster", p.role),
                    });
                }
                if p.port == Some(0) {
                    return Err(ValidationError::InvalidValue {
                        field: "port",
                        reason: "port must be non-zero".to_string(),
                    });
                }
                let has_secret = p
                    .credentials
                    .as_ref()
                    .is_some_and(|c| c.password.is_some() || c.private_key.is_some());
                if !has_secret {
                    return Err(ValidationError::MissingCredentials("join-node"));
                }
                Ok(())
            }
            OperationRequest::RemoveNode(p) => validate_name("name", &p.name),
            OperationRequest::RunScript(p) => {
                if p.script.trim().is_empty() {
                    return Err(ValidationError::MissingField("script"));
                }
                validate_hosts(p.hosts.as_deref())
            }
        }
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if !NAME_RE.is_match(value) {
        return Err(ValidationError::InvalidValue {
            field,
            reason: format!("'{}' is not a valid name", value),
        });
    }
    Ok(())
}

fn validate_hosts(hosts: Option<&[String]>) -> Result<(), ValidationError> {
    for host in hosts.unwrap_or_default() {
        validate_name("hosts", host)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(json: &str) -> OperationRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_wire_shape() {
        let request = parse(
            r#"{"kind":"install-component","params":{"component":"metrics-server","hosts":["wk-1"]}}"#,
        );
        assert_eq!(request.kind(), TaskKind::InstallComponent);
        assert!(request.validate().is_ok());

        let request = parse(r#"{"kind":"remove-node","params":{"name":"wk-2"}}"#);
        assert_eq!(request.kind(), TaskKind::RemoveNode);
    }

    #[test]
    fn test_missing_fields() {
        let request = parse(r#"{"kind":"install-addon","params":{}}"#);
        assert_eq!(
            request.validate(),
            Err(ValidationError::MissingField("addon"))
        );

        let request = parse(r#"{"kind":"run-script","params":{"script":"  "}}"#);
        assert_eq!(
            request.validate(),
            Err(ValidationError::MissingField("script"))
        );
    }

    #[test]
    fn test_path_like_names_rejected() {
        let request = parse(r#"{"kind":"install-component","params":{"component":"../etc/passwd"}}"#);
        assert!(matches!(
            request.validate(),
            Err(ValidationError::InvalidValue { field: "component", .. })
        ));
    }

    #[test]
    fn test_empty_host_list_is_valid() {
        // Rejected later, as a failed task, not here
        let request = parse(r#"{"kind":"install-component","params":{"component":"cni","hosts":[]}}"#);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_join_requires_credentials() {
        let request = parse(
            r#"{"kind":"join-node","params":{"name":"wk-9","address":"10.0.0.9","role":"worker"}}"#,
        );
        assert_eq!(
            request.validate(),
            Err(ValidationError::MissingCredentials("join-node"))
        );

        let request = parse(
            r#"{"kind":"join-node","params":{"name":"wk-9","address":"10.0.0.9","role":"worker","credentials":{"password":"pw"}}}"#,
        );
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_join_rejects_automation_role() {
        let request = parse(
            r#"{"kind":"join-node","params":{"name":"ops-1","address":"10.0.0.5","role":"automation-target","credentials":{"privateKey":"/k"}}}"#,
        );
        assert!(matches!(
            request.validate(),
            Err(ValidationError::InvalidValue { field: "role", .. })
        ));
    }

    #[test]
    fn test_password_redacted_and_not_serialized() {
        let spec = CredentialsSpec {
            user: Some("root".to_string()),
            password: Some("hunter2".to_string()),
            private_key: None,
        };
        assert!(!format!("{:?}", spec).contains("hunter2"));
        assert!(!serde_json::to_string(&spec).unwrap().contains("hunter2"));
        assert!(spec.to_credentials().password.is_some());
    }

    #[test]
    fn test_prompted_password_satisfies_join() {
        let mut request = parse(
            r#"{"kind":"join-node","params":{"name":"wk-9","address":"10.0.0.9","role":"worker"}}"#,
        );
        let slot = request.credentials_mut().unwrap();
        slot.get_or_insert_with(CredentialsSpec::default).password = Some("pw".to_string());
        assert!(request.validate().is_ok());

        let mut request = parse(r#"{"kind":"remove-node","params":{"name":"wk-2"}}"#);
        assert!(request.credentials_mut().is_none());
    }

    #[test]
    fn test_unknown_kind_fails_to_parse() {
        let result: Result<OperationRequest, _> =
            serde_json::from_str(r#"{"kind":"reboot-everything","params":{}}"#);
        assert!(result.is_err());
    }
}
