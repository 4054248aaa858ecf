// Operation bodies: one async function per operation kind

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use super::request::{
    AddonParams, ComponentParams, JoinNodeParams, OperationRequest, RemoveNodeParams,
    ScriptParams, ToolingParams,
};
use super::Services;
use crate::executor::{Credentials, Payload, RunRequest};
use crate::inventory::{Generation, Host, HostRole, InventorySnapshot};
use crate::output::errors::OpsError;
use crate::tasks::{
    ConfigAccess, ConfigReadGuard, ConfigWriteGuard, TaskContext, TaskExecutor, TaskId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Install,
    Uninstall,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Uninstall => "uninstall",
        }
    }
}

/// Schedule the body for `request`, picking its lock mode by type
pub(super) fn dispatch(
    executor: &TaskExecutor,
    services: Arc<Services>,
    task_id: TaskId,
    request: OperationRequest,
) {
    match request {
        OperationRequest::InstallTooling(params) => executor.schedule(task_id, move |ctx| {
            tooling(ctx, services, params, Action::Install)
        }),
        OperationRequest::UninstallTooling(params) => executor.schedule(task_id, move |ctx| {
            tooling(ctx, services, params, Action::Uninstall)
        }),
        OperationRequest::InstallComponent(params) => executor.schedule(task_id, move |ctx| {
            component(ctx, services, params, Action::Install)
        }),
        OperationRequest::UninstallComponent(params) => executor.schedule(task_id, move |ctx| {
            component(ctx, services, params, Action::Uninstall)
        }),
        OperationRequest::InstallAddon(params) => executor.schedule(task_id, move |ctx| {
            addon(ctx, services, params, Action::Install)
        }),
        OperationRequest::UninstallAddon(params) => executor.schedule(task_id, move |ctx| {
            addon(ctx, services, params, Action::Uninstall)
        }),
        OperationRequest::JoinNode(params) => {
            executor.schedule(task_id, move |ctx| join_node(ctx, services, params))
        }
        OperationRequest::RemoveNode(params) => {
            executor.schedule(task_id, move |ctx| remove_node(ctx, services, params))
        }
        OperationRequest::RunScript(params) => {
            executor.schedule(task_id, move |ctx| run_script(ctx, services, params))
        }
    }
}

/// Install or remove the automation tooling on automation-target hosts
async fn tooling(
    ctx: TaskContext<ConfigWriteGuard>,
    services: Arc<Services>,
    params: ToolingParams,
    action: Action,
) -> Result<(), OpsError> {
    let snapshot = services.directory.snapshot()?;
    let targets = snapshot.select(params.hosts.as_deref(), &[HostRole::AutomationTarget]);
    if targets.is_empty() {
        return Err(OpsError::NoEligibleHost {
            role: HostRole::AutomationTarget.to_string(),
            requested: params.hosts.clone(),
        });
    }

    render(&ctx, &services, &snapshot)?;

    let command = match action {
        Action::Install => services.tool.install_command.clone(),
        Action::Uninstall => services.tool.uninstall_command.clone(),
    };
    ctx.line(format!(
        "{} automation tooling on {} host(s)",
        action.as_str(),
        targets.len()
    ));

    let outcome = services
        .runner
        .run(
            RunRequest {
                hosts: targets,
                payload: Payload::Command(command),
                credentials: credentials_of(params.credentials.as_ref()),
            },
            ctx.sink(),
        )
        .await?;
    outcome.into_result(format!("{} tooling", action.as_str()))
}

/// Run a component playbook against control-plane and worker hosts
async fn component(
    ctx: TaskContext<ConfigWriteGuard>,
    services: Arc<Services>,
    params: ComponentParams,
    action: Action,
) -> Result<(), OpsError> {
    let snapshot = services.directory.snapshot()?;
    let targets = snapshot.select(
        params.hosts.as_deref(),
        &[HostRole::ControlPlane, HostRole::Worker],
    );
    if targets.is_empty() {
        return Err(OpsError::NoEligibleHost {
            role: "control-plane or worker".to_string(),
            requested: params.hosts.clone(),
        });
    }

    let playbook = playbook_path(&services, &format!("{}.yml", params.component))?;
    let generation = render(&ctx, &services, &snapshot)?;

    let mut vars = BTreeMap::new();
    vars.insert("operation".to_string(), action.as_str().to_string());
    vars.insert("component".to_string(), params.component.clone());

    // Without an explicit host list the playbook's own host patterns apply
    let limit = params
        .hosts
        .as_ref()
        .map(|_| targets.iter().map(|h| h.name.as_str()).collect::<Vec<_>>().join(","));

    ctx.line(format!(
        "{} {} on {} host(s)",
        action.as_str(),
        params.component,
        targets.len()
    ));
    run_playbook(&ctx, &services, &generation, targets, playbook, vars, limit).await
}

/// Apply an addon through a control-plane host, against the rendered inventory
async fn addon(
    ctx: TaskContext<ConfigReadGuard>,
    services: Arc<Services>,
    params: AddonParams,
    action: Action,
) -> Result<(), OpsError> {
    let (generation, snapshot) = current_inventory(&ctx, &services)?;
    let control_plane: Vec<Host> = snapshot
        .with_role(HostRole::ControlPlane)
        .into_iter()
        .cloned()
        .collect();
    if control_plane.is_empty() {
        return Err(OpsError::NoEligibleHost {
            role: HostRole::ControlPlane.to_string(),
            requested: None,
        });
    }

    let playbook = playbook_path(&services, &format!("addons/{}.yml", params.addon))?;

    let mut vars = BTreeMap::new();
    vars.insert("operation".to_string(), action.as_str().to_string());
    vars.insert("addon".to_string(), params.addon.clone());

    ctx.line(format!(
        "{} addon {} using generation {}",
        action.as_str(),
        params.addon,
        generation.number
    ));
    run_playbook(
        &ctx,
        &services,
        &generation,
        control_plane,
        playbook,
        vars,
        Some(HostRole::ControlPlane.group_name().to_string()),
    )
    .await
}

/// Bring a new host into the cluster.
///
/// The directory only records the node once its playbook succeeds; on
/// failure the rendered files are re-rendered from the directory so they
/// never list a node that did not join.
async fn join_node(
    ctx: TaskContext<ConfigWriteGuard>,
    services: Arc<Services>,
    params: JoinNodeParams,
) -> Result<(), OpsError> {
    if services.directory.find(&params.name)?.is_some() {
        return Err(OpsError::Membership {
            node: params.name.clone(),
            message: "already joined".to_string(),
        });
    }

    let mut node = Host::new(&params.name, params.role)
        .with_address(&params.address)
        .with_port(params.port.unwrap_or(22));
    if let Some(user) = &params.user {
        node = node.with_user(user);
    }
    let credentials = credentials_of(params.credentials.as_ref());

    let playbook = playbook_path(
        &services,
        match params.role {
            HostRole::ControlPlane => "add-control-plane.yml",
            _ => "add-node.yml",
        },
    )?;

    ctx.line(format!("checking connectivity to {} ({})", node.name, node.address));
    services.runner.probe(&node, &credentials).await?;

    let mut snapshot = services.directory.snapshot()?;
    snapshot.insert(node.clone());
    let generation = render(&ctx, &services, &snapshot)?;

    let mut vars = BTreeMap::new();
    vars.insert("node_name".to_string(), node.name.clone());
    vars.insert("node_role".to_string(), node.role.to_string());

    let payload = Payload::Playbook {
        playbook,
        inventory: generation.inventory_path(),
        config: Some(generation.config_path()),
        extra_vars: vars,
        limit: Some(node.name.clone()),
    };
    let what = payload.describe();

    ctx.line(format!("joining {} as {}", node.name, node.role));
    let outcome = services
        .runner
        .run(
            RunRequest {
                hosts: vec![node.clone()],
                payload,
                credentials,
            },
            ctx.sink(),
        )
        .await
        .and_then(|outcome| outcome.into_result(what));

    match outcome {
        Ok(()) => {
            services.directory.add_host(node.clone())?;
            ctx.line(format!("{} joined the cluster", node.name));
            Ok(())
        }
        Err(e) => {
            ctx.line(format!("join of {} failed, restoring inventory", node.name));
            let restored = services
                .directory
                .snapshot()
                .and_then(|snapshot| render(&ctx, &services, &snapshot));
            if let Err(restore) = restored {
                warn!(node = %node.name, error = %restore.summary(), "failed to restore inventory");
                ctx.line(format!("inventory restore failed: {}", restore.summary()));
            }
            Err(e)
        }
    }
}

/// Drain a node out of the cluster and forget it
async fn remove_node(
    ctx: TaskContext<ConfigWriteGuard>,
    services: Arc<Services>,
    params: RemoveNodeParams,
) -> Result<(), OpsError> {
    let node = services
        .directory
        .find(&params.name)?
        .ok_or_else(|| OpsError::Membership {
            node: params.name.clone(),
            message: "not a member of the cluster".to_string(),
        })?;

    if node.role == HostRole::ControlPlane
        && services
            .directory
            .list_hosts(Some(HostRole::ControlPlane))?
            .len()
            <= 1
    {
        return Err(OpsError::Membership {
            node: node.name.clone(),
            message: "refusing to remove the last control-plane host".to_string(),
        });
    }

    let playbook = playbook_path(&services, "remove-node.yml")?;

    // The node stays in the rendered inventory until the playbook has drained it
    let snapshot = services.directory.snapshot()?;
    let generation = render(&ctx, &services, &snapshot)?;

    let mut vars = BTreeMap::new();
    vars.insert("node_name".to_string(), node.name.clone());
    vars.insert("node_role".to_string(), node.role.to_string());

    ctx.line(format!("removing {}", node.name));
    run_playbook(
        &ctx,
        &services,
        &generation,
        vec![node.clone()],
        playbook,
        vars,
        Some(node.name.clone()),
    )
    .await?;

    services.directory.remove_host(&node.name)?;
    let snapshot = services.directory.snapshot()?;
    render(&ctx, &services, &snapshot)?;
    ctx.line(format!("{} removed from the cluster", node.name));
    Ok(())
}

/// Run an inline script against hosts of the rendered inventory
async fn run_script(
    ctx: TaskContext<ConfigReadGuard>,
    services: Arc<Services>,
    params: ScriptParams,
) -> Result<(), OpsError> {
    let (generation, snapshot) = current_inventory(&ctx, &services)?;
    let targets = snapshot.select(params.hosts.as_deref(), &HostRole::ALL);
    if targets.is_empty() {
        return Err(OpsError::NoEligibleHost {
            role: "any".to_string(),
            requested: params.hosts.clone(),
        });
    }

    ctx.line(format!(
        "running script on {} host(s) from generation {}",
        targets.len(),
        generation.number
    ));
    let outcome = services
        .runner
        .run(
            RunRequest {
                hosts: targets,
                payload: Payload::Script(params.script.clone()),
                credentials: credentials_of(params.credentials.as_ref()),
            },
            ctx.sink(),
        )
        .await?;
    outcome.into_result("script")
}

fn render(
    ctx: &TaskContext<ConfigWriteGuard>,
    services: &Services,
    snapshot: &InventorySnapshot,
) -> Result<Generation, OpsError> {
    ctx.line(format!("rendering inventory for {} host(s)", snapshot.len()));
    let generation = services.materializer.regenerate(snapshot, ctx.guard())?;
    ctx.line(format!(
        "published generation {} ({})",
        generation.number,
        &generation.fingerprint[..12]
    ));
    Ok(generation)
}

fn current_inventory<G: ConfigAccess>(
    ctx: &TaskContext<G>,
    services: &Services,
) -> Result<(Generation, InventorySnapshot), OpsError> {
    let generation = services
        .materializer
        .current(ctx.guard())?
        .ok_or_else(|| OpsError::Inventory {
            message: "no rendered inventory yet".to_string(),
            suggestion: Some(
                "Run a mutating operation or `clusterops render` first".to_string(),
            ),
        })?;
    let snapshot = services.materializer.load_snapshot(&generation)?;
    Ok((generation, snapshot))
}

async fn run_playbook<G: ConfigAccess>(
    ctx: &TaskContext<G>,
    services: &Services,
    generation: &Generation,
    hosts: Vec<Host>,
    playbook: PathBuf,
    extra_vars: BTreeMap<String, String>,
    limit: Option<String>,
) -> Result<(), OpsError> {
    let payload = Payload::Playbook {
        playbook,
        inventory: generation.inventory_path(),
        config: Some(generation.config_path()),
        extra_vars,
        limit,
    };
    let what = payload.describe();

    let outcome = services
        .runner
        .run(
            RunRequest {
                hosts,
                payload,
                credentials: Credentials::default(),
            },
            ctx.sink(),
        )
        .await?;
    outcome.into_result(what)
}

fn playbook_path(services: &Services, relative: &str) -> Result<PathBuf, OpsError> {
    let path = services.tool.playbook_dir.join(relative);
    if path.is_file() {
        Ok(path)
    } else {
        Err(OpsError::Config {
            message: format!("playbook {} not found", relative),
            path: Some(path),
        })
    }
}

fn credentials_of(spec: Option<&super::CredentialsSpec>) -> Credentials {
    spec.map(|c| c.to_credentials()).unwrap_or_default()
}
