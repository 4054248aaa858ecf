// clusterops CLI - operations console for cluster automation

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use clusterops::config::ConsoleConfig;
use clusterops::orchestrator::{
    CredentialsSpec, OperationRequest, Orchestrator, PollResponse, PollStatus, StartResponse,
    TaskSummary,
};
use clusterops::output::{OpsError, OutputFormat, OutputWriter};

#[derive(Parser)]
#[command(
    name = "clusterops",
    about = "Tracked, serialized long-running cluster operations",
    version,
    disable_colored_help = true,
    term_width = 0
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base URL of a running console
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show task ids and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    output_format: String,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Address to bind, overrides the configuration
        #[arg(short, long)]
        listen: Option<String>,

        /// State directory for rendered inventories
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Host directory file
        #[arg(short = 'H', long)]
        hosts: Option<PathBuf>,
    },

    /// Submit an operation request file to a running console
    Submit {
        /// Request file (JSON or YAML)
        request: PathBuf,

        /// Prompt for an SSH password to include in the request
        #[arg(long)]
        ask_pass: bool,

        /// Stream the task log until it finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Show one task
    Status {
        /// Task id returned by submit
        task_id: String,
    },

    /// List retained tasks
    Tasks {
        /// Only show tasks with this status (running, completed, failed)
        #[arg(long)]
        status: Option<String>,
    },

    /// Run an operation in-process and wait for it
    Run {
        /// Request file (JSON or YAML)
        request: PathBuf,

        /// Prompt for an SSH password
        #[arg(long)]
        ask_pass: bool,

        /// Host directory file
        #[arg(short = 'H', long)]
        hosts: Option<PathBuf>,

        /// State directory for rendered inventories
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Render the host directory into a new inventory generation
    Render {
        /// Host directory file
        #[arg(short = 'H', long)]
        hosts: Option<PathBuf>,

        /// State directory for rendered inventories
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "clusterops=debug,tower_http=debug"
    } else if cli.quiet {
        "warn"
    } else {
        "clusterops=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(io::stderr)
        .init();

    let output_format = OutputFormat::from_str(&cli.output_format).unwrap_or_else(|e| {
        eprintln!("{}. Using 'text'.", e);
        OutputFormat::Text
    });
    let output = OutputWriter::new(output_format, cli.quiet);

    let result = match cli.command {
        Commands::Serve {
            listen,
            state_dir,
            hosts,
        } => serve(cli.config.as_deref(), listen, state_dir, hosts).await,
        Commands::Submit {
            request,
            ask_pass,
            follow,
        } => submit(&cli.server, &request, ask_pass, follow, &output).await,
        Commands::Status { task_id } => status(&cli.server, &task_id, &output).await,
        Commands::Tasks { status } => list_tasks(&cli.server, status.as_deref(), &output).await,
        Commands::Run {
            request,
            ask_pass,
            hosts,
            state_dir,
        } => run_local(cli.config.as_deref(), &request, ask_pass, hosts, state_dir, &output).await,
        Commands::Render { hosts, state_dir } => {
            render(cli.config.as_deref(), hosts, state_dir, cli.quiet).await
        }
    };

    if let Err(e) = result {
        // Our own errors carry their hints; everything else gets the context chain
        match e.downcast_ref::<OpsError>() {
            Some(ops) => eprintln!("{}", ops),
            None => eprintln!("{} {:#}", "Error:".red().bold(), e),
        }
        std::process::exit(1);
    }
}

fn load_config(
    path: Option<&Path>,
    state_dir: Option<PathBuf>,
    hosts: Option<PathBuf>,
) -> Result<ConsoleConfig, OpsError> {
    let mut config = ConsoleConfig::load_or_default(path)?;
    if let Some(state_dir) = state_dir {
        config.state_dir = state_dir;
    }
    if hosts.is_some() {
        config.hosts_file = hosts;
    }
    Ok(config)
}

async fn serve(
    config_path: Option<&Path>,
    listen: Option<String>,
    state_dir: Option<PathBuf>,
    hosts: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path, state_dir, hosts)?;
    if let Some(listen) = listen {
        config.listen = listen;
    }

    let orchestrator = Orchestrator::from_config(&config)?;
    let _sweeper = orchestrator.spawn_retention_sweeper(config.tasks.sweep_interval());

    clusterops::api::serve(orchestrator, &config.listen)
        .await
        .with_context(|| format!("failed to serve on {}", config.listen))
}

fn read_request_value(path: &Path) -> anyhow::Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    // YAML is a superset of JSON, so one parser covers both
    serde_yaml::from_str(&content).with_context(|| format!("invalid request in {}", path.display()))
}

fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    // Prompt on stderr so it shows even with redirected stdout
    eprint!("{}", prompt.cyan());
    io::stderr().flush().ok();

    let password = rpassword::read_password().context("failed to read password")?;
    let password = password.trim().to_string();
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(password)
}

async fn submit(
    server: &str,
    path: &Path,
    ask_pass: bool,
    follow: bool,
    output: &OutputWriter,
) -> anyhow::Result<()> {
    let mut body = read_request_value(path)?;
    if ask_pass {
        let password = prompt_password("SSH password: ")?;
        let params = body
            .as_object_mut()
            .context("request must be an object")?
            .entry("params")
            .or_insert_with(|| serde_json::json!({}));
        let credentials = params
            .as_object_mut()
            .context("params must be an object")?
            .entry("credentials")
            .or_insert_with(|| serde_json::json!({}));
        credentials["password"] = serde_json::Value::String(password);
    }

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/operations", server))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach {}", server))?;

    if !response.status().is_success() {
        let code = response.status();
        let detail: serde_json::Value = response.json().await.unwrap_or_default();
        bail!(
            "request rejected ({}): {}",
            code,
            detail["error"].as_str().unwrap_or("no detail")
        );
    }

    let started: StartResponse = response.json().await.context("invalid start response")?;
    output.print_started(&started);

    if follow {
        let task_id = started.task_id.clone();
        let done = follow_task(output, &task_id, || fetch_poll(&client, server, &task_id)).await?;
        return finish(output, done);
    }
    Ok(())
}

async fn fetch_poll(client: &reqwest::Client, server: &str, task_id: &str) -> anyhow::Result<PollResponse> {
    let poll = client
        .get(format!("{}/api/operations/{}", server, task_id))
        .send()
        .await
        .with_context(|| format!("failed to reach {}", server))?
        .json()
        .await
        .context("invalid poll response")?;
    Ok(poll)
}

/// Poll until the task leaves `running`, streaming new log output
async fn follow_task<F, Fut>(output: &OutputWriter, task_id: &str, mut poll: F) -> anyhow::Result<PollResponse>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<PollResponse>>,
{
    let terminal = match output {
        OutputWriter::Text(terminal) => Some(terminal),
        OutputWriter::Json => None,
    };
    let spinner = terminal.map(|t| t.follow_spinner(task_id));
    let mut shown = 0;

    loop {
        let current = poll().await?;
        if let (Some(terminal), Some(spinner)) = (terminal, &spinner) {
            spinner.suspend(|| {
                shown = terminal.print_log_tail(&current.logs, shown);
            });
        }
        if current.status.is_terminal() {
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }
            return Ok(current);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn finish(output: &OutputWriter, done: PollResponse) -> anyhow::Result<()> {
    if output.is_json() {
        output.print_poll(&done);
    } else {
        // The log was already streamed
        output.print_poll(&PollResponse {
            logs: String::new(),
            ..done.clone()
        });
    }
    match done.status {
        PollStatus::Completed => Ok(()),
        PollStatus::NotFound => bail!("task {} disappeared", done.task_id),
        _ => bail!("task {} failed", done.task_id),
    }
}

async fn status(server: &str, task_id: &str, output: &OutputWriter) -> anyhow::Result<()> {
    let poll = fetch_poll(&reqwest::Client::new(), server, task_id).await?;
    output.print_poll(&poll);
    if poll.status == PollStatus::NotFound {
        bail!("no task {}", task_id);
    }
    Ok(())
}

async fn list_tasks(server: &str, filter: Option<&str>, output: &OutputWriter) -> anyhow::Result<()> {
    let mut request = reqwest::Client::new().get(format!("{}/api/operations", server));
    if let Some(filter) = filter {
        request = request.query(&[("status", filter)]);
    }
    let tasks: Vec<TaskSummary> = request
        .send()
        .await
        .with_context(|| format!("failed to reach {}", server))?
        .json()
        .await
        .context("invalid task list")?;
    output.print_tasks(&tasks);
    Ok(())
}

async fn run_local(
    config_path: Option<&Path>,
    path: &Path,
    ask_pass: bool,
    hosts: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    output: &OutputWriter,
) -> anyhow::Result<()> {
    let config = load_config(config_path, state_dir, hosts)?;
    let mut request: OperationRequest = serde_json::from_value(read_request_value(path)?)
        .with_context(|| format!("invalid request in {}", path.display()))?;

    if ask_pass {
        let kind = request.kind();
        let password = prompt_password("SSH password: ")?;
        match request.credentials_mut() {
            Some(slot) => {
                slot.get_or_insert_with(CredentialsSpec::default).password = Some(password)
            }
            None => bail!("{} does not take credentials", kind),
        }
    }

    let orchestrator = Orchestrator::from_config(&config)?;
    let started = orchestrator.start(request)?;
    output.print_started(&started);

    let task_id = started.task_id.clone();
    let done = follow_task(output, &task_id, || {
        let poll = orchestrator.poll(&task_id);
        async move { Ok(poll) }
    })
    .await?;
    finish(output, done)
}

async fn render(
    config_path: Option<&Path>,
    hosts: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path, state_dir, hosts)?;
    let orchestrator = Orchestrator::from_config(&config)?;
    let generation = orchestrator.render().await?;

    if !quiet {
        println!(
            "{} generation {} ({} hosts) {}",
            "RENDERED".green().bold(),
            generation.number,
            generation.host_count,
            generation.dir().display().to_string().dimmed()
        );
    }
    Ok(())
}
