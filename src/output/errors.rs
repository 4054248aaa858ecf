// Human-readable error messages for clusterops

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;
use thiserror::Error;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    // https://no-color.org/
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    std::io::stderr().is_terminal()
}

/// Errors raised while executing an operation.
///
/// Every variant is recoverable from the orchestrator's point of view: a task
/// body that returns one of these ends up `failed`, with [`OpsError::summary`]
/// stored as the task's error. `Display` renders the longer colored report
/// used on the command line.
#[derive(Debug)]
pub enum OpsError {
    /// I/O errors
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// SSH connection errors
    Ssh {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// Inventory errors (unreadable rendered inventory, bad host files)
    Inventory {
        message: String,
        suggestion: Option<String>,
    },

    /// Configuration file errors
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Local runtime errors (process spawn, join failures, panics)
    Runtime {
        message: String,
        suggestion: Option<String>,
    },

    /// A remote command or playbook exited with a non-zero status
    RemoteExit {
        host: Option<String>,
        command: String,
        exit_code: i32,
    },

    /// No host carries the role an operation needs
    NoEligibleHost {
        role: String,
        requested: Option<Vec<String>>,
    },

    /// Node membership conflicts (already joined, not a member)
    Membership { node: String, message: String },

    /// Timeout errors
    Timeout {
        operation: String,
        duration_secs: u64,
    },
}

impl OpsError {
    /// Shorthand for an I/O error on a path
    pub fn io(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        OpsError::Io {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Shorthand for a runtime error without suggestion
    pub fn runtime(message: impl Into<String>) -> Self {
        OpsError::Runtime {
            message: message.into(),
            suggestion: None,
        }
    }

    /// Plain single-line rendering, stored in task records and API bodies
    pub fn summary(&self) -> String {
        match self {
            OpsError::Io { message, path } => match path {
                Some(path) => format!("{} ({})", message, path.display()),
                None => message.clone(),
            },
            OpsError::Ssh { host, message, .. } => format!("{}: {}", host, message),
            OpsError::Inventory { message, .. } => message.clone(),
            OpsError::Config { message, path } => match path {
                Some(path) => format!("{} ({})", message, path.display()),
                None => message.clone(),
            },
            OpsError::Runtime { message, .. } => message.clone(),
            OpsError::RemoteExit {
                host,
                command,
                exit_code,
            } => match host {
                Some(host) => format!("{} on {} exited with status {}", command, host, exit_code),
                None => format!("{} exited with status {}", command, exit_code),
            },
            OpsError::NoEligibleHost { role, requested } => match requested {
                Some(names) if names.is_empty() => {
                    format!("no eligible host: the target host list is empty ({} required)", role)
                }
                Some(names) => format!(
                    "no eligible host: none of [{}] has role {}",
                    names.join(", "),
                    role
                ),
                None => format!("no eligible host: no host has role {}", role),
            },
            OpsError::Membership { node, message } => format!("node {}: {}", node, message),
            OpsError::Timeout {
                operation,
                duration_secs,
            } => format!("{} timed out after {}s", operation, duration_secs),
        }
    }
}

impl std::error::Error for OpsError {}

impl fmt::Display for OpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            OpsError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            OpsError::Ssh {
                host,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "SSH ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                write_hint(f, suggestion.as_deref())
            }

            OpsError::Inventory {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "INVENTORY ERROR".red().bold(), message)?;
                write_hint(f, suggestion.as_deref())
            }

            OpsError::Config { message, path } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "File:".dimmed(), path.display())?;
                }
                Ok(())
            }

            OpsError::Runtime {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "RUNTIME ERROR".red().bold(), message)?;
                write_hint(f, suggestion.as_deref())
            }

            OpsError::RemoteExit {
                host,
                command,
                exit_code,
            } => {
                writeln!(
                    f,
                    "{}: exited with status {}",
                    "REMOTE FAILURE".red().bold(),
                    exit_code
                )?;
                writeln!(f, "  {} {}", "Command:".dimmed(), command)?;
                if let Some(host) = host {
                    writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                }
                Ok(())
            }

            OpsError::NoEligibleHost { role, requested } => {
                writeln!(f, "{}: no host has role {}", "NO ELIGIBLE HOST".red().bold(), role)?;
                if let Some(requested) = requested {
                    writeln!(f, "  {} [{}]", "Requested:".dimmed(), requested.join(", "))?;
                }
                write_hint(
                    f,
                    Some("Join a host with the required role or widen the host list"),
                )
            }

            OpsError::Membership { node, message } => {
                writeln!(f, "{}: {}", "MEMBERSHIP ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Node:".dimmed(), node)?;
                Ok(())
            }

            OpsError::Timeout {
                operation,
                duration_secs,
            } => {
                writeln!(
                    f,
                    "{}: {} timed out after {}s",
                    "TIMEOUT".red().bold(),
                    operation,
                    duration_secs
                )?;
                Ok(())
            }
        }
    }
}

fn write_hint(f: &mut fmt::Formatter<'_>, suggestion: Option<&str>) -> fmt::Result {
    if let Some(suggestion) = suggestion {
        writeln!(f)?;
        writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
    }
    Ok(())
}

/// Rejections raised synchronously by `start`, before any task exists
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("operation '{0}' requires credentials (password or private key)")]
    MissingCredentials(&'static str),
}
