// Terminal rendering of operation status

use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::{PollResponse, PollStatus, StartResponse, TaskSummary};

/// Terminal output manager
pub struct TerminalOutput {
    quiet: bool,
    is_tty: bool,
}

impl TerminalOutput {
    pub fn new(quiet: bool) -> Self {
        let is_tty = console::Term::stdout().is_term();

        // Respect NO_COLOR (https://no-color.org/) and pipes
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput { quiet, is_tty }
    }

    pub fn print_started(&self, started: &StartResponse) {
        if self.quiet {
            println!("{}", started.task_id);
            return;
        }
        println!("{}", render_started(started));
    }

    pub fn print_poll(&self, poll: &PollResponse) {
        println!("{}", render_poll(poll, !self.quiet));
    }

    pub fn print_tasks(&self, tasks: &[TaskSummary]) {
        println!("{}", render_tasks(tasks));
    }

    /// Print the part of `logs` not yet shown; returns the new offset
    pub fn print_log_tail(&self, logs: &str, shown: usize) -> usize {
        let tail = logs.get(shown..).unwrap_or_default();
        if !self.quiet && !tail.is_empty() {
            print!("{}", tail.dimmed());
        }
        logs.len()
    }

    /// Spinner shown while following a task
    pub fn follow_spinner(&self, task_id: &str) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new_spinner();
        let style = if self.is_tty {
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {prefix:.bold} {msg} [{elapsed}]")
                .unwrap()
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        } else {
            ProgressStyle::default_spinner()
                .template("{prefix} {msg}")
                .unwrap()
        };
        pb.set_style(style);
        pb.set_prefix(task_id.to_string());
        pb.set_message("running");
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

pub fn format_status(status: PollStatus) -> ColoredString {
    match status {
        PollStatus::Running => "RUNNING".yellow().bold(),
        PollStatus::Completed => "COMPLETED".green().bold(),
        PollStatus::Failed => "FAILED".red().bold(),
        PollStatus::NotFound => "NOT FOUND".dimmed(),
    }
}

pub fn render_started(started: &StartResponse) -> String {
    format!(
        "{} {} {}",
        "STARTED".cyan().bold(),
        started.task_id.white().bold(),
        started.message.dimmed()
    )
}

pub fn render_poll(poll: &PollResponse, with_logs: bool) -> String {
    let mut out = String::new();

    let kind = poll.kind.map(|k| k.to_string()).unwrap_or_default();
    out.push_str(&format!(
        "{} {} {}\n",
        format_status(poll.status),
        poll.task_id.white().bold(),
        kind.cyan()
    ));

    if let Some(start) = poll.start_time {
        out.push_str(&format!("  started  {}\n", start.to_rfc3339()));
    }
    if let (Some(start), Some(end)) = (poll.start_time, poll.end_time) {
        let secs = (end - start).num_milliseconds() as f64 / 1000.0;
        out.push_str(&format!("  finished {} ({:.1}s)\n", end.to_rfc3339(), secs));
    }
    if let Some(error) = &poll.error {
        out.push_str(&format!("  {} {}\n", "error:".red().bold(), error));
    }

    if with_logs && !poll.logs.is_empty() {
        out.push_str(&format!("{}\n", "─".repeat(60).dimmed()));
        for line in poll.logs.lines() {
            out.push_str(&format!("  {}\n", line));
        }
    }

    out.trim_end().to_string()
}

pub fn render_tasks(tasks: &[TaskSummary]) -> String {
    if tasks.is_empty() {
        return "No tasks".dimmed().to_string();
    }

    let mut out = format!(
        "{:<38} {:<20} {:<10} {}\n",
        "TASK".bold(),
        "KIND".bold(),
        "STATUS".bold(),
        "STARTED".bold()
    );
    for task in tasks {
        // Pad before colouring so escape codes don't skew the columns
        let status = format!("{:<10}", task.status.as_str());
        let status = match task.status {
            PollStatus::Completed => status.green(),
            PollStatus::Failed => status.red(),
            _ => status.yellow(),
        };
        out.push_str(&format!(
            "{:<38} {:<20} {} {}\n",
            task.task_id,
            task.kind.as_str(),
            status,
            task.start_time.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskKind;
    use chrono::{TimeZone, Utc};

    fn poll(status: PollStatus, error: Option<&str>) -> PollResponse {
        PollResponse {
            task_id: "t-1".to_string(),
            kind: Some(TaskKind::JoinNode),
            status,
            logs: "[wk-9] ok\n[wk-9] done\n".to_string(),
            start_time: Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()),
            end_time: Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 15).unwrap()),
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_render_failed_poll() {
        let text = render_poll(&poll(PollStatus::Failed, Some("node wk-9: already joined")), true);
        let plain = console::strip_ansi_codes(&text);

        assert!(plain.starts_with("FAILED t-1 join-node"));
        assert!(plain.contains("(10.0s)"));
        assert!(plain.contains("error: node wk-9: already joined"));
        assert!(plain.contains("  [wk-9] done"));
    }

    #[test]
    fn test_render_poll_without_logs() {
        let text = render_poll(&poll(PollStatus::Completed, None), false);
        let plain = console::strip_ansi_codes(&text);
        assert!(!plain.contains("[wk-9]"));
        assert!(!plain.contains("error:"));
    }

    #[test]
    fn test_render_task_table() {
        let tasks = vec![TaskSummary {
            task_id: "t-1".to_string(),
            kind: TaskKind::RunScript,
            status: PollStatus::Running,
            start_time: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            end_time: None,
            error: None,
        }];
        let text = render_tasks(&tasks);
        let plain = console::strip_ansi_codes(&text);

        let rows: Vec<&str> = plain.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].contains("run-script"));
        assert!(rows[1].contains("running"));
        assert!(rows[1].ends_with("2026-01-02 03:04:05"));

        assert_eq!(console::strip_ansi_codes(&render_tasks(&[])), "No tasks");
    }
}
