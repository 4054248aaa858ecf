// Output module for the clusterops CLI

pub mod errors;
pub mod terminal;

pub use errors::*;
pub use terminal::*;

use crate::orchestrator::{PollResponse, StartResponse, TaskSummary};

/// Output format for the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON, one document per response
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}' (text, json)", other)),
        }
    }
}

/// Unified output writer supporting both text and JSON formats
pub enum OutputWriter {
    Text(TerminalOutput),
    Json,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, quiet: bool) -> Self {
        match format {
            OutputFormat::Text => OutputWriter::Text(TerminalOutput::new(quiet)),
            OutputFormat::Json => OutputWriter::Json,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, OutputWriter::Json)
    }

    pub fn print_started(&self, started: &StartResponse) {
        match self {
            OutputWriter::Text(output) => output.print_started(started),
            OutputWriter::Json => print_json(started),
        }
    }

    pub fn print_poll(&self, poll: &PollResponse) {
        match self {
            OutputWriter::Text(output) => output.print_poll(poll),
            OutputWriter::Json => print_json(poll),
        }
    }

    pub fn print_tasks(&self, tasks: &[TaskSummary]) {
        match self {
            OutputWriter::Text(output) => output.print_tasks(tasks),
            OutputWriter::Json => print_json(&tasks),
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to encode output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
