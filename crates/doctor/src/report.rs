//! Diagnostic run timeline and report rendering.

use std::fmt;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

/// Outcome of a single diagnostic step.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Blocked,
    Warn,
    Error,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Blocked => write!(f, "blocked"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// The recorded outcome of one diagnostic step.
///
/// Results are appended to the run's timeline in execution order and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticResult {
    pub step: String,
    pub status: StepStatus,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall verdict of a run, decided by the runner.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Every step completed cleanly.
    Ok,
    /// A blocked or degraded state was found, but the diagnosis completed.
    Degraded,
    /// The run could not complete (target missing, API unreachable).
    Fatal,
}

/// Ordered timeline of a diagnostic run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub command: String,
    pub results: Vec<DiagnosticResult>,
    pub outcome: Outcome,
}

impl RunReport {
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            results: Vec::new(),
            outcome: Outcome::Ok,
        }
    }

    fn record(&mut self, step: &str, status: StepStatus, detail: String, error: Option<String>) {
        self.results.push(DiagnosticResult {
            step: step.to_string(),
            status,
            detail,
            timestamp: Utc::now(),
            error,
        });
    }

    pub fn record_ok(&mut self, step: &str, detail: impl Into<String>) {
        self.record(step, StepStatus::Ok, detail.into(), None);
    }

    pub fn record_blocked(&mut self, step: &str, detail: impl Into<String>) {
        self.record(step, StepStatus::Blocked, detail.into(), None);
    }

    pub fn record_warn(&mut self, step: &str, detail: impl Into<String>, error: &impl fmt::Display) {
        self.record(step, StepStatus::Warn, detail.into(), Some(error.to_string()));
    }

    pub fn record_error(&mut self, step: &str, error: &impl fmt::Display) {
        self.record(
            step,
            StepStatus::Error,
            String::new(),
            Some(error.to_string()),
        );
    }

    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.status == StepStatus::Ok)
    }

    /// Exit code contract: 0 all ok, 1 degraded but diagnosed, 2 fatal.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Ok => 0,
            Outcome::Degraded => 1,
            Outcome::Fatal => 2,
        }
    }

    /// Print the timeline and verdict for human consumption.
    pub fn print_summary(&self) {
        println!();
        println!("{} {}", "diagnostic run:".bold(), self.command);
        for result in &self.results {
            let status = match result.status {
                StepStatus::Ok => "  ok   ".green(),
                StepStatus::Blocked => "blocked".yellow(),
                StepStatus::Warn => " warn  ".yellow(),
                StepStatus::Error => " error ".red(),
            };
            let mut line = format!("[{status}] {:<22} {}", result.step, result.detail);
            if let Some(err) = &result.error {
                line.push_str(&format!(" ({err})"));
            }
            println!("{line}");
        }
        let verdict = match self.outcome {
            Outcome::Ok => "OK".green().bold(),
            Outcome::Degraded => "DEGRADED".yellow().bold(),
            Outcome::Fatal => "FATAL".red().bold(),
        };
        println!("{} {}", "verdict:".bold(), verdict);
        println!();
    }
}
