use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One open (non-closed) port discovered by a primary scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetectedService {
    pub port: u16,
    pub protocol: String,
    pub name: String,
    pub state: String,
}

impl fmt::Display for DetectedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} ({})",
            self.port, self.protocol, self.name, self.state
        )
    }
}

/// Which tier a unit of work belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Primary,
    Secondary,
}

/// Final state of one unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CommandStatus {
    /// Process exited with status zero.
    Completed,
    /// Output file already present; not executed.
    Skipped,
    /// Same rendered command was already handled this run.
    Duplicate,
    /// Process exited non-zero or was killed by a signal.
    Failed { exit_code: Option<i32> },
    /// Killed after exceeding the per-command timeout.
    TimedOut,
    /// Killed or never started because the run was cancelled.
    Cancelled,
    /// Template rendering, spawning, or post-processing error.
    Error { message: String },
}

impl CommandStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CommandStatus::Failed { .. } | CommandStatus::TimedOut | CommandStatus::Error { .. }
        )
    }
}

/// Record of one unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub unit: u64,
    pub tier: Tier,
    pub scan: String,
    /// Rendered command, if rendering succeeded.
    pub command: Option<String>,
    pub output: Option<PathBuf>,
    /// Whether a subprocess was actually started.
    pub executed: bool,
    #[serde(flatten)]
    pub status: CommandStatus,
    pub timestamp: String,
}

/// Aggregate results of one `enumerate` run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RunSummary {
    pub address: String,
    pub started: String,
    pub finished: String,
    pub commands: Vec<CommandRecord>,
    /// Naturally sorted detected-service lines.
    pub services: Vec<String>,
}

impl RunSummary {
    pub fn count(&self, pred: impl Fn(&CommandStatus) -> bool) -> usize {
        self.commands.iter().filter(|c| pred(&c.status)).count()
    }

    pub fn executed(&self) -> usize {
        self.commands.iter().filter(|c| c.executed).count()
    }

    pub fn failures(&self) -> usize {
        self.count(CommandStatus::is_failure)
    }
}
