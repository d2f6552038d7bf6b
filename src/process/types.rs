//! Process status and state snapshot types

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle status of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stopped,
    Starting,
    Running,
    Failed,
    Retrying,
    Stopping,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Stopped => "stopped",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Failed => "failed",
            Status::Retrying => "retrying",
            Status::Stopping => "stopping",
        }
    }

    /// Whether the process has (or is acquiring / pending) a live run:
    /// Running, Starting, or Retrying. These are the states a stop request
    /// or a cascading failure must act on.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Running | Status::Starting | Status::Retrying)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value-type snapshot of a process's runtime state.
///
/// Returned by `ManagedProcess::state` and `Manager::snapshot_states`; always
/// a consistent copy taken under the per-process lock.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessState {
    pub name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Local>>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub exit_code: i32,
}

impl ProcessState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: Status::Stopped,
            pid: None,
            started_at: None,
            stopped_at: None,
            retry_count: 0,
            next_retry_at: None,
            last_error: String::new(),
            exit_code: 0,
        }
    }

    /// Time since start while live, or the total run time once stopped.
    /// Derived, never stored.
    pub fn uptime(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let end = match self.status {
            Status::Running | Status::Stopping => Local::now(),
            _ => match self.stopped_at {
                Some(stopped) => stopped,
                None => return Duration::ZERO,
            },
        };
        end.signed_duration_since(started)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
