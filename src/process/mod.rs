//! Process orchestration
//!
//! The dependency graph, the per-process lifecycle state machine, PTY-backed
//! child execution, the retry scheduler, and the manager that coordinates
//! start/stop/restart across them.

mod graph;
mod managed;
mod manager;
mod retry;
mod types;

pub use graph::DependencyGraph;
pub use managed::{ManagedProcess, STOP_TIMEOUT};
pub use manager::{
    Manager, StateEvent, TargetKind, DEP_HEALTH_DELAY, DEP_WAIT_TIMEOUT, EVENT_CHANNEL_CAPACITY,
    HEALTH_POLL_INTERVAL,
};
pub use retry::{next_backoff, should_retry};
pub use types::{ProcessState, Status};
