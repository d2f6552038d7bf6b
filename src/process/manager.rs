//! Process orchestration: dependency-ordered start/stop, retries, cascades

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::core::{Config, LogBuffer, DEFAULT_BUFFER_CAPACITY};
use crate::process::{
    next_backoff, should_retry, DependencyGraph, ManagedProcess, ProcessState, Status,
};

/// How long a dependency must stay Running before dependents may start.
pub const DEP_HEALTH_DELAY: Duration = Duration::from_secs(2);
/// Upper bound on waiting for any single dependency to become healthy.
pub const DEP_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll interval while waiting on dependency health.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Bounded capacity of the state-event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Emitted on every externally observable state transition.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub name: String,
    pub old_state: Status,
    pub new_state: Status,
    pub error: String,
}

/// What kind of catalog entry a user-supplied name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Stack,
    Group,
    Process,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Stack => "stack",
            TargetKind::Group => "group",
            TargetKind::Process => "process",
        }
    }
}

/// Cooperative shutdown flag shared by monitor sleeps, health waits, and
/// startup loops. Cancellation never signals children; `Manager::shutdown`
/// stops them explicitly.
#[derive(Clone, Debug)]
struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Orchestrates all managed processes: owns the catalog, the dependency
/// graph, the per-process log buffers, and the bounded event channel.
///
/// Maps are populated once at construction and only read afterwards; mutable
/// runtime state lives inside each `ManagedProcess` behind its own lock.
#[derive(Debug)]
pub struct Manager {
    config: Arc<Config>,
    graph: DependencyGraph,
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    log_buffers: RwLock<HashMap<String, Arc<LogBuffer>>>,
    events_tx: mpsc::Sender<StateEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<StateEvent>>>,
    cancel: CancelToken,
    // Handle to ourselves for spawning monitor tasks that outlive the caller.
    self_ref: Weak<Manager>,
}

impl Manager {
    /// Build a manager from a validated catalog. Fails if the dependency
    /// graph has cycles.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let graph = DependencyGraph::new(&config);
        graph.validate().context("invalid dependency graph")?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut processes = HashMap::new();
        let mut log_buffers = HashMap::new();
        for (name, proc_cfg) in &config.processes {
            let buf = Arc::new(LogBuffer::new(DEFAULT_BUFFER_CAPACITY));
            log_buffers.insert(name.clone(), Arc::clone(&buf));
            processes.insert(
                name.clone(),
                Arc::new(ManagedProcess::new(name, proc_cfg.clone(), buf)),
            );
        }

        Ok(Arc::new_cyclic(|weak| Self {
            config: Arc::new(config),
            graph,
            processes: RwLock::new(processes),
            log_buffers: RwLock::new(log_buffers),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancelToken::new(),
            self_ref: weak.clone(),
        }))
    }

    /// Take the state-event receiver. Single consumer: the first caller gets
    /// it, later callers get `None`. Delivery is lossy (drop-on-full); use
    /// `snapshot_states` to reconcile.
    pub fn events(&self) -> Option<mpsc::Receiver<StateEvent>> {
        self.events_rx.lock().take()
    }

    /// Snapshot of every process's state, in name order.
    pub fn snapshot_states(&self) -> Vec<ProcessState> {
        let processes = self.processes.read();
        let mut names: Vec<&String> = processes.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| processes[name].state())
            .collect()
    }

    /// The log buffer for a process, if the name exists.
    pub fn log_buffer(&self, name: &str) -> Option<Arc<LogBuffer>> {
        self.log_buffers.read().get(name).cloned()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Classify a user-supplied name. Names are unique across kinds, so the
    /// stack -> group -> process check order cannot change the answer.
    pub fn resolve(&self, name: &str) -> Result<TargetKind> {
        if self.config.stacks.contains_key(name) {
            return Ok(TargetKind::Stack);
        }
        if self.config.groups.contains_key(name) {
            return Ok(TargetKind::Group);
        }
        if self.config.processes.contains_key(name) {
            return Ok(TargetKind::Process);
        }
        Err(anyhow!(
            "unknown name: {} (not a stack, group, or process)",
            name
        ))
    }

    /// Start a process and all of its transitive dependencies.
    pub async fn start_process(&self, name: &str) -> Result<()> {
        let order = self.graph.start_order(&[name.to_string()])?;
        self.start_in_order(&order).await
    }

    /// Start every process in the named group (plus dependencies).
    pub async fn start_group(&self, group_name: &str) -> Result<()> {
        let group = self
            .config
            .groups
            .get(group_name)
            .ok_or_else(|| anyhow!("unknown group: {}", group_name))?;

        let order = self.graph.start_order(&group.processes)?;
        self.start_in_order(&order).await
    }

    /// Start every group in the named stack (plus dependencies).
    pub async fn start_stack(&self, stack_name: &str) -> Result<()> {
        let stack = self
            .config
            .stacks
            .get(stack_name)
            .ok_or_else(|| anyhow!("unknown stack: {}", stack_name))?;

        let mut targets = Vec::new();
        for group_name in &stack.groups {
            let group = self.config.groups.get(group_name).ok_or_else(|| {
                anyhow!("stack {} references unknown group {}", stack_name, group_name)
            })?;
            targets.extend(group.processes.iter().cloned());
        }

        let order = self.graph.start_order(&targets)?;
        self.start_in_order(&order).await
    }

    /// Resolve a name and start the corresponding stack, group, or process.
    pub async fn start_by_name(&self, name: &str) -> Result<()> {
        match self.resolve(name)? {
            TargetKind::Stack => self.start_stack(name).await,
            TargetKind::Group => self.start_group(name).await,
            TargetKind::Process => self.start_process(name).await,
        }
    }

    /// Stop a process, stopping its active transitive dependents first in
    /// reverse-topological order.
    pub async fn stop_process(&self, name: &str) -> Result<()> {
        self.process(name)?;

        let dependents = self.graph.dependents(name);
        let active: Vec<String> = dependents
            .into_iter()
            .filter(|dep| {
                self.process(dep)
                    .map(|p| p.state().status.is_active())
                    .unwrap_or(false)
            })
            .collect();

        // stop_order expands to the dependency closure; keep only the
        // dependents actually being stopped.
        let order: Vec<String> = match self.graph.stop_order(&active) {
            Ok(order) => order.into_iter().filter(|n| active.contains(n)).collect(),
            Err(_) => active,
        };

        for dep in &order {
            if let Err(e) = self.stop_single(dep).await {
                warn!(process = %dep, error = %e, "failed to stop dependent");
            }
        }

        self.stop_single(name).await
    }

    /// Stop a process, then start it and every dependent that was previously
    /// running, failed, or retrying. Retry counters reset: this is a fresh
    /// run session. Dependent restarts are best-effort.
    pub async fn restart_process(&self, name: &str) -> Result<()> {
        let mut restart_deps = Vec::new();
        for dep in self.graph.dependents(name) {
            let status = self.process(&dep)?.state().status;
            if matches!(
                status,
                Status::Running | Status::Starting | Status::Failed | Status::Retrying
            ) {
                restart_deps.push(dep);
            }
        }

        self.stop_process(name)
            .await
            .with_context(|| format!("stopping {} for restart", name))?;

        let proc = self.process(name)?;
        proc.reset_retry();
        self.start_single(name)
            .with_context(|| format!("restarting {}", name))?;

        for dep in restart_deps {
            let proc = self.process(&dep)?;
            proc.reset_retry();
            if let Err(e) = self.start_single(&dep) {
                warn!(process = %dep, error = %e, "failed to restart dependent");
            }
        }

        Ok(())
    }

    /// Stop everything that is live, dependents before dependencies. Falls
    /// back to arbitrary order if the graph computation fails.
    pub async fn stop_all(&self) -> Result<()> {
        let live: Vec<String> = {
            let processes = self.processes.read();
            processes
                .iter()
                .filter(|(_, p)| {
                    let status = p.state().status;
                    status.is_active() || status == Status::Stopping
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        if live.is_empty() {
            return Ok(());
        }

        let order = match self.graph.stop_order(&live) {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "stop order unavailable, stopping in arbitrary order");
                live.clone()
            }
        };

        for name in &order {
            let Ok(proc) = self.process(name) else {
                continue;
            };
            if proc.state().status.is_active() {
                if let Err(e) = self.stop_single(name).await {
                    warn!(process = %name, error = %e, "failed to stop process during stop-all");
                }
            }
        }

        Ok(())
    }

    /// Trip the cancellation token and stop every process. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.stop_all().await;
    }

    fn process(&self, name: &str) -> Result<Arc<ManagedProcess>> {
        self.processes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown process: {}", name))
    }

    /// Start processes sequentially in dependency order, skipping the ones
    /// already running. Each step waits for its direct dependencies to be
    /// healthy before launching.
    async fn start_in_order(&self, order: &[String]) -> Result<()> {
        for name in order {
            if self.cancel.is_cancelled() {
                bail!("start cancelled: manager is shutting down");
            }

            let proc = self.process(name)?;
            let state = proc.state();

            if state.status == Status::Running {
                continue;
            }

            // A permanently failed transitive dependency poisons this start.
            for dep in self.graph.dependencies(name) {
                let dep_proc = self.process(&dep)?;
                if dep_proc.state().status == Status::Failed {
                    let msg = format!("dependency {} failed", dep);
                    proc.set_status(Status::Failed);
                    proc.set_error(&msg);
                    self.emit(name, state.status, Status::Failed, &msg);
                    bail!("cannot start {}: {}", name, msg);
                }
            }

            let proc_cfg = self
                .config
                .processes
                .get(name)
                .ok_or_else(|| anyhow!("unknown process: {}", name))?;
            for dep in &proc_cfg.depends_on {
                self.wait_for_healthy(dep)
                    .await
                    .with_context(|| format!("waiting for dependency {}", dep))?;
            }

            self.start_single(name)?;
        }
        Ok(())
    }

    /// Launch one process and attach a monitor task to its run session.
    fn start_single(&self, name: &str) -> Result<()> {
        let proc = self.process(name)?;
        let old_status = proc.state().status;

        if let Err(e) = proc.start() {
            self.emit(name, old_status, Status::Failed, &e.to_string());
            return Err(e);
        }
        self.emit(name, old_status, Status::Running, "");

        // The monitor owns the retry decision for this run session; it must
        // outlive the caller, so it holds its own strong handle.
        if let Some(mgr) = self.self_ref.upgrade() {
            let name = name.to_string();
            tokio::spawn(async move { mgr.monitor(name).await });
        }

        Ok(())
    }

    /// Stop one process. A process in Retrying has no live child; its pending
    /// retry is cancelled by moving it to Stopped (the sleeping monitor sees
    /// the state change and gives up).
    async fn stop_single(&self, name: &str) -> Result<()> {
        let proc = self.process(name)?;
        let old_status = proc.state().status;

        if old_status == Status::Retrying {
            proc.set_status(Status::Stopped);
            self.emit(name, old_status, Status::Stopped, "");
            return Ok(());
        }

        proc.stop().await?;
        self.emit(name, old_status, Status::Stopped, "");
        Ok(())
    }

    /// One monitor per live child: observe the exit, then either schedule a
    /// retry or declare permanent failure and cascade it. A new monitor is
    /// spawned by every successful start, including retries.
    async fn monitor(self: Arc<Self>, name: String) {
        let Ok(proc) = self.process(&name) else {
            return;
        };

        proc.exited().await;

        let state = proc.state();

        // Intentional stop or clean exit: nothing to do.
        if state.status == Status::Stopped {
            return;
        }

        let Some(proc_cfg) = self.config.processes.get(&name) else {
            return;
        };
        let retry_count = state.retry_count;

        if should_retry(retry_count, &proc_cfg.retry) {
            let backoff = next_backoff(retry_count, &proc_cfg.retry);
            proc.set_status(Status::Retrying);
            let backoff_chrono = chrono::Duration::from_std(backoff)
                .unwrap_or_else(|_| chrono::Duration::zero());
            proc.set_retry_state(retry_count + 1, Local::now() + backoff_chrono);
            self.emit(&name, Status::Failed, Status::Retrying, "");

            info!(
                process = %name,
                attempt = retry_count + 1,
                backoff_ms = backoff.as_millis() as u64,
                "scheduling retry"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            // The user may have stopped or restarted us during the backoff.
            if proc.state().status != Status::Retrying {
                return;
            }

            if let Err(e) = self.start_single(&name) {
                // start_single emitted the failure; the next monitor (if the
                // spawn got that far) owns any further retries.
                error!(process = %name, error = %e, "retry failed");
            }
        } else {
            proc.set_status(Status::Failed);
            self.emit(
                &name,
                Status::Failed,
                Status::Failed,
                &format!("max retries exhausted (exit code {})", state.exit_code),
            );

            self.cascade_failure(&name).await;
        }
    }

    /// Mark every transitive dependent of a permanently failed process as
    /// Failed, stopping the live ones first.
    async fn cascade_failure(&self, name: &str) {
        for dep in self.graph.dependents(name) {
            let Ok(proc) = self.process(&dep) else {
                continue;
            };

            if proc.state().status.is_active() {
                if let Err(e) = self.stop_single(&dep).await {
                    warn!(process = %dep, error = %e, "failed to stop dependent during cascade");
                }
            }

            let msg = format!("dependency {} failed", name);
            let old_status = proc.state().status;
            proc.set_status(Status::Failed);
            proc.set_error(&msg);
            self.emit(&dep, old_status, Status::Failed, &msg);
        }
    }

    /// Block until `name` has been Running for the health delay. Polls every
    /// 200ms, bounded by the dependency wait timeout, aborted by manager
    /// cancellation or the dependency entering Failed.
    async fn wait_for_healthy(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + DEP_WAIT_TIMEOUT;

        loop {
            if self.cancel.is_cancelled() {
                bail!("manager is shutting down");
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for {} to become healthy", name);
            }

            let state = self.process(name)?.state();
            if state.status == Status::Failed {
                bail!("dependency {} is in failed state", name);
            }
            if state.status == Status::Running {
                if let Some(started) = state.started_at {
                    let running_for = Local::now()
                        .signed_duration_since(started)
                        .to_std()
                        .unwrap_or_default();
                    if running_for >= DEP_HEALTH_DELAY {
                        return Ok(());
                    }
                }
            }

            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Best-effort event publication: drop and warn when the channel is full.
    fn emit(&self, name: &str, old_state: Status, new_state: Status, error: &str) {
        let event = StateEvent {
            name: name.to_string(),
            old_state,
            new_state,
            error: error.to_string(),
        };
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(process = %name, "event channel full, dropping event");
            }
            // Receiver gone (UI shut down); nothing left to notify.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
