//! Application state and main logic

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::process::{Manager, ProcessState, StateEvent, Status};

const STATUS_MESSAGE_TTL: Duration = Duration::from_secs(5);

/// Which panel has keyboard focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    ProcessList,
    Logs,
}

/// Pending confirmation prompt shown in the status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Quit,
    StopAll,
}

/// Out-of-band messages from background tasks (signal handlers, spawned
/// manager operations).
#[derive(Debug)]
pub enum Notice {
    Info(String),
    Error(String),
    Terminate,
}

/// A catalog group as displayed in the process list.
pub struct GroupView {
    pub name: String,
    pub expanded: bool,
    pub processes: Vec<String>,
}

/// One visible row: either a group header or a process.
pub struct ListEntry {
    pub is_group: bool,
    pub name: String,
    pub group_idx: usize,
}

/// Main application state
pub struct App {
    pub should_quit: bool,
    pub focused: Panel,
    pub show_help: bool,
    pub fullscreen_logs: bool,
    pub confirm: Option<Confirm>,

    pub groups: Vec<GroupView>,
    pub entries: Vec<ListEntry>,
    pub states: HashMap<String, ProcessState>,
    pub selected: usize,
    pub selected_proc: Option<String>,

    /// Log scroll position measured from the bottom; 0 means pinned to the
    /// newest output (auto-scroll).
    pub log_offset: usize,

    pub error: Option<String>,
    error_set_at: Instant,
    pub notification: Option<String>,
    notification_set_at: Instant,

    manager: Arc<Manager>,
    events_rx: Option<mpsc::Receiver<StateEvent>>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    notice_rx: mpsc::UnboundedReceiver<Notice>,
}

impl App {
    pub fn new(manager: Arc<Manager>, auto_start: Option<String>) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let events_rx = manager.events();

        let mut app = Self {
            should_quit: false,
            focused: Panel::ProcessList,
            show_help: false,
            fullscreen_logs: false,
            confirm: None,

            groups: Vec::new(),
            entries: Vec::new(),
            states: HashMap::new(),
            selected: 0,
            selected_proc: None,

            log_offset: 0,

            error: None,
            error_set_at: Instant::now(),
            notification: None,
            notification_set_at: Instant::now(),

            manager,
            events_rx,
            notice_tx,
            notice_rx,
        };

        app.build_groups();
        app.rebuild_entries();
        app.refresh_states();
        app.select_first_process();

        if let Some(name) = auto_start {
            let mgr = Arc::clone(&app.manager);
            let tx = app.notice_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = mgr.start_by_name(&name).await {
                    let _ = tx.send(Notice::Error(e.to_string()));
                }
            });
        }

        app
    }

    /// Sender for signal handlers and other background notifiers.
    pub fn notice_sender(&self) -> mpsc::UnboundedSender<Notice> {
        self.notice_tx.clone()
    }

    /// Log lines of the currently selected process.
    pub fn selected_log_lines(&self) -> Vec<String> {
        let Some(name) = &self.selected_proc else {
            return Vec::new();
        };
        self.manager
            .log_buffer(name)
            .map(|buf| buf.all())
            .unwrap_or_default()
    }

    fn build_groups(&mut self) {
        let config = self.manager.config();
        let mut grouped: HashMap<&str, bool> = HashMap::new();

        for (name, group) in &config.groups {
            self.groups.push(GroupView {
                name: name.clone(),
                expanded: true,
                processes: group.processes.clone(),
            });
            for proc in &group.processes {
                grouped.insert(proc, true);
            }
        }

        // Processes outside every group fall into "other".
        let ungrouped: Vec<String> = config
            .processes
            .keys()
            .filter(|name| !grouped.contains_key(name.as_str()))
            .cloned()
            .collect();
        if !ungrouped.is_empty() {
            self.groups.push(GroupView {
                name: "other".to_string(),
                expanded: true,
                processes: ungrouped,
            });
        }
    }

    fn rebuild_entries(&mut self) {
        self.entries.clear();
        for (idx, group) in self.groups.iter().enumerate() {
            self.entries.push(ListEntry {
                is_group: true,
                name: group.name.clone(),
                group_idx: idx,
            });
            if group.expanded {
                for proc in &group.processes {
                    self.entries.push(ListEntry {
                        is_group: false,
                        name: proc.clone(),
                        group_idx: idx,
                    });
                }
            }
        }
    }

    fn refresh_states(&mut self) {
        for state in self.manager.snapshot_states() {
            self.states.insert(state.name.clone(), state);
        }
    }

    fn select_first_process(&mut self) {
        if let Some(idx) = self.entries.iter().position(|e| !e.is_group) {
            self.selected = idx;
            self.selected_proc = Some(self.entries[idx].name.clone());
        }
    }

    /// Periodic tick: drain manager events and background notices, refresh
    /// state snapshots, expire transient status-bar messages.
    pub fn on_tick(&mut self) {
        if let Some(rx) = &mut self.events_rx {
            while rx.try_recv().is_ok() {
                // Every event invalidates the snapshot; one refresh below
                // covers them all.
                self.error = None;
            }
        }

        while let Ok(notice) = self.notice_rx.try_recv() {
            match notice {
                Notice::Info(text) => {
                    self.notification = Some(text);
                    self.notification_set_at = Instant::now();
                }
                Notice::Error(text) => {
                    self.error = Some(text);
                    self.error_set_at = Instant::now();
                }
                Notice::Terminate => self.should_quit = true,
            }
        }

        self.refresh_states();

        if self.error.is_some() && self.error_set_at.elapsed() > STATUS_MESSAGE_TTL {
            self.error = None;
        }
        if self.notification.is_some() && self.notification_set_at.elapsed() > STATUS_MESSAGE_TTL {
            self.notification = None;
        }
    }

    pub fn on_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.request_quit();
            return;
        }

        if let Some(confirm) = self.confirm {
            self.handle_confirm_key(key, confirm);
            return;
        }

        if self.show_help {
            if matches!(key.code, KeyCode::Char('?') | KeyCode::Esc | KeyCode::Char('q')) {
                self.show_help = false;
            }
            return;
        }

        if self.fullscreen_logs {
            self.handle_fullscreen_key(key);
            return;
        }

        match self.focused {
            Panel::Logs => self.handle_log_panel_key(key),
            Panel::ProcessList => self.handle_process_list_key(key),
        }
    }

    fn handle_confirm_key(&mut self, key: KeyEvent, confirm: Confirm) {
        self.confirm = None;
        if key.code != KeyCode::Char('y') {
            return;
        }
        match confirm {
            Confirm::Quit => self.should_quit = true,
            Confirm::StopAll => {
                let mgr = Arc::clone(&self.manager);
                self.spawn_op(async move { mgr.stop_all().await });
            }
        }
    }

    fn handle_fullscreen_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('f') | KeyCode::Esc => self.fullscreen_logs = false,
            KeyCode::Char('q') => self.request_quit(),
            KeyCode::Char('?') => self.show_help = true,
            _ => self.handle_scroll_key(key),
        }
    }

    fn handle_log_panel_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Tab => self.focused = Panel::ProcessList,
            KeyCode::Char('q') => self.request_quit(),
            KeyCode::Char('?') => self.show_help = true,
            KeyCode::Char('f') => self.fullscreen_logs = true,
            _ => self.handle_scroll_key(key),
        }
    }

    fn handle_scroll_key(&mut self, key: KeyEvent) {
        let max = self.selected_log_lines().len();
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => {
                self.log_offset = (self.log_offset + 1).min(max);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.log_offset = self.log_offset.saturating_sub(1);
            }
            KeyCode::PageUp => {
                self.log_offset = (self.log_offset + 20).min(max);
            }
            KeyCode::PageDown => {
                self.log_offset = self.log_offset.saturating_sub(20);
            }
            KeyCode::Home => self.log_offset = max,
            KeyCode::End => self.log_offset = 0,
            _ => {}
        }
    }

    fn handle_process_list_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => self.request_quit(),
            KeyCode::Char('?') => self.show_help = true,
            KeyCode::Up | KeyCode::Char('k') => {
                if self.selected > 0 {
                    self.selected -= 1;
                    self.update_selected_proc();
                }
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < self.entries.len() {
                    self.selected += 1;
                    self.update_selected_proc();
                }
            }
            KeyCode::Enter => self.toggle_selected_group(),
            KeyCode::Char('s') => {
                if let Some(name) = self.selected_process_name() {
                    let mgr = Arc::clone(&self.manager);
                    self.spawn_op(async move { mgr.start_process(&name).await });
                }
            }
            KeyCode::Char('x') => {
                if let Some(name) = self.selected_process_name() {
                    let mgr = Arc::clone(&self.manager);
                    self.spawn_op(async move { mgr.stop_process(&name).await });
                }
            }
            KeyCode::Char('r') => {
                if let Some(name) = self.selected_process_name() {
                    let mgr = Arc::clone(&self.manager);
                    self.spawn_op(async move { mgr.restart_process(&name).await });
                }
            }
            KeyCode::Char('g') => {
                if let Some(processes) = self.selected_group_processes() {
                    let mgr = Arc::clone(&self.manager);
                    self.spawn_op(async move {
                        for name in processes {
                            mgr.start_process(&name).await?;
                        }
                        Ok(())
                    });
                }
            }
            KeyCode::Char('G') => {
                if let Some(processes) = self.selected_group_processes() {
                    let mgr = Arc::clone(&self.manager);
                    self.spawn_op(async move {
                        for name in processes {
                            mgr.stop_process(&name).await?;
                        }
                        Ok(())
                    });
                }
            }
            KeyCode::Char('a') => {
                let names: Vec<String> = self.manager.config().processes.keys().cloned().collect();
                let mgr = Arc::clone(&self.manager);
                self.spawn_op(async move {
                    for name in names {
                        mgr.start_process(&name).await?;
                    }
                    Ok(())
                });
            }
            KeyCode::Char('X') => {
                if self.count_by_status(Status::Running) > 0 {
                    self.confirm = Some(Confirm::StopAll);
                }
            }
            KeyCode::Tab | KeyCode::Char('l') => self.focused = Panel::Logs,
            KeyCode::Char('f') => self.fullscreen_logs = true,
            _ => {}
        }
    }

    fn request_quit(&mut self) {
        let live = self
            .states
            .values()
            .filter(|s| s.status.is_active())
            .count();
        if live > 0 {
            self.confirm = Some(Confirm::Quit);
        } else {
            self.should_quit = true;
        }
    }

    fn toggle_selected_group(&mut self) {
        let Some(entry) = self.entries.get(self.selected) else {
            return;
        };
        if !entry.is_group {
            return;
        }
        let idx = entry.group_idx;
        self.groups[idx].expanded = !self.groups[idx].expanded;
        self.rebuild_entries();
        if self.selected >= self.entries.len() {
            self.selected = self.entries.len().saturating_sub(1);
        }
    }

    fn update_selected_proc(&mut self) {
        if let Some(entry) = self.entries.get(self.selected) {
            if !entry.is_group {
                self.selected_proc = Some(entry.name.clone());
                self.log_offset = 0;
            }
        }
    }

    fn selected_process_name(&self) -> Option<String> {
        self.entries
            .get(self.selected)
            .filter(|e| !e.is_group)
            .map(|e| e.name.clone())
    }

    fn selected_group_processes(&self) -> Option<Vec<String>> {
        let entry = self.entries.get(self.selected)?;
        self.groups
            .get(entry.group_idx)
            .map(|g| g.processes.clone())
    }

    pub fn count_by_status(&self, status: Status) -> usize {
        self.states.values().filter(|s| s.status == status).count()
    }

    fn spawn_op<F>(&self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let tx = self.notice_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                let _ = tx.send(Notice::Error(e.to_string()));
            }
        });
    }

    /// Shut the manager down before the terminal is restored.
    pub async fn cleanup(&self) {
        self.manager.shutdown().await;
    }
}
