//! Application state and UI logic.
//!
//! `App` holds what the terminal front end shows: one row per service, the
//! merged log history, and the scroll position. Key presses are translated
//! into `AppAction`s that the main loop executes against the supervisor.

use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::logs::LogEntry;
use crate::output::LogBuffer;
use crate::service::{Lifecycle, ServiceKind, ServiceSpec, ServiceState};
use crate::supervisor::{StatusSnapshot, Supervisor};

/// One line of the status table.
#[derive(Debug, Clone)]
pub struct ServiceRow {
    pub kind: ServiceKind,
    pub name: String,
    pub state: ServiceState,
    pub lifecycle: Lifecycle,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
}

impl ServiceRow {
    /// Observed state, overridden while a start or stop is in flight.
    pub fn display_state(&self) -> &'static str {
        match self.lifecycle {
            Lifecycle::Starting => "starting",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped | Lifecycle::Running => self.state.label(),
        }
    }

    pub fn pid_label(&self) -> String {
        self.pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into())
    }

    pub fn uptime_label(&self) -> String {
        self.uptime
            .map(format_duration)
            .unwrap_or_else(|| "-".into())
    }
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    None,
    Quit,
    Start(ServiceKind),
    Stop(ServiceKind),
    StartAll,
    StopAll,
    CleanCache,
}

impl AppAction {
    /// Text shown while the action runs.
    pub fn describe(self) -> Option<String> {
        match self {
            AppAction::None | AppAction::Quit => None,
            AppAction::Start(kind) => Some(format!("starting {}", kind)),
            AppAction::Stop(kind) => Some(format!("stopping {}", kind)),
            AppAction::StartAll => Some("starting all services".into()),
            AppAction::StopAll => Some("stopping all services".into()),
            AppAction::CleanCache => Some("clearing caches".into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// The main application state container.
#[derive(Debug)]
pub struct App {
    pub rows: Vec<ServiceRow>,
    /// Index of the selected row.
    pub selected: usize,
    pub logs: LogBuffer,
    /// Whether the log view sticks to the newest line.
    pub follow: bool,
    /// First visible log line when not following.
    pub scroll: usize,
    /// Height of the log view area (for scrolling calculations).
    pub log_view_height: usize,
    pub should_quit: bool,
    pub show_help: bool,
    /// Set by the first `c`; a second `c` confirms the cache clear.
    pub confirm_clean: bool,
    /// Time of the last completed status refresh.
    pub last_refresh: Option<Instant>,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(specs: &[ServiceSpec], max_lines: usize) -> Self {
        let rows = specs
            .iter()
            .map(|spec| ServiceRow {
                kind: spec.kind,
                name: spec.name.clone(),
                state: ServiceState::Unknown,
                lifecycle: Lifecycle::Stopped,
                pid: None,
                uptime: None,
            })
            .collect();
        Self {
            rows,
            selected: 0,
            logs: LogBuffer::new(max_lines),
            follow: true,
            scroll: 0,
            log_view_height: 0,
            should_quit: false,
            show_help: false,
            confirm_clean: false,
            last_refresh: None,
            status_message: None,
        }
    }

    pub fn selected_kind(&self) -> Option<ServiceKind> {
        self.rows.get(self.selected).map(|row| row.kind)
    }

    pub fn on_log(&mut self, entry: LogEntry) {
        let dropped = self.logs.push(entry);
        if self.follow {
            self.ensure_follow();
        } else if dropped {
            // Keep the same lines on screen while older ones fall off.
            self.scroll = self.scroll.saturating_sub(1);
        }
    }

    pub fn apply_status(&mut self, status: &StatusSnapshot) {
        for row in &mut self.rows {
            if let Some(state) = status.get(&row.kind) {
                row.state = *state;
            }
        }
        self.last_refresh = Some(Instant::now());
    }

    /// Copies ownership details (pid, uptime, lifecycle) from the controllers.
    pub fn sync_controllers(&mut self, supervisor: &Supervisor) {
        for row in &mut self.rows {
            if let Some(controller) = supervisor.controller(row.kind) {
                row.lifecycle = controller.lifecycle();
                row.pid = controller.owned_pid();
                row.uptime = controller.uptime();
            }
        }
    }

    /// Marks a row as transitioning before a slow command runs.
    pub fn mark_pending(&mut self, action: AppAction) {
        let (kinds, lifecycle): (Vec<ServiceKind>, Lifecycle) = match action {
            AppAction::Start(kind) => (vec![kind], Lifecycle::Starting),
            AppAction::Stop(kind) => (vec![kind], Lifecycle::Stopping),
            AppAction::StartAll => (ServiceKind::ALL.to_vec(), Lifecycle::Starting),
            AppAction::StopAll => (ServiceKind::ALL.to_vec(), Lifecycle::Stopping),
            _ => return,
        };
        for row in self.rows.iter_mut().filter(|row| kinds.contains(&row.kind)) {
            row.lifecycle = lifecycle;
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        let ctrl_c =
            key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
        if self.show_help {
            self.show_help = false;
            if key.code != KeyCode::Char('q') {
                return AppAction::None;
            }
        }
        if std::mem::take(&mut self.confirm_clean) {
            if key.code == KeyCode::Char('c') && !ctrl_c {
                self.status_message = None;
                return AppAction::CleanCache;
            }
            self.set_status_message("cache clear cancelled");
            if key.code != KeyCode::Char('q') && !ctrl_c {
                return AppAction::None;
            }
        }
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Char('c') if ctrl_c => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Up => {
                self.selected = self.selected.saturating_sub(1);
                AppAction::None
            }
            KeyCode::Down => {
                if self.selected + 1 < self.rows.len() {
                    self.selected += 1;
                }
                AppAction::None
            }
            KeyCode::Char('s') => self
                .selected_kind()
                .map(AppAction::Start)
                .unwrap_or(AppAction::None),
            KeyCode::Char('x') => self
                .selected_kind()
                .map(AppAction::Stop)
                .unwrap_or(AppAction::None),
            KeyCode::Char('A') => AppAction::StartAll,
            KeyCode::Char('X') => AppAction::StopAll,
            KeyCode::Char('c') => {
                self.confirm_clean = true;
                self.set_status_warning_persistent(
                    "press c again to clear caches, any other key cancels",
                );
                AppAction::None
            }
            KeyCode::Char('f') => {
                self.follow = !self.follow;
                if self.follow {
                    self.ensure_follow();
                }
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = true;
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.scroll = 0;
                self.follow = false;
                AppAction::None
            }
            KeyCode::End => {
                self.follow = true;
                self.ensure_follow();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn max_scroll(&self) -> usize {
        self.logs.len().saturating_sub(self.log_view_height.max(1))
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let current = if self.follow { max_scroll } else { self.scroll };
        self.scroll = current.saturating_sub(amount).min(max_scroll);
        self.follow = false;
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let current = if self.follow { max_scroll } else { self.scroll };
        let next = (current + amount).min(max_scroll);
        self.scroll = next;
        self.follow = next == max_scroll;
    }

    pub fn ensure_follow(&mut self) {
        self.scroll = self.max_scroll();
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let max_scroll = self.max_scroll();
        if self.follow {
            self.scroll = max_scroll;
        } else {
            self.scroll = self.scroll.min(max_scroll);
        }
    }

    /// Range of log indices currently on screen.
    pub fn visible_range(&self) -> std::ops::Range<usize> {
        let start = self.scroll.min(self.logs.len());
        let end = (start + self.log_view_height.max(1)).min(self.logs.len());
        start..end
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let still_visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        still_visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(
            message,
            StatusLevel::Warning,
            Some(Duration::from_secs(5)),
        );
    }

    pub fn set_status_warning_persistent(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, None);
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }

    pub fn status_line(&self) -> String {
        let refreshed = self
            .last_refresh
            .map(|at| format!("{}s ago", at.elapsed().as_secs()))
            .unwrap_or_else(|| "pending".into());
        format!(
            "lines: {} | follow: {} | refreshed: {}",
            self.logs.len(),
            if self.follow { "on" } else { "off" },
            refreshed
        )
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
