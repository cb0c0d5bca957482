//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the application state using `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph};
use ratatui::Terminal;

use crate::app::{App, ServiceRow, StatusLevel};
use crate::logs::{LogEntry, LogKind, LogSource};
use crate::output::source_label;
use crate::service::{Lifecycle, ServiceKind, ServiceState};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const HELP_LINE: &str =
    "↑/↓ select | s start | x stop | A start all | X stop all | c c clean cache | f follow | q quit | ? help";

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, SetTitle("airack"))?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    terminal.draw(|frame| {
        let area = frame.size();
        let services_height = app.rows.len() as u16 + 2;
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(services_height),
                Constraint::Min(3),
                Constraint::Length(4),
            ])
            .split(area);
        let border_style = Style::default().fg(Color::DarkGray);

        let items: Vec<ListItem> = app
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| ListItem::new(service_line(row, idx == app.selected)))
            .collect();
        let list = List::new(items).block(
            Block::default()
                .title("Services")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        let mut state = ListState::default();
        if !app.rows.is_empty() {
            state.select(Some(app.selected.min(app.rows.len() - 1)));
        }
        frame.render_stateful_widget(list, vertical[0], &mut state);

        let log_block = Block::default()
            .title(if app.follow { "Logs" } else { "Logs (paused)" })
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style);
        let log_area = log_block.inner(vertical[1]);
        app.set_log_view_height(log_area.height as usize);
        let width = log_area.width as usize;
        let range = app.visible_range();
        let lines: Vec<Line> = app
            .logs
            .iter()
            .skip(range.start)
            .take(range.len())
            .map(|entry| log_line(entry, width))
            .collect();
        let log_empty = lines.is_empty();
        frame.render_widget(Paragraph::new(Text::from(lines)).block(log_block), vertical[1]);
        if log_empty {
            let empty = Paragraph::new("No output yet").style(Style::default().fg(Color::DarkGray));
            frame.render_widget(empty, log_area);
        }

        let (help_line, help_style) = match app.status_message() {
            Some((text, StatusLevel::Warning)) => (text.to_string(), Style::default().fg(Color::Yellow)),
            Some((text, StatusLevel::Info)) => (text.to_string(), Style::default().fg(Color::Cyan)),
            None => (HELP_LINE.to_string(), Style::default().fg(Color::DarkGray)),
        };
        let status = Paragraph::new(Text::from(vec![
            Line::from(Span::raw(app.status_line())),
            Line::from(Span::styled(help_line, help_style)),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(status, vertical[2]);

        if app.show_help {
            let popup_area = centered_rect(50, 60, area);
            let help_text = [
                "Services:",
                "  Up/Down    Select service",
                "  s          Start selected",
                "  x          Stop selected",
                "  A          Start all",
                "  X          Stop all (unloads models once)",
                "  c c        Clear safelisted caches (press twice)",
                "",
                "Logs:",
                "  f          Toggle auto-follow",
                "  PageUp/Dn  Scroll",
                "  Home/End   Scroll to top/bottom",
                "",
                "  ?          Toggle this help",
                "  q          Quit",
            ]
            .join("\n");
            let help_block = Paragraph::new(help_text)
                .block(
                    Block::default()
                        .title("Help")
                        .borders(Borders::ALL)
                        .border_type(BorderType::Rounded),
                )
                .style(Style::default().bg(Color::DarkGray).fg(Color::White));
            frame.render_widget(Clear, popup_area);
            frame.render_widget(help_block, popup_area);
        }
    })?;
    Ok(())
}

fn service_line(row: &ServiceRow, selected: bool) -> Line<'static> {
    let marker = if selected { "▶ " } else { "  " };
    let name_style = if selected {
        Style::default().fg(Color::White).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Gray)
    };
    Line::from(vec![
        Span::styled(marker, Style::default().fg(Color::Cyan)),
        Span::styled(format!("{} ", status_char(row)), status_style(row)),
        Span::styled(format!("{:<12}", row.name), name_style),
        Span::styled(format!("{:<10}", row.display_state()), status_style(row)),
        Span::styled(
            format!("pid {:<8} up {}", row.pid_label(), row.uptime_label()),
            Style::default().fg(Color::DarkGray),
        ),
    ])
}

fn status_char(row: &ServiceRow) -> char {
    match (row.lifecycle, row.state) {
        (Lifecycle::Starting | Lifecycle::Stopping, _) => '↻',
        (_, ServiceState::Running) => '▲',
        (_, ServiceState::Stopped) => '■',
        (_, ServiceState::Unknown) => '?',
    }
}

fn status_style(row: &ServiceRow) -> Style {
    match (row.lifecycle, row.state) {
        (Lifecycle::Starting | Lifecycle::Stopping, _) => Style::default().fg(Color::Yellow),
        (_, ServiceState::Running) => Style::default().fg(Color::Green),
        (_, ServiceState::Stopped) => Style::default().fg(Color::DarkGray),
        (_, ServiceState::Unknown) => Style::default().fg(Color::Magenta),
    }
}

fn source_color(source: LogSource) -> Color {
    match source {
        LogSource::Service(ServiceKind::ImageGen) => Color::Magenta,
        LogSource::Service(ServiceKind::ChatUi) => Color::Blue,
        LogSource::Service(ServiceKind::InferenceDaemon) => Color::Green,
        LogSource::Supervisor => Color::Cyan,
    }
}

fn log_line(entry: &LogEntry, width: usize) -> Line<'static> {
    let prefix = format!("{:<9} ", source_label(entry.source));
    let text_style = match entry.kind {
        LogKind::Output => Style::default(),
        LogKind::Notice => Style::default().fg(Color::Cyan),
        LogKind::Warning => Style::default().fg(Color::Yellow),
    };
    let available = width.saturating_sub(prefix.chars().count());
    Line::from(vec![
        Span::styled(prefix, Style::default().fg(source_color(entry.source))),
        Span::styled(truncate(&entry.text, available), text_style),
    ])
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}
