//! Output handling and buffering for the front ends.
//!
//! `LogBuffer` is the bounded history the terminal UI scrolls through. The
//! plain-line formatting here is shared by the headless `run` mode.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

use crate::logs::{LogEntry, LogKind, LogSource};

/// A fixed-capacity ring buffer of log entries.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogEntry>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds an entry, sanitizing its text for display.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, mut entry: LogEntry) -> bool {
        entry.text = sanitize_text(&entry.text);
        let mut dropped = false;
        self.lines.push_back(entry);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogEntry> + ExactSizeIterator {
        self.lines.iter()
    }
}

/// Removes ANSI escape codes and stray control characters.
/// Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped)
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}

/// Short label naming where an entry came from.
pub fn source_label(source: LogSource) -> &'static str {
    match source {
        LogSource::Service(kind) => kind.slug(),
        LogSource::Supervisor => "airack",
    }
}

/// `[image-gen] line` style rendering for plain-text output.
pub fn format_plain(entry: &LogEntry) -> String {
    let marker = match entry.kind {
        LogKind::Output | LogKind::Notice => "",
        LogKind::Warning => "warning: ",
    };
    format!(
        "[{:<9}] {}{}",
        source_label(entry.source),
        marker,
        sanitize_text(&entry.text)
    )
}
