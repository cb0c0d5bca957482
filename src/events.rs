//! Event definitions for the front-end event loop.

use crossterm::event::KeyEvent;

use crate::logs::LogEntry;

/// Signal that asked the program to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn label(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

/// Represents an event in the main loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized; the next draw picks up the new size.
    Resize,
    /// A line from a service or the supervisor.
    Log(LogEntry),
    /// Ctrl-C or SIGTERM was received.
    Shutdown(ShutdownSignal),
}
