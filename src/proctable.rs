//! Access to the operating system's process table.
//!
//! Both the liveness probe (keyword scan) and the stop path (kill-by-keyword
//! sweep) go through the `ProcessTable` trait, so policy code can run against
//! an in-memory table in tests.

use std::sync::{Arc, Mutex};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};
use tracing::debug;

use crate::error::{CleanupError, ProbeError};

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Full invocation string (arguments joined with spaces).
    pub command: String,
}

/// Process enumeration plus signal-by-match.
pub trait ProcessTable: Send + Sync {
    /// Lists every current process with its invocation string.
    fn list_processes(&self) -> Result<Vec<ProcessEntry>, ProbeError>;

    /// Force-kills every process whose invocation contains `pattern`.
    ///
    /// Returns how many processes were signalled. Finding nothing is not an error.
    fn kill_matching(&self, pattern: &str) -> Result<usize, CleanupError>;
}

/// `ProcessTable` backed by sysinfo.
pub struct SystemProcessTable {
    system: Mutex<System>,
    own_pid: u32,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            own_pid: std::process::id(),
        }
    }

    fn refresh(system: &mut System) {
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn list_processes(&self) -> Result<Vec<ProcessEntry>, ProbeError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ProbeError::ProcessTable(
                "process listing is not supported on this platform".into(),
            ));
        }
        let mut system = self
            .system
            .lock()
            .map_err(|_| ProbeError::ProcessTable("process table lock poisoned".into()))?;
        Self::refresh(&mut system);
        let entries = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                command: command_line(process),
            })
            .collect();
        Ok(entries)
    }

    fn kill_matching(&self, pattern: &str) -> Result<usize, CleanupError> {
        let sweep_error = |reason: &str| CleanupError::Sweep {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        if pattern.is_empty() {
            return Err(sweep_error("empty pattern"));
        }
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(sweep_error("process listing is not supported on this platform"));
        }
        let mut system = self
            .system
            .lock()
            .map_err(|_| sweep_error("process table lock poisoned"))?;
        Self::refresh(&mut system);

        let mut killed = 0;
        for (pid, process) in system.processes() {
            if pid.as_u32() == self.own_pid {
                continue;
            }
            let command = command_line(process);
            if !command.contains(pattern) {
                continue;
            }
            let delivered = process
                .kill_with(Signal::Kill)
                .unwrap_or_else(|| process.kill());
            debug!(pid = pid.as_u32(), %command, delivered, "kill sweep match");
            if delivered {
                killed += 1;
            }
        }
        Ok(killed)
    }
}

/// Runs `kill_matching` off the async runtime's worker threads.
pub async fn sweep(table: Arc<dyn ProcessTable>, pattern: &str) -> Result<usize, CleanupError> {
    let owned = pattern.to_string();
    tokio::task::spawn_blocking(move || table.kill_matching(&owned))
        .await
        .map_err(|err| CleanupError::Sweep {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?
}

fn command_line(process: &sysinfo::Process) -> String {
    let cmd = process.cmd();
    if cmd.is_empty() {
        return process.name().to_string_lossy().into_owned();
    }
    cmd.iter()
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
