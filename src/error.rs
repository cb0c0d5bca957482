//! Error taxonomy of the supervision core.
//!
//! Only `LaunchError` is ever returned to a caller as an actionable failure.
//! The other variants are recovered where they occur and end up as log lines.

use std::io;
use std::path::PathBuf;

use crate::service::ServiceKind;

/// A single liveness signal could not be evaluated.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("tcp probe of port {port} timed out")]
    TcpTimeout { port: u16 },
    #[error("tcp probe of port {port} failed: {source}")]
    Tcp { port: u16, source: io::Error },
    #[error("health check {url} failed: {reason}")]
    Http { url: String, reason: String },
    #[error("failed to read process table: {0}")]
    ProcessTable(String),
}

/// Starting a managed process failed; no process is recorded afterwards.
#[derive(Debug, thiserror::Error)]
#[error("failed to launch {service} ({command}): {source}")]
pub struct LaunchError {
    pub service: ServiceKind,
    pub command: String,
    #[source]
    pub source: io::Error,
}

/// A best-effort stop-time action failed.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("kill sweep for {pattern:?} failed: {reason}")]
    Sweep { pattern: String, reason: String },
    #[error("daemon request {url} failed: {reason}")]
    DaemonApi { url: String, reason: String },
    #[error("failed to unload model {model}: {reason}")]
    Unload { model: String, reason: String },
}

/// Clearing one safelisted cache directory failed.
#[derive(Debug, thiserror::Error)]
#[error("failed to clear {}: {source}", path.display())]
pub struct CacheClearError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}
