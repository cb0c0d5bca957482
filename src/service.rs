//! Identity and observed state of the managed services.
//!
//! Every per-kind difference (name, match keywords, ports, health endpoint,
//! launch command, post-stop hook) lives in a `ServiceSpec` record so a single
//! controller type can drive all three services.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::daemon::DaemonConfig;

/// The fixed set of services this tool supervises.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Image-generation server (ComfyUI).
    ImageGen,
    /// Web chat front end (Open WebUI).
    ChatUi,
    /// Model-inference daemon (Ollama).
    #[value(name = "inference")]
    #[serde(rename = "inference")]
    InferenceDaemon,
}

impl ServiceKind {
    /// Start order used by `start_all` and `stop_all`.
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::ImageGen,
        ServiceKind::ChatUi,
        ServiceKind::InferenceDaemon,
    ];

    /// Command-line / config-file identifier.
    pub fn slug(self) -> &'static str {
        match self {
            ServiceKind::ImageGen => "image-gen",
            ServiceKind::ChatUi => "chat-ui",
            ServiceKind::InferenceDaemon => "inference",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Liveness as observed by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Every signal came back negative.
    Stopped,
    /// At least one signal was positive.
    Running,
    /// No positive signal, and the process table could not be read to confirm absence.
    Unknown,
}

impl ServiceState {
    pub fn label(self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Running => "running",
            ServiceState::Unknown => "unknown",
        }
    }
}

/// Controller-side lifecycle. `ServiceState` is overlaid on top of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// An already-tokenized launch command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl LaunchCommand {
    /// Splits a shell-words command line into program and arguments.
    pub fn parse(raw: &str) -> Result<Self, shell_words::ParseError> {
        let mut parts = shell_words::split(raw)?;
        let program = if parts.is_empty() {
            String::new()
        } else {
            parts.remove(0)
        };
        Ok(Self {
            program,
            args: parts,
            cwd: None,
            env: HashMap::new(),
        })
    }

    /// Quoted form, used in log lines and errors.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Everything the supervision core needs to know about one service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub kind: ServiceKind,
    /// Human-readable name shown in logs and the front end.
    pub name: String,
    /// Substrings that identify the service in the process table.
    pub keywords: Vec<String>,
    /// TCP ports the service is expected to listen on.
    pub ports: Vec<u16>,
    /// Optional HTTP endpoint that answers 200 when the service is healthy.
    pub health_url: Option<String>,
    pub command: LaunchCommand,
    /// Daemon-wide cleanup run on stop (model unload and runner sweep).
    pub post_stop: Option<DaemonConfig>,
}

impl ServiceSpec {
    /// Whether a process command line belongs to this service.
    pub fn matches(&self, command_line: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && command_line.contains(keyword.as_str()))
    }
}
