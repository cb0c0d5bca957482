//! Configuration management for airack.
//!
//! This module defines the structure of the `airack.toml` configuration file,
//! locates it, and resolves it against the built-in per-service defaults into
//! the `Settings` the rest of the program runs on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::daemon::DaemonConfig;
use crate::service::{LaunchCommand, ServiceKind, ServiceSpec};

pub const CONFIG_FILE_NAME: &str = "airack.toml";

/// Top-level configuration structure corresponding to `airack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Status poll period in milliseconds.
    pub refresh_interval_ms: Option<u64>,
    /// Per-signal liveness timeout in milliseconds, capped at 300.
    pub probe_timeout_ms: Option<u64>,
    /// Wait after the polite terminate before force-killing (ms).
    pub grace_period_ms: Option<u64>,
    /// Maximum number of log lines the front end keeps.
    pub max_lines: Option<usize>,
    /// Where tracing output goes while the terminal UI is active.
    pub log_file: Option<String>,
    /// Whether quitting the UI stops every service.
    pub stop_on_exit: Option<bool>,
    /// Whether to clear the image-gen cache once at startup.
    pub clean_cache_on_start: Option<bool>,
    #[serde(default)]
    pub image_gen: ServiceConfig,
    #[serde(default)]
    pub chat_ui: ServiceConfig,
    #[serde(default)]
    pub inference: ServiceConfig,
}

/// Overrides for a single service. Unset fields keep the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    /// Display name.
    pub name: Option<String>,
    /// Launch command, split with shell-words.
    pub cmd: Option<String>,
    /// Substrings identifying the service in the process table.
    pub keywords: Option<Vec<String>>,
    pub ports: Option<Vec<u16>>,
    /// Health endpoint; an empty string disables the HTTP signal.
    pub health_url: Option<String>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    /// Image-gen cache root.
    pub cache_dir: Option<String>,
    /// Chat UI data directory; only its `cache` and `uploads` children are cleared.
    pub data_dir: Option<String>,
    /// Inference daemon management API base URL.
    pub api_url: Option<String>,
    pub runner_keyword: Option<String>,
    pub api_timeout_ms: Option<u64>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub refresh_interval: Duration,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
    pub max_lines: usize,
    pub log_file: Option<PathBuf>,
    pub stop_on_exit: bool,
    pub clean_cache_on_start: bool,
    /// One spec per service, in `ServiceKind::ALL` order.
    pub services: Vec<ServiceSpec>,
    pub image_cache_root: Option<PathBuf>,
    pub chat_data_dir: Option<PathBuf>,
}

struct Defaults {
    name: &'static str,
    cmd: &'static str,
    keywords: &'static [&'static str],
    ports: &'static [u16],
    health_url: Option<&'static str>,
}

fn defaults(kind: ServiceKind) -> Defaults {
    match kind {
        ServiceKind::ImageGen => Defaults {
            name: "ComfyUI",
            cmd: "bash -c \"source ~/aitools/venvs/comfyui/bin/activate && python3 -u ~/aitools/ComfyUI/main.py --listen --enable-cors-header --verbose DEBUG --log-stdout\"",
            keywords: &["ComfyUI/main.py"],
            ports: &[],
            health_url: Some("http://127.0.0.1:8188/object_info"),
        },
        ServiceKind::ChatUi => Defaults {
            name: "OpenWebUI",
            cmd: "bash -c \"~/aitools/venvs/openwebui/bin/open-webui serve\"",
            keywords: &["open-webui", "open_webui"],
            ports: &[8080],
            health_url: None,
        },
        ServiceKind::InferenceDaemon => Defaults {
            name: "Ollama",
            cmd: "ollama serve",
            keywords: &["ollama serve"],
            ports: &[11434],
            health_url: None,
        },
    }
}

const DEFAULT_REFRESH_INTERVAL_MS: u64 = 2000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 200;
const MAX_PROBE_TIMEOUT_MS: u64 = 300;
const DEFAULT_GRACE_PERIOD_MS: u64 = 3000;
const DEFAULT_MAX_LINES: usize = 5000;
const DEFAULT_API_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_RUNNER_KEYWORD: &str = "ollama runner";
const DEFAULT_API_TIMEOUT_MS: u64 = 1000;
const DEFAULT_IMAGE_CACHE_DIR: &str = "~/.cache/comfyui";
const DEFAULT_CHAT_DATA_DIR: &str = "~/aitools/openwebui-data";

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Loads the explicit path if given, else the first existing default
/// location, else the built-in defaults.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    match default_config_paths().into_iter().find(|path| path.exists()) {
        Some(path) => load_config(&path),
        None => Ok(Config::default()),
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|dir| dir.is_absolute())
        .or_else(|| home_dir().map(|home| home.join(".config")));
    if let Some(dir) = config_home {
        paths.push(dir.join("airack").join(CONFIG_FILE_NAME));
    }
    paths
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

/// Expands a leading `~` against `home`. Other paths pass through.
pub fn expand_tilde(raw: &str, home: Option<&Path>) -> PathBuf {
    match (raw, home) {
        ("~", Some(home)) => home.to_path_buf(),
        (_, Some(home)) if raw.starts_with("~/") => home.join(&raw[2..]),
        _ => PathBuf::from(raw),
    }
}

impl Config {
    /// Resolves every field against the defaults, with `~` expanded against `home`.
    pub fn resolve(self, home: Option<&Path>) -> Result<Settings> {
        let probe_timeout = Duration::from_millis(
            self.probe_timeout_ms
                .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS)
                .min(MAX_PROBE_TIMEOUT_MS),
        );
        let daemon = DaemonConfig {
            api_url: self
                .inference
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            runner_keyword: self
                .inference
                .runner_keyword
                .clone()
                .unwrap_or_else(|| DEFAULT_RUNNER_KEYWORD.to_string()),
            timeout: Duration::from_millis(
                self.inference.api_timeout_ms.unwrap_or(DEFAULT_API_TIMEOUT_MS),
            ),
        };

        let image_cache_root = expand_tilde(
            self.image_gen
                .cache_dir
                .as_deref()
                .unwrap_or(DEFAULT_IMAGE_CACHE_DIR),
            home,
        );
        let chat_data_dir = expand_tilde(
            self.chat_ui.data_dir.as_deref().unwrap_or(DEFAULT_CHAT_DATA_DIR),
            home,
        );

        let services = vec![
            service_spec(ServiceKind::ImageGen, &self.image_gen, None, home)?,
            service_spec(ServiceKind::ChatUi, &self.chat_ui, None, home)?,
            service_spec(ServiceKind::InferenceDaemon, &self.inference, Some(daemon), home)?,
        ];

        Ok(Settings {
            refresh_interval: Duration::from_millis(
                self.refresh_interval_ms
                    .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS)
                    .max(100),
            ),
            probe_timeout,
            grace_period: Duration::from_millis(
                self.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS),
            ),
            max_lines: self.max_lines.unwrap_or(DEFAULT_MAX_LINES).max(1),
            log_file: self.log_file.as_deref().map(|raw| expand_tilde(raw, home)),
            stop_on_exit: self.stop_on_exit.unwrap_or(false),
            clean_cache_on_start: self.clean_cache_on_start.unwrap_or(false),
            services,
            image_cache_root: Some(image_cache_root),
            chat_data_dir: Some(chat_data_dir),
        })
    }
}

fn service_spec(
    kind: ServiceKind,
    config: &ServiceConfig,
    post_stop: Option<DaemonConfig>,
    home: Option<&Path>,
) -> Result<ServiceSpec> {
    let base = defaults(kind);
    let raw_cmd = config.cmd.as_deref().unwrap_or(base.cmd);
    let mut command = LaunchCommand::parse(raw_cmd)
        .with_context(|| format!("failed to parse cmd for {}", kind))?;
    if command.program.starts_with('~') {
        command.program = expand_tilde(&command.program, home)
            .to_string_lossy()
            .into_owned();
    }
    command.cwd = config.cwd.as_deref().map(|cwd| expand_tilde(cwd, home));
    command.env = config.env.clone().unwrap_or_default();

    let keywords = config
        .keywords
        .clone()
        .unwrap_or_else(|| base.keywords.iter().map(|k| k.to_string()).collect())
        .into_iter()
        .filter(|k| !k.is_empty())
        .collect();
    let health_url = match &config.health_url {
        Some(url) if url.is_empty() => None,
        Some(url) => Some(url.clone()),
        None => base.health_url.map(str::to_string),
    };

    Ok(ServiceSpec {
        kind,
        name: config.name.clone().unwrap_or_else(|| base.name.to_string()),
        keywords,
        ports: config.ports.clone().unwrap_or_else(|| base.ports.to_vec()),
        health_url,
        command,
        post_stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
refresh_interval_ms = 500
probe_timeout_ms = 150
grace_period_ms = 1000
max_lines = 200
log_file = "~/airack.log"
stop_on_exit = true
clean_cache_on_start = true

[image_gen]
cmd = "python3 main.py --listen"
cwd = "~/ComfyUI"
health_url = ""
cache_dir = "/var/cache/comfy"

[chat_ui]
name = "WebUI"
ports = [3000]
env = { DATA_DIR = "/srv/webui" }

[inference]
api_url = "http://10.0.0.2:11434"
api_timeout_ms = 400
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.refresh_interval_ms, Some(500));
        assert_eq!(config.max_lines, Some(200));
        assert_eq!(config.stop_on_exit, Some(true));
        assert_eq!(config.chat_ui.ports, Some(vec![3000]));
        assert!(config.inference.cmd.is_none());

        let home = Path::new("/home/op");
        let settings = config.resolve(Some(home)).unwrap();
        assert_eq!(settings.refresh_interval, Duration::from_millis(500));
        assert_eq!(settings.probe_timeout, Duration::from_millis(150));
        assert_eq!(settings.grace_period, Duration::from_millis(1000));
        assert_eq!(settings.log_file, Some(PathBuf::from("/home/op/airack.log")));
        assert!(settings.stop_on_exit);
        assert!(settings.clean_cache_on_start);
        assert_eq!(settings.image_cache_root, Some(PathBuf::from("/var/cache/comfy")));

        let image = &settings.services[0];
        assert_eq!(image.command.program, "python3");
        assert_eq!(image.command.args, vec!["main.py", "--listen"]);
        assert_eq!(image.command.cwd, Some(PathBuf::from("/home/op/ComfyUI")));
        assert_eq!(image.health_url, None);
        assert_eq!(image.keywords, vec!["ComfyUI/main.py"]);

        let chat = &settings.services[1];
        assert_eq!(chat.name, "WebUI");
        assert_eq!(chat.ports, vec![3000]);
        assert_eq!(chat.command.env.get("DATA_DIR").map(String::as_str), Some("/srv/webui"));

        let daemon = settings.services[2].post_stop.as_ref().unwrap();
        assert_eq!(daemon.api_url, "http://10.0.0.2:11434");
        assert_eq!(daemon.runner_keyword, "ollama runner");
        assert_eq!(daemon.timeout, Duration::from_millis(400));
    }

    #[test]
    fn empty_config_resolves_to_builtin_defaults() {
        let settings = Config::default().resolve(Some(Path::new("/home/op"))).unwrap();
        assert_eq!(settings.refresh_interval, Duration::from_millis(2000));
        assert_eq!(settings.probe_timeout, Duration::from_millis(200));
        assert_eq!(settings.max_lines, 5000);
        assert!(!settings.stop_on_exit);
        assert_eq!(settings.log_file, None);

        let kinds: Vec<_> = settings.services.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, ServiceKind::ALL.to_vec());

        let image = &settings.services[0];
        assert_eq!(image.name, "ComfyUI");
        assert!(image.ports.is_empty());
        assert_eq!(
            image.health_url.as_deref(),
            Some("http://127.0.0.1:8188/object_info")
        );
        assert_eq!(image.command.program, "bash");
        assert_eq!(image.command.args[0], "-c");
        assert!(image.post_stop.is_none());

        let chat = &settings.services[1];
        assert_eq!(chat.keywords, vec!["open-webui", "open_webui"]);
        assert_eq!(chat.ports, vec![8080]);

        let daemon = &settings.services[2];
        assert_eq!(daemon.name, "Ollama");
        assert_eq!(daemon.ports, vec![11434]);
        assert_eq!(daemon.command.program, "ollama");
        assert_eq!(daemon.post_stop.as_ref().unwrap().api_url, "http://127.0.0.1:11434");

        assert_eq!(
            settings.chat_data_dir,
            Some(PathBuf::from("/home/op/aitools/openwebui-data"))
        );
    }

    #[test]
    fn probe_timeout_is_capped() {
        let config: Config = toml::from_str("probe_timeout_ms = 5000\n").unwrap();
        let settings = config.resolve(None).unwrap();
        assert_eq!(settings.probe_timeout, Duration::from_millis(300));
    }

    #[test]
    fn unbalanced_quotes_in_cmd_are_rejected() {
        let config: Config = toml::from_str("[chat_ui]\ncmd = \"bash -c 'oops\"\n").unwrap();
        let err = config.resolve(None).unwrap_err();
        assert!(err.to_string().contains("chat-ui"));
    }

    #[test]
    fn tilde_expansion_only_touches_leading_tilde() {
        let home = Path::new("/home/op");
        assert_eq!(expand_tilde("~", Some(home)), PathBuf::from("/home/op"));
        assert_eq!(expand_tilde("~/x/y", Some(home)), PathBuf::from("/home/op/x/y"));
        assert_eq!(expand_tilde("/abs/~/x", Some(home)), PathBuf::from("/abs/~/x"));
        assert_eq!(expand_tilde("~/x", None), PathBuf::from("~/x"));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "max_lines = 42\n").unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.max_lines, Some(42));
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
