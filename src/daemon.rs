//! Inference daemon management API.
//!
//! Loaded models are listed with `GET /api/ps` and unloaded one at a time by
//! asking the daemon to generate with `keep_alive: 0`. The API has no call
//! that unloads everything at once.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::error::CleanupError;
use crate::logs::{LogSink, LogSource};
use crate::proctable::{self, ProcessTable};
use crate::service::ServiceKind;

/// Daemon-wide cleanup settings attached to the inference daemon's spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Base URL of the management API, e.g. `http://127.0.0.1:11434`.
    pub api_url: String,
    /// Process-table keyword of worker subprocesses left behind after unload.
    pub runner_keyword: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<LoadedModel>,
}

#[derive(Debug, Deserialize)]
struct LoadedModel {
    #[serde(default)]
    name: String,
    #[serde(default)]
    model: String,
}

pub struct DaemonClient {
    http: reqwest::Client,
    base: String,
}

impl DaemonClient {
    pub fn new(config: &DaemonConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(format!("airack/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base: config.api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Names of the models the daemon currently holds in memory.
    pub async fn loaded_models(&self) -> Result<Vec<String>, CleanupError> {
        let url = format!("{}/api/ps", self.base);
        let api_error = |reason: String| CleanupError::DaemonApi {
            url: url.clone(),
            reason,
        };
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| api_error(err.to_string()))?;
        if !response.status().is_success() {
            return Err(api_error(format!("status {}", response.status())));
        }
        let payload: PsResponse = response
            .json()
            .await
            .map_err(|err| api_error(err.to_string()))?;
        Ok(payload
            .models
            .into_iter()
            .map(|m| if m.name.is_empty() { m.model } else { m.name })
            .filter(|name| !name.is_empty())
            .collect())
    }

    /// Asks the daemon to drop one model from memory.
    pub async fn unload(&self, model: &str) -> Result<(), CleanupError> {
        let url = format!("{}/api/generate", self.base);
        let unload_error = |reason: String| CleanupError::Unload {
            model: model.to_string(),
            reason,
        };
        let response = self
            .http
            .post(&url)
            .json(&json!({ "model": model, "keep_alive": 0 }))
            .send()
            .await
            .map_err(|err| unload_error(err.to_string()))?;
        if !response.status().is_success() {
            return Err(unload_error(format!("status {}", response.status())));
        }
        Ok(())
    }
}

/// Unloads every loaded model individually. Returns how many succeeded.
///
/// Failures are logged; an unreachable daemon simply has nothing to unload.
pub async fn unload_models(config: &DaemonConfig, sink: &LogSink) -> usize {
    let source = LogSource::Service(ServiceKind::InferenceDaemon);
    let client = DaemonClient::new(config);
    sink.notice(source, "unloading models");
    let models = match client.loaded_models().await {
        Ok(models) => models,
        Err(err) => {
            sink.warning(source, format!("could not list loaded models: {}", err));
            return 0;
        }
    };
    if models.is_empty() {
        sink.notice(source, "no models loaded");
        return 0;
    }
    let mut unloaded = 0;
    for model in models {
        match client.unload(&model).await {
            Ok(()) => {
                unloaded += 1;
                sink.notice(source, format!("unloaded {}", model));
            }
            Err(err) => sink.warning(source, err.to_string()),
        }
    }
    unloaded
}

/// Force-kills worker subprocesses that outlive an unload.
pub async fn sweep_runners(config: &DaemonConfig, table: Arc<dyn ProcessTable>, sink: &LogSink) {
    let source = LogSource::Service(ServiceKind::InferenceDaemon);
    sink.notice(source, "removing lingering runners");
    match proctable::sweep(table, &config.runner_keyword).await {
        Ok(0) => {}
        Ok(killed) => sink.notice(source, format!("killed {} runner process(es)", killed)),
        Err(err) => sink.warning(source, err.to_string()),
    }
}
