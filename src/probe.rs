//! Liveness probing.
//!
//! A service counts as running when any independent signal says so: a TCP
//! port accepting connections, the health endpoint answering 200, or a
//! process-table entry matching one of its keywords. Every check is bounded by
//! the same short timeout and failures only ever count as a negative signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ProbeError;
use crate::proctable::{ProcessEntry, ProcessTable};
use crate::service::{ServiceSpec, ServiceState};

/// Default bound for a single signal.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Reading every command line from the OS can take longer than a TCP connect.
const SCAN_TIMEOUT_FLOOR: Duration = Duration::from_millis(300);

/// A process-table read shared by several service checks in one refresh.
pub type ProcessSnapshot = Result<Vec<ProcessEntry>, ProbeError>;

pub struct LivenessProbe {
    http: reqwest::Client,
    table: Arc<dyn ProcessTable>,
    timeout: Duration,
}

impl LivenessProbe {
    pub fn new(table: Arc<dyn ProcessTable>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(format!("airack/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            table,
            timeout,
        }
    }

    pub fn table(&self) -> Arc<dyn ProcessTable> {
        Arc::clone(&self.table)
    }

    /// Checks one service, reading the process table for it alone.
    pub async fn check_service(&self, spec: &ServiceSpec) -> ServiceState {
        let snapshot = self.snapshot().await;
        self.check_with(spec, &snapshot).await
    }

    /// Reads the process table once, bounded by the probe timeout.
    pub async fn snapshot(&self) -> ProcessSnapshot {
        let table = Arc::clone(&self.table);
        let scan = tokio::task::spawn_blocking(move || table.list_processes());
        let limit = self.timeout.max(SCAN_TIMEOUT_FLOOR);
        match tokio::time::timeout(limit, scan).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(ProbeError::ProcessTable(err.to_string())),
            Err(_) => Err(ProbeError::ProcessTable(format!(
                "scan exceeded {}ms",
                limit.as_millis()
            ))),
        }
    }

    /// Combines the signals for `spec` with a logical OR.
    ///
    /// `Unknown` is only reported when nothing was positive and the process
    /// table itself could not be read, since that scan is what confirms absence.
    pub async fn check_with(&self, spec: &ServiceSpec, snapshot: &ProcessSnapshot) -> ServiceState {
        let table_failed = match snapshot {
            Ok(entries) => {
                if let Some(entry) = entries.iter().find(|entry| spec.matches(&entry.command)) {
                    debug!(service = %spec.kind, pid = entry.pid, "process table match");
                    return ServiceState::Running;
                }
                false
            }
            Err(err) => {
                debug!(service = %spec.kind, error = %err, "process table signal unavailable");
                true
            }
        };

        for &port in &spec.ports {
            match self.tcp_open(port).await {
                Ok(()) => {
                    debug!(service = %spec.kind, port, "port accepting connections");
                    return ServiceState::Running;
                }
                Err(err) => debug!(service = %spec.kind, error = %err, "tcp signal negative"),
            }
        }

        if let Some(url) = &spec.health_url {
            match self.http_healthy(url).await {
                Ok(()) => {
                    debug!(service = %spec.kind, %url, "health endpoint ok");
                    return ServiceState::Running;
                }
                Err(err) => debug!(service = %spec.kind, error = %err, "http signal negative"),
            }
        }

        if table_failed {
            ServiceState::Unknown
        } else {
            ServiceState::Stopped
        }
    }

    /// Connect-and-close against `127.0.0.1:<port>`.
    pub async fn tcp_open(&self, port: u16) -> Result<(), ProbeError> {
        let addr = format!("127.0.0.1:{}", port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(source)) => Err(ProbeError::Tcp { port, source }),
            Err(_) => Err(ProbeError::TcpTimeout { port }),
        }
    }

    /// GET `url`; only a 200 counts as healthy.
    pub async fn http_healthy(&self, url: &str) -> Result<(), ProbeError> {
        let http_error = |reason: String| ProbeError::Http {
            url: url.to_string(),
            reason,
        };
        let request = self.http.get(url).send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| http_error("timed out".into()))?
            .map_err(|err| http_error(err.to_string()))?;
        if response.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(http_error(format!("status {}", response.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::net::TcpListener;

    use super::*;
    use crate::proctable::fake::FakeProcessTable;
    use crate::service::{LaunchCommand, ServiceKind};
    use crate::testing::{spawn_http_stub, spawn_silent_listener};

    fn spec(keywords: &[&str], ports: Vec<u16>, health_url: Option<String>) -> ServiceSpec {
        ServiceSpec {
            kind: ServiceKind::ImageGen,
            name: "ComfyUI".into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            ports,
            health_url,
            command: LaunchCommand::parse("true").unwrap(),
            post_stop: None,
        }
    }

    fn probe(table: FakeProcessTable) -> LivenessProbe {
        LivenessProbe::new(Arc::new(table), DEFAULT_PROBE_TIMEOUT)
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn keyword_match_reports_running() {
        let probe = probe(FakeProcessTable::new(&["python3 -u /opt/ComfyUI/main.py --listen"]));
        let state = probe.check_service(&spec(&["ComfyUI/main.py"], vec![], None)).await;
        assert_eq!(state, ServiceState::Running);
    }

    #[tokio::test]
    async fn nothing_positive_reports_stopped() {
        let port = closed_port().await;
        let probe = probe(FakeProcessTable::new(&["/usr/bin/ollama serve"]));
        let state = probe
            .check_service(&spec(&["ComfyUI/main.py"], vec![port], None))
            .await;
        assert_eq!(state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn open_ports_win_over_failing_health_check() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ports = vec![
            first.local_addr().unwrap().port(),
            second.local_addr().unwrap().port(),
        ];
        let stub = spawn_http_stub(|_, _| (500, String::new())).await;
        let probe = probe(FakeProcessTable::new(&[]));
        let state = probe
            .check_service(&spec(&["ComfyUI/main.py"], ports, Some(stub.url("/object_info"))))
            .await;
        assert_eq!(state, ServiceState::Running);
    }

    #[tokio::test]
    async fn health_endpoint_200_reports_running() {
        let stub = spawn_http_stub(|_, path| {
            if path == "/object_info" {
                (200, "{}".into())
            } else {
                (404, String::new())
            }
        })
        .await;
        let probe = probe(FakeProcessTable::new(&[]));
        let state = probe
            .check_service(&spec(&["ComfyUI/main.py"], vec![], Some(stub.url("/object_info"))))
            .await;
        assert_eq!(state, ServiceState::Running);
        assert_eq!(stub.requests(), vec!["GET /object_info"]);
    }

    #[tokio::test]
    async fn non_200_health_alone_reports_stopped() {
        let stub = spawn_http_stub(|_, _| (503, String::new())).await;
        let probe = probe(FakeProcessTable::new(&[]));
        let state = probe
            .check_service(&spec(&["ComfyUI/main.py"], vec![], Some(stub.url("/object_info"))))
            .await;
        assert_eq!(state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn unreadable_process_table_reports_unknown() {
        let probe = probe(FakeProcessTable::failing());
        let state = probe.check_service(&spec(&["ComfyUI/main.py"], vec![], None)).await;
        assert_eq!(state, ServiceState::Unknown);
    }

    #[tokio::test]
    async fn unreadable_table_still_running_on_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = probe(FakeProcessTable::failing());
        let state = probe.check_service(&spec(&["x"], vec![port], None)).await;
        assert_eq!(state, ServiceState::Running);
    }

    #[tokio::test]
    async fn stalled_health_endpoint_is_bounded_by_timeout() {
        let silent = spawn_silent_listener().await;
        let probe = probe(FakeProcessTable::new(&[]));
        let started = Instant::now();
        let state = probe
            .check_service(&spec(
                &["ComfyUI/main.py"],
                vec![],
                Some(format!("http://127.0.0.1:{}/object_info", silent)),
            ))
            .await;
        assert_eq!(state, ServiceState::Stopped);
        assert!(started.elapsed() < Duration::from_millis(1500));
    }
}
