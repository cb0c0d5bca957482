//! The three service controllers behind one control surface.

use std::collections::BTreeMap;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{self, CacheTarget, ClearOutcome};
use crate::controller::{ServiceController, StartOutcome};
use crate::daemon;
use crate::error::{CacheClearError, LaunchError};
use crate::logs::{LogSink, LogSource};
use crate::probe::LivenessProbe;
use crate::service::{ServiceKind, ServiceSpec, ServiceState};

/// Observed state per service from one refresh.
pub type StatusSnapshot = BTreeMap<ServiceKind, ServiceState>;

pub struct Supervisor {
    controllers: Vec<ServiceController>,
    probe: Arc<LivenessProbe>,
    sink: LogSink,
    cache_targets: Vec<CacheTarget>,
}

impl Supervisor {
    /// Controllers are kept in `ServiceKind::ALL` order regardless of input order.
    pub fn new(
        mut specs: Vec<ServiceSpec>,
        probe: Arc<LivenessProbe>,
        sink: LogSink,
        grace: Duration,
        cache_targets: Vec<CacheTarget>,
    ) -> Self {
        specs.sort_by_key(|spec| spec.kind);
        specs.dedup_by_key(|spec| spec.kind);
        let controllers = specs
            .into_iter()
            .map(|spec| ServiceController::new(spec, Arc::clone(&probe), sink.clone(), grace))
            .collect();
        Self {
            controllers,
            probe,
            sink,
            cache_targets,
        }
    }

    pub fn controllers(&self) -> &[ServiceController] {
        &self.controllers
    }

    pub fn controller(&self, kind: ServiceKind) -> Option<&ServiceController> {
        self.controllers.iter().find(|c| c.kind() == kind)
    }

    fn controller_mut(&mut self, kind: ServiceKind) -> Option<&mut ServiceController> {
        self.controllers.iter_mut().find(|c| c.kind() == kind)
    }

    /// Probes every service. Read-only; one process-table scan is shared by
    /// all services and every signal is individually time-bounded.
    pub async fn refresh_status(&self) -> StatusSnapshot {
        let snapshot = self.probe.snapshot().await;
        let mut status = StatusSnapshot::new();
        for controller in &self.controllers {
            let state = self.probe.check_with(controller.spec(), &snapshot).await;
            status.insert(controller.kind(), state);
        }
        status
    }

    pub async fn start_service(&mut self, kind: ServiceKind) -> Result<StartOutcome, LaunchError> {
        match self.controller_mut(kind) {
            Some(controller) => controller.start().await,
            None => Err(LaunchError {
                service: kind,
                command: String::new(),
                source: io::Error::new(io::ErrorKind::NotFound, "service is not configured"),
            }),
        }
    }

    /// Starts every service in fixed order; one failure does not stop the rest.
    pub async fn start_all(&mut self) -> Vec<(ServiceKind, Result<StartOutcome, LaunchError>)> {
        self.sink.notice(LogSource::Supervisor, "starting all services");
        let mut results = Vec::with_capacity(self.controllers.len());
        for controller in &mut self.controllers {
            let result = controller.start().await;
            results.push((controller.kind(), result));
        }
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            self.sink.warning(
                LogSource::Supervisor,
                format!("{} of {} services failed to start", failed, results.len()),
            );
        }
        results
    }

    /// Stops one service, including its own post-stop cleanup.
    pub async fn stop_service(&mut self, kind: ServiceKind) {
        match self.controller_mut(kind) {
            Some(controller) => controller.stop().await,
            None => self.sink.warning(
                LogSource::Supervisor,
                format!("{} is not configured, nothing to stop", kind),
            ),
        }
    }

    /// Stops every service with the daemon-wide cleanup run exactly once.
    ///
    /// Models are unloaded after the other services are down but before the
    /// daemon itself is stopped, while its API can still answer. Runners are
    /// swept last.
    pub async fn stop_all(&mut self) {
        self.sink.notice(LogSource::Supervisor, "stopping all services");
        let cleanup = self
            .controllers
            .iter()
            .find_map(|c| c.spec().post_stop.clone());
        for controller in self
            .controllers
            .iter_mut()
            .filter(|c| c.spec().post_stop.is_none())
        {
            controller.stop_inner(false).await;
        }
        if let Some(config) = &cleanup {
            daemon::unload_models(config, &self.sink).await;
        }
        for controller in self
            .controllers
            .iter_mut()
            .filter(|c| c.spec().post_stop.is_some())
        {
            controller.stop_inner(false).await;
        }
        if let Some(config) = &cleanup {
            daemon::sweep_runners(config, self.probe.table(), &self.sink).await;
        }
        self.sink.notice(LogSource::Supervisor, "all services stopped");
    }

    /// Clears the safelisted cache directories.
    pub fn clean_cache(&self) -> Vec<Result<ClearOutcome, CacheClearError>> {
        if self.cache_targets.is_empty() {
            self.sink
                .notice(LogSource::Supervisor, "no cache directories configured");
            return Vec::new();
        }
        self.sink.notice(LogSource::Supervisor, "clearing caches");
        cache::clean(&self.cache_targets, &self.sink)
    }

    /// Forgets owned processes that exited on their own.
    pub fn reap_exited(&mut self) -> Vec<(ServiceKind, ExitStatus)> {
        self.controllers
            .iter_mut()
            .filter_map(|c| c.reap().map(|status| (c.kind(), status)))
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::daemon::DaemonConfig;
    use crate::logs::{self, LogKind, LogStream};
    use crate::probe::DEFAULT_PROBE_TIMEOUT;
    use crate::proctable::fake::FakeProcessTable;
    use crate::proctable::{ProcessTable, SystemProcessTable};
    use crate::service::LaunchCommand;
    use crate::testing::{spawn_http_stub, spawn_silent_listener};

    fn unique(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "airack-test-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        )
    }

    // The keyword rides along as $0 so it shows up in the shell's command line.
    fn stub_command(keyword: &str) -> LaunchCommand {
        LaunchCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30; echo done".into(), keyword.into()],
            cwd: None,
            env: Default::default(),
        }
    }

    fn spec(kind: ServiceKind, keyword: &str, command: LaunchCommand) -> ServiceSpec {
        ServiceSpec {
            kind,
            name: format!("{}-stub", kind),
            keywords: vec![keyword.to_string()],
            ports: vec![],
            health_url: None,
            command,
            post_stop: None,
        }
    }

    fn supervisor(specs: Vec<ServiceSpec>, table: Arc<dyn ProcessTable>) -> (Supervisor, LogStream) {
        let (sink, stream) = logs::channel();
        let probe = Arc::new(LivenessProbe::new(table, DEFAULT_PROBE_TIMEOUT));
        (
            Supervisor::new(specs, probe, sink, Duration::from_secs(1), Vec::new()),
            stream,
        )
    }

    async fn wait_for(sup: &Supervisor, expected: &StatusSnapshot) -> StatusSnapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = sup.refresh_status().await;
            if &status == expected || Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_all_survives_one_bad_command_and_stop_all_brings_everything_down() {
        let image_kw = unique("image");
        let chat_kw = unique("chat");
        let daemon_kw = unique("daemon");
        let mut daemon = spec(ServiceKind::InferenceDaemon, &daemon_kw, stub_command(&daemon_kw));
        daemon.post_stop = Some(DaemonConfig {
            api_url: "http://127.0.0.1:1".into(),
            runner_keyword: unique("runner"),
            timeout: Duration::from_millis(200),
        });
        let specs = vec![
            spec(
                ServiceKind::ImageGen,
                &image_kw,
                LaunchCommand::parse("/nonexistent/airack/comfyui").unwrap(),
            ),
            spec(ServiceKind::ChatUi, &chat_kw, stub_command(&chat_kw)),
            daemon,
        ];
        let (mut sup, mut stream) = supervisor(specs, Arc::new(SystemProcessTable::new()));

        let results = sup.start_all().await;
        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_err());
        assert!(matches!(results[1].1, Ok(StartOutcome::Launched { .. })));
        assert!(matches!(results[2].1, Ok(StartOutcome::Launched { .. })));

        let running: StatusSnapshot = [
            (ServiceKind::ImageGen, ServiceState::Stopped),
            (ServiceKind::ChatUi, ServiceState::Running),
            (ServiceKind::InferenceDaemon, ServiceState::Running),
        ]
        .into_iter()
        .collect();
        assert_eq!(wait_for(&sup, &running).await, running);

        let launch_errors = stream
            .drain()
            .into_iter()
            .filter(|e| e.kind == LogKind::Warning && e.text.starts_with("failed to launch"))
            .count();
        assert_eq!(launch_errors, 1);

        sup.stop_all().await;
        let stopped: StatusSnapshot = ServiceKind::ALL
            .into_iter()
            .map(|kind| (kind, ServiceState::Stopped))
            .collect();
        assert_eq!(wait_for(&sup, &stopped).await, stopped);
        assert!(sup.controllers().iter().all(|c| !c.has_managed()));
    }

    #[tokio::test]
    async fn stop_all_sweeps_external_daemon_and_cleans_up_once() {
        let stub = spawn_http_stub(|method, _| match method {
            "GET" => (200, r#"{"models":[{"name":"llama3:8b"}]}"#.into()),
            _ => (200, "{}".into()),
        })
        .await;
        let chat_kw = unique("chat");
        let table = Arc::new(FakeProcessTable::new(&[
            "/usr/bin/ollama serve",
            "/usr/bin/ollama runner --model llama3",
        ]));
        let mut daemon = spec(ServiceKind::InferenceDaemon, "ollama serve", stub_command("unused"));
        daemon.post_stop = Some(DaemonConfig {
            api_url: stub.base_url(),
            runner_keyword: "ollama runner".into(),
            timeout: Duration::from_millis(500),
        });
        let specs = vec![
            spec(ServiceKind::ImageGen, "ComfyUI/main.py", stub_command("unused")),
            spec(ServiceKind::ChatUi, &chat_kw, stub_command(&chat_kw)),
            daemon,
        ];
        let (mut sup, _stream) = supervisor(specs, table.clone());
        sup.start_service(ServiceKind::ChatUi).await.unwrap();
        assert!(sup.controller(ServiceKind::ChatUi).unwrap().has_managed());
        assert!(!sup.controller(ServiceKind::InferenceDaemon).unwrap().has_managed());

        sup.stop_all().await;

        assert!(!sup.controller(ServiceKind::ChatUi).unwrap().has_managed());
        assert!(table.commands().is_empty());
        let sweeps = table.sweeps();
        assert_eq!(sweeps.iter().filter(|p| *p == "ollama runner").count(), 1);
        assert_eq!(sweeps.last().map(String::as_str), Some("ollama runner"));
        let listings = stub
            .requests()
            .iter()
            .filter(|r| *r == "GET /api/ps")
            .count();
        assert_eq!(listings, 1);
    }

    #[tokio::test]
    async fn stop_all_unloads_models_before_the_daemon_goes_down() {
        let stub = spawn_http_stub(|method, path| match (method, path) {
            ("GET", "/api/ps") => (200, r#"{"models":[{"name":"llama3:8b"}]}"#.into()),
            ("POST", "/api/generate") => (200, "{}".into()),
            _ => (404, String::new()),
        })
        .await;
        // Killing the daemon process takes its API with it.
        let table = Arc::new(
            FakeProcessTable::new(&[
                "/usr/bin/ollama serve",
                "/usr/bin/ollama runner --model llama3",
            ])
            .on_kill("ollama serve", stub.shutdown_switch()),
        );
        let mut daemon = spec(ServiceKind::InferenceDaemon, "ollama serve", stub_command("unused"));
        daemon.post_stop = Some(DaemonConfig {
            api_url: stub.base_url(),
            runner_keyword: "ollama runner".into(),
            timeout: Duration::from_millis(500),
        });
        let specs = vec![
            spec(ServiceKind::ImageGen, "ComfyUI/main.py", stub_command("unused")),
            spec(ServiceKind::ChatUi, "open-webui", stub_command("unused")),
            daemon,
        ];
        let (mut sup, mut stream) = supervisor(specs, table.clone());

        sup.stop_all().await;

        assert_eq!(stub.requests(), vec!["GET /api/ps", "POST /api/generate"]);
        assert_eq!(
            table.sweeps(),
            vec!["ComfyUI/main.py", "open-webui", "ollama serve", "ollama runner"]
        );
        assert!(table.commands().is_empty());
        let entries = stream.drain();
        assert!(entries
            .iter()
            .any(|e| e.kind == LogKind::Notice && e.text == "unloaded llama3:8b"));
        assert!(!entries.iter().any(|e| e.kind == LogKind::Warning));
    }

    #[tokio::test]
    async fn refresh_is_bounded_when_every_probe_fails() {
        let silent = spawn_silent_listener().await;
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let specs = ServiceKind::ALL
            .into_iter()
            .map(|kind| {
                let mut s = spec(kind, &unique("absent"), stub_command("unused"));
                s.ports = vec![closed];
                s.health_url = Some(format!("http://127.0.0.1:{}/object_info", silent));
                s
            })
            .collect();
        let (sup, _stream) = supervisor(specs, Arc::new(FakeProcessTable::new(&[])));

        let started = Instant::now();
        let status = sup.refresh_status().await;
        // Per service: one TCP signal and one HTTP signal, plus one shared scan.
        let bound = DEFAULT_PROBE_TIMEOUT * 2 * 3 + Duration::from_millis(300);
        assert!(started.elapsed() < bound + Duration::from_millis(500));
        assert!(status.values().all(|s| *s == ServiceState::Stopped));
    }

    #[tokio::test]
    async fn stop_service_on_idle_service_is_a_no_op() {
        let table = Arc::new(FakeProcessTable::new(&[]));
        let specs = vec![spec(ServiceKind::ChatUi, "open-webui", stub_command("unused"))];
        let (mut sup, _stream) = supervisor(specs, table.clone());
        sup.stop_service(ServiceKind::ChatUi).await;
        sup.stop_service(ServiceKind::ImageGen).await;
        assert_eq!(table.sweeps(), vec!["open-webui"]);
    }

    #[tokio::test]
    async fn clean_cache_without_targets_reports_nothing() {
        let (sup, mut stream) = supervisor(Vec::new(), Arc::new(FakeProcessTable::new(&[])));
        assert!(sup.clean_cache().is_empty());
        assert_eq!(stream.drain().len(), 1);
    }
}
