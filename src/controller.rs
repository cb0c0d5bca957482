//! Per-service start/stop policy.
//!
//! A `ServiceController` owns at most one launched process for its service.
//! Starting is idempotent; stopping always terminates the owned process (if
//! any) *and* sweeps the process table by keyword, because the service may
//! have been started by someone else or left behind by an earlier session.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::daemon;
use crate::error::LaunchError;
use crate::handle::ProcessHandle;
use crate::logs::{self, LogSink, LogSource};
use crate::probe::LivenessProbe;
use crate::proctable;
use crate::service::{Lifecycle, ServiceKind, ServiceSpec, ServiceState};

/// The process a controller launched and still owns.
pub struct ManagedProcess {
    handle: ProcessHandle,
    started_at: Instant,
}

/// What `start` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Launched { pid: Option<u32> },
    /// A managed process is already recorded.
    AlreadyRunning,
    /// The probe found the service live without an owned process.
    RunningExternally,
}

pub struct ServiceController {
    spec: ServiceSpec,
    managed: Option<ManagedProcess>,
    lifecycle: Lifecycle,
    probe: Arc<LivenessProbe>,
    sink: LogSink,
    grace: Duration,
}

impl ServiceController {
    pub fn new(spec: ServiceSpec, probe: Arc<LivenessProbe>, sink: LogSink, grace: Duration) -> Self {
        Self {
            spec,
            managed: None,
            lifecycle: Lifecycle::Stopped,
            probe,
            sink,
            grace,
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn has_managed(&self) -> bool {
        self.managed.is_some()
    }

    pub fn owned_pid(&self) -> Option<u32> {
        self.managed.as_ref().and_then(|m| m.handle.pid())
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.managed.as_ref().map(|m| m.started_at.elapsed())
    }

    fn source(&self) -> LogSource {
        LogSource::Service(self.spec.kind)
    }

    /// Launches the service unless it is already up.
    ///
    /// Only a failed launch is an error; being already up is logged and
    /// reported through `StartOutcome`.
    pub async fn start(&mut self) -> Result<StartOutcome, LaunchError> {
        let source = self.source();
        if self.managed.is_some() {
            self.sink
                .notice(source, format!("{} is already running", self.spec.name));
            return Ok(StartOutcome::AlreadyRunning);
        }

        match self.probe.check_service(&self.spec).await {
            ServiceState::Running => {
                self.sink.notice(
                    source,
                    format!("{} is already running outside airack, not starting", self.spec.name),
                );
                return Ok(StartOutcome::RunningExternally);
            }
            ServiceState::Unknown => self.sink.warning(
                source,
                format!("liveness of {} is unknown, starting anyway", self.spec.name),
            ),
            ServiceState::Stopped => {}
        }

        self.lifecycle = Lifecycle::Starting;
        self.sink.notice(
            source,
            format!("starting {}: {}", self.spec.name, self.spec.command.display()),
        );
        let mut handle = match ProcessHandle::launch(self.spec.kind, &self.spec.command) {
            Ok(handle) => handle,
            Err(err) => {
                self.lifecycle = Lifecycle::Stopped;
                self.sink.warning(source, err.to_string());
                return Err(err);
            }
        };
        if let Err(err) = logs::attach(self.spec.kind, handle.take_output(), self.sink.clone()) {
            self.sink
                .warning(source, format!("could not capture output: {}", err));
        }
        let pid = handle.pid();
        self.managed = Some(ManagedProcess {
            handle,
            started_at: Instant::now(),
        });
        self.lifecycle = Lifecycle::Running;
        match pid {
            Some(pid) => self
                .sink
                .notice(source, format!("{} started (pid {})", self.spec.name, pid)),
            None => self.sink.notice(source, format!("{} started", self.spec.name)),
        }
        Ok(StartOutcome::Launched { pid })
    }

    /// Stops the service, including the daemon-wide cleanup when configured.
    pub async fn stop(&mut self) {
        self.stop_inner(true).await;
    }

    /// Stops the service; `with_cleanup` controls the post-stop hook so that a
    /// batch stop can run it once for the whole batch instead.
    pub async fn stop_inner(&mut self, with_cleanup: bool) {
        let source = self.source();
        self.lifecycle = Lifecycle::Stopping;
        self.sink.notice(source, format!("stopping {}", self.spec.name));

        let cleanup = if with_cleanup {
            self.spec.post_stop.clone()
        } else {
            None
        };
        // Unload while the daemon can still answer.
        if let Some(config) = &cleanup {
            daemon::unload_models(config, &self.sink).await;
        }

        if let Some(managed) = self.managed.take() {
            if let Some(pid) = managed.handle.pid() {
                self.sink.notice(source, format!("terminating pid {}", pid));
            }
            managed.handle.terminate(self.grace);
        }

        for keyword in &self.spec.keywords {
            if keyword.is_empty() {
                continue;
            }
            match proctable::sweep(self.probe.table(), keyword).await {
                Ok(0) => debug!(service = %self.spec.kind, %keyword, "sweep found nothing"),
                Ok(killed) => self.sink.notice(
                    source,
                    format!("killed {} process(es) matching {:?}", killed, keyword),
                ),
                Err(err) => self.sink.warning(source, err.to_string()),
            }
        }

        if let Some(config) = &cleanup {
            daemon::sweep_runners(config, self.probe.table(), &self.sink).await;
        }

        self.lifecycle = Lifecycle::Stopped;
        self.sink.notice(source, format!("{} stopped", self.spec.name));
    }

    /// Drops the record of an owned process that has exited on its own.
    pub fn reap(&mut self) -> Option<ExitStatus> {
        let managed = self.managed.as_mut()?;
        let status = managed.handle.try_exit_status()?;
        self.managed = None;
        self.lifecycle = Lifecycle::Stopped;
        let message = match status.code() {
            Some(code) => format!("{} exited with code {}", self.spec.name, code),
            None => format!("{} was terminated by a signal", self.spec.name),
        };
        self.sink.notice(self.source(), message);
        Some(status)
    }
}
