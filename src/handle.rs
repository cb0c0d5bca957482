//! Child processes launched by the supervisor itself.
//!
//! A `ProcessHandle` owns the tokio `Child`, exposes its merged output for the
//! log multiplexer and knows how to ask it to go away without blocking.

use std::io::PipeReader;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::LaunchError;
use crate::service::{LaunchCommand, ServiceKind};

pub struct ProcessHandle {
    service: ServiceKind,
    child: Child,
    output: Option<PipeReader>,
    pid: Option<u32>,
    exited: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawns `command` with stdin detached.
    ///
    /// stdout and stderr share one pipe, so the reader sees lines in the order
    /// the child wrote them.
    pub fn launch(service: ServiceKind, command: &LaunchCommand) -> Result<Self, LaunchError> {
        let launch_error = |source: std::io::Error| LaunchError {
            service,
            command: command.display(),
            source,
        };
        if command.program.is_empty() {
            return Err(launch_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            )));
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        if !command.env.is_empty() {
            cmd.envs(&command.env);
        }
        let (output, writer) = std::io::pipe().map_err(launch_error)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(writer.try_clone().map_err(launch_error)?))
            .stderr(Stdio::from(writer));
        // Dropping the handle must not kill the service; `terminate` owns that.
        cmd.kill_on_drop(false);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(launch_error)?;
        // Our copies of the write end must go, or the reader never sees EOF.
        drop(cmd);
        let pid = child.id();
        debug!(%service, ?pid, command = %command.display(), "spawned");
        Ok(Self {
            service,
            child,
            output: Some(output),
            pid,
            exited: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hands the read end of the output pipe to the caller, once.
    pub fn take_output(&mut self) -> Option<PipeReader> {
        self.output.take()
    }

    /// Non-blocking exit check; caches the status once observed.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.exited.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exited = status,
                Err(err) => warn!(service = %self.service, error = %err, "failed to poll child"),
            }
        }
        self.exited
    }

    pub fn is_live(&mut self) -> bool {
        self.try_exit_status().is_none()
    }

    /// Sends a graceful termination signal and returns immediately.
    ///
    /// A detached task waits up to `grace` for the child to exit, force-kills it
    /// if it is still around, and reaps it either way.
    pub fn terminate(mut self, grace: Duration) {
        if self.try_exit_status().is_some() {
            return;
        }
        if let Some(pid) = self.pid {
            send_terminate(pid);
        }
        let service = self.service;
        let mut child = self.child;
        tokio::spawn(async move {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(%service, ?status, "terminated"),
                Ok(Err(err)) => warn!(%service, error = %err, "failed to wait for child"),
                Err(_) => {
                    warn!(%service, grace_ms = grace.as_millis() as u64, "did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        });
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(windows)]
fn send_terminate(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_terminate(_pid: u32) {}
