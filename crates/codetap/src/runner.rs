//! VS Code Server process runner.
//!
//! The server child gets its own process group so `stop` can take down any
//! intermediary shells and their descendants with one negative-PID SIGTERM.
//! Stdin is deliberately empty (in stdio relay mode stdin carries framed
//! transport data and must remain exclusive to the relay reader) and stdout
//! is redirected to our stderr (stdout is the frame channel).

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// How a server process ended. Cloneable so a cached exit result can be
/// handed out by repeated `wait` calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerExit {
    #[error("code-server exited with code {0}")]
    Code(i32),
    #[error("code-server terminated by signal {0}")]
    Signal(i32),
    #[error("wait for code-server: {0}")]
    Wait(String),
}

/// Handle to a running (or exited) server process.
///
/// `wait` resolves when the child exits and may be called again afterwards;
/// it returns the cached result. `stop` is idempotent.
pub struct ServerHandle {
    pid: u32,
    exit_rx: Option<oneshot::Receiver<Result<(), ServerExit>>>,
    exited: Option<Result<(), ServerExit>>,
    stop: Arc<dyn Fn() + Send + Sync>,
}

impl ServerHandle {
    /// Assemble a handle from raw parts. Used by the process runner and by
    /// test doubles that simulate a server.
    pub fn from_parts(
        pid: u32,
        exit_rx: oneshot::Receiver<Result<(), ServerExit>>,
        stop: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self { pid, exit_rx: Some(exit_rx), exited: None, stop }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the child exits. Cancel-safe: dropping the future leaves
    /// the handle ready to wait again.
    pub async fn wait(&mut self) -> Result<(), ServerExit> {
        if let Some(result) = &self.exited {
            return result.clone();
        }
        let result = match self.exit_rx.as_mut() {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(ServerExit::Wait("server exit channel dropped".to_string())),
            },
            None => Err(ServerExit::Wait("server exit channel unavailable".to_string())),
        };
        self.exit_rx = None;
        self.exited = Some(result.clone());
        result
    }

    /// Deliver SIGTERM to the child's process group.
    pub fn stop(&self) {
        (self.stop)();
    }
}

/// Starts the editor-server binary on a Unix socket.
#[async_trait]
pub trait ServerRunner: Send + Sync {
    /// Launch `bin` listening on `socket`. `None` for the token tells the
    /// server to accept connections without one.
    async fn start(&self, bin: &Path, socket: &Path, token: Option<&str>) -> Result<ServerHandle>;
}

/// The production runner: spawns the real server process.
pub struct ProcessRunner;

#[async_trait]
impl ServerRunner for ProcessRunner {
    async fn start(&self, bin: &Path, socket: &Path, token: Option<&str>) -> Result<ServerHandle> {
        let mut cmd = Command::new(bin);
        cmd.arg(format!("--socket-path={}", socket.display()));
        cmd.arg("--accept-server-license-terms");
        match token {
            Some(token) => {
                cmd.arg(format!("--connection-token={token}"));
            }
            None => {
                cmd.arg("--without-connection-token");
            }
        }

        cmd.stdin(Stdio::null());
        // Server logs go to our stderr; our stdout may be the frame channel.
        let stderr_copy = duplicate_stderr().context("duplicate stderr for code-server")?;
        cmd.stdout(stderr_copy);
        cmd.stderr(Stdio::inherit());

        // Own process group, so stop() reaches intermediary shells too.
        cmd.process_group(0);
        #[cfg(target_os = "linux")]
        unsafe {
            // If codetap dies unexpectedly the kernel sends SIGTERM to the
            // direct child.
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("start code-server {}", bin.display()))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("code-server exited before its pid could be read"))?;
        info!(pid, socket = %socket.display(), "code-server started");

        let forwarder = tokio::spawn(forward_signals(pid));

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = match child.wait().await {
                Ok(status) => classify_exit(status),
                Err(e) => Err(ServerExit::Wait(e.to_string())),
            };
            forwarder.abort();
            let _ = exit_tx.send(result);
        });

        let stop = Arc::new(move || {
            // Negative pid targets the whole process group. Idempotent:
            // signalling an exited group is a harmless ESRCH.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        });

        Ok(ServerHandle::from_parts(pid, exit_rx, stop))
    }
}

fn classify_exit(status: std::process::ExitStatus) -> Result<(), ServerExit> {
    use std::os::unix::process::ExitStatusExt;

    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(ServerExit::Code(code)),
        None => Err(ServerExit::Signal(status.signal().unwrap_or(0))),
    }
}

fn duplicate_stderr() -> std::io::Result<Stdio> {
    use std::os::fd::AsFd;

    let fd = std::io::stderr().as_fd().try_clone_to_owned()?;
    Ok(Stdio::from(fd))
}

/// Forward SIGINT and SIGTERM received by this process to the server's
/// process group. Runs until aborted when the child exits.
async fn forward_signals(pid: u32) {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "install SIGTERM handler");
            return;
        }
    };

    loop {
        let sig = tokio::select! {
            _ = sigint.recv() => libc::SIGINT,
            _ = sigterm.recv() => libc::SIGTERM,
        };
        info!(signal = sig, "forwarding signal to code-server");
        unsafe {
            libc::kill(-(pid as i32), sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_stop() -> Arc<dyn Fn() + Send + Sync> {
        Arc::new(|| {})
    }

    #[tokio::test]
    async fn wait_returns_cached_result_on_second_call() {
        let (tx, rx) = oneshot::channel();
        let mut handle = ServerHandle::from_parts(1, rx, noop_stop());
        tx.send(Err(ServerExit::Code(3))).unwrap();

        let first = handle.wait().await.unwrap_err();
        let second = handle.wait().await.unwrap_err();
        assert!(matches!(first, ServerExit::Code(3)));
        assert!(matches!(second, ServerExit::Code(3)));
    }

    #[tokio::test]
    async fn dropped_exit_channel_surfaces_as_wait_error() {
        let (tx, rx) = oneshot::channel::<Result<(), ServerExit>>();
        drop(tx);
        let mut handle = ServerHandle::from_parts(1, rx, noop_stop());
        assert!(matches!(handle.wait().await.unwrap_err(), ServerExit::Wait(_)));
    }

    #[tokio::test]
    async fn process_runner_reports_exit_code() {
        // `sh` plays the server binary; flags are ignored by the script.
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-server");
        std::fs::write(&bin, "#!/bin/sh\nexit 7\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let socket = dir.path().join("srv.sock");
        let mut handle = ProcessRunner.start(&bin, &socket, Some("tok")).await.unwrap();
        let exit = handle.wait().await.unwrap_err();
        assert!(matches!(exit, ServerExit::Code(7)), "got {exit:?}");
    }

    #[tokio::test]
    async fn process_runner_stop_terminates_group() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("sleepy-server");
        std::fs::write(&bin, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let socket = dir.path().join("srv.sock");
        let mut handle = ProcessRunner.start(&bin, &socket, None).await.unwrap();
        handle.stop();
        handle.stop(); // idempotent
        let exit = handle.wait().await.unwrap_err();
        assert!(matches!(exit, ServerExit::Signal(libc::SIGTERM)), "got {exit:?}");
    }
}
