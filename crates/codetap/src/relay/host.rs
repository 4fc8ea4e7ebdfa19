//! Host-side mux endpoint.
//!
//! Owns the host-visible Unix listener, the relay subprocess, and the frame
//! stream over its stdin/stdout. Every accepted editor connection gets a
//! fresh conn_id (monotone from 1, never reused) and an OPEN frame; bytes
//! then flow as DATA frames in both directions until either side closes.
//!
//! Before any mux traffic the endpoint performs the INIT handshake: it
//! sends `INIT(desired commit)` and requires an `INIT` ack carrying the
//! commit the remote actually runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use codetap_core::frame::{read_frame, Frame, FrameError, FrameKind, FrameWriter};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{ChildStdin, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{close_all, pump_socket_reads, ConnMap};

/// Run the host side of a relay session.
///
/// Binds `socket_path`, spawns `command`, performs the INIT handshake with
/// `commit`, invokes `on_init` with the acknowledged commit, then bridges
/// editor connections to frames until the subprocess's frame stream ends.
/// The socket file is removed on return.
pub async fn run_host_side(
    socket_path: &Path,
    command: &[String],
    commit: &str,
    on_init: impl FnOnce(String) + Send,
) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("relay command is empty");
    };

    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("listen on {}", socket_path.display()))?;
    let _socket_guard = SocketFileGuard(socket_path.to_path_buf());
    info!(socket = %socket_path.display(), "listening");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn relay command {program:?}"))?;
    let child_pid = child
        .id()
        .ok_or_else(|| anyhow!("relay subprocess exited before its pid could be read"))?;
    info!(pid = child_pid, "subprocess started");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("relay subprocess stdin unavailable"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("relay subprocess stdout unavailable"))?;

    let _signal_guard = AbortOnDrop(tokio::spawn(forward_signals_to_pid(child_pid)));

    let writer = FrameWriter::new(stdin);

    // Init phase: send our commit, require the ack before any mux traffic.
    info!(commit, "sending init frame");
    writer
        .send(&Frame::init(commit.as_bytes().to_vec()))
        .await
        .context("write init frame")?;

    let ack = read_frame(&mut stdout).await.context("read init ack")?;
    if ack.kind != FrameKind::Init {
        bail!("expected INIT ack, got 0x{:02x}", ack.kind as u8);
    }
    let acked_commit = String::from_utf8_lossy(&ack.payload).to_string();
    info!(commit = %acked_commit, "init ack received");
    on_init(acked_commit);

    let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicU32::new(0));

    let acceptor = tokio::spawn(accept_editor_connections(
        listener,
        conns.clone(),
        next_id,
        writer.clone(),
    ));
    let _acceptor_guard = AbortOnDrop(acceptor);

    // Dispatch frames from the subprocess until its stream ends.
    let read_result = loop {
        match read_frame(&mut stdout).await {
            Ok(frame) => dispatch_frame(frame, &conns).await,
            Err(FrameError::Closed) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    close_all(&conns).await;

    let wait_result = child.wait().await.context("wait for relay subprocess");

    // Transport garbage is fatal for the session and outranks the exit
    // status in the report.
    if let Err(e) = read_result {
        return Err(e).context("read frame");
    }
    let status = wait_result?;
    if !status.success() {
        bail!("relay subprocess exited with {status}");
    }
    Ok(())
}

async fn dispatch_frame(frame: Frame, conns: &ConnMap) {
    match frame.kind {
        FrameKind::Data => {
            let mut map = conns.lock().await;
            if let Some(sock) = map.get_mut(&frame.conn_id) {
                if let Err(e) = sock.write_all(&frame.payload).await {
                    error!(conn = frame.conn_id, error = %e, "write to editor socket failed");
                    map.remove(&frame.conn_id);
                }
            }
        }
        FrameKind::Close => {
            conns.lock().await.remove(&frame.conn_id);
        }
        // OPEN and INIT are not expected once the handshake is done.
        FrameKind::Open | FrameKind::Init => {}
    }
}

async fn accept_editor_connections(
    listener: UnixListener,
    conns: ConnMap,
    next_id: Arc<AtomicU32>,
    writer: FrameWriter<ChildStdin>,
) {
    loop {
        let stream: UnixStream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!(error = %e, "accept editor connection");
                return;
            }
        };

        let conn_id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (read_half, write_half) = stream.into_split();
        conns.lock().await.insert(conn_id, write_half);
        info!(conn = conn_id, "connection accepted");

        if let Err(e) = writer.send(&Frame::open(conn_id)).await {
            error!(conn = conn_id, error = %e, "write OPEN frame failed");
            conns.lock().await.remove(&conn_id);
            continue;
        }

        tokio::spawn(pump_socket_reads(
            conn_id,
            read_half,
            conns.clone(),
            writer.clone(),
        ));
    }
}

/// Deliver SIGINT, SIGTERM, and SIGHUP received by this process to the
/// relay subprocess so the remote command tears down with us.
async fn forward_signals_to_pid(pid: u32) {
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
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "install SIGHUP handler");
            return;
        }
    };

    loop {
        let sig = tokio::select! {
            _ = sigint.recv() => libc::SIGINT,
            _ = sigterm.recv() => libc::SIGTERM,
            _ = sighup.recv() => libc::SIGHUP,
        };
        info!(signal = sig, "forwarding signal");
        unsafe {
            libc::kill(pid as i32, sig);
        }
    }
}

struct SocketFileGuard(PathBuf);

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
