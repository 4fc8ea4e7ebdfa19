//! `codetap relay`: carry a remote session over an arbitrary stdio
//! transport.
//!
//! The control socket comes up before the subprocess is spawned, so the
//! session is discoverable immediately; the target commit arrives with the
//! first `CONNECT` from the editor. Relay mode cannot switch versions (the
//! remote side already runs) and has no connection token, so `CONNECT`
//! answers a bare `OK` and later commits must match the pinned one.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Args;
use codetap_core::control::{parse_request, CtlRequest, SessionInfo};
use codetap_core::platform;
use codetap_core::store::SessionStore;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{error, info};

use crate::relay::host::run_host_side;

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Session name (default: hostname)
    #[arg(long)]
    name: Option<String>,

    /// Workspace folder for metadata (default: current directory)
    #[arg(long)]
    folder: Option<PathBuf>,

    /// Socket directory (default: /dev/shm/codetap)
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Command whose stdio speaks the frame protocol, typically ending in
    /// "codetap run --stdio" (e.g. ssh host codetap run --stdio)
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

pub async fn execute(args: RelayArgs) -> Result<()> {
    let socket_dir = platform::resolve_socket_dir(args.socket_dir.as_deref());
    let name = args.name.unwrap_or_else(platform::default_session_name);
    let folder = match args.folder {
        Some(folder) => folder.display().to_string(),
        None => std::env::current_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_default(),
    };
    let arch = platform::detect_arch().map(str::to_string).unwrap_or_default();

    let store = SessionStore::new(socket_dir);
    store.ensure_dir()?;

    let socket_path = store.socket_path(&name);
    let ctl_path = store.ctl_socket_path(&name);

    let _ = std::fs::remove_file(&ctl_path);
    let _ = std::fs::remove_file(&socket_path);

    let ctl_listener = UnixListener::bind(&ctl_path).context("listen ctl socket")?;
    let _cleanup = RelayCleanup { store: store.clone(), name: name.clone() };

    let meta = Arc::new(Mutex::new(RelayMeta {
        name: name.clone(),
        commit: String::new(),
        arch,
        folder,
        pid: std::process::id(),
        started_at: Utc::now(),
    }));

    // The first CONNECT pins the commit; later connects must match it.
    let (commit_tx, commit_rx) = oneshot::channel::<String>();
    let commit_slot = Arc::new(Mutex::new(Some(commit_tx)));

    let accept_meta = meta.clone();
    let acceptor = tokio::spawn(async move {
        loop {
            match ctl_listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_relay_ctl_connection(
                        stream,
                        accept_meta.clone(),
                        commit_slot.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "accept on relay control socket");
                    return;
                }
            }
        }
    });

    info!(ctl = %ctl_path.display(), "waiting for editor client");

    let client_commit = match commit_rx.await {
        Ok(commit) => commit,
        Err(_) => {
            acceptor.abort();
            bail!("relay control socket closed before an editor connected");
        }
    };

    let on_init = {
        let meta = meta.clone();
        move |acked_commit: String| {
            lock_meta(&meta).commit = acked_commit;
        }
    };

    let result = run_host_side(&socket_path, &args.command, &client_commit, on_init).await;
    acceptor.abort();
    result
}

/// Metadata served for `INFO` on the relay's control socket.
struct RelayMeta {
    name: String,
    commit: String,
    arch: String,
    folder: String,
    pid: u32,
    started_at: DateTime<Utc>,
}

fn lock_meta(meta: &Arc<Mutex<RelayMeta>>) -> std::sync::MutexGuard<'_, RelayMeta> {
    meta.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type CommitSlot = Arc<Mutex<Option<oneshot::Sender<String>>>>;

/// Handle `INFO` and `CONNECT` on the relay control socket.
async fn handle_relay_ctl_connection(
    stream: UnixStream,
    meta: Arc<Mutex<RelayMeta>>,
    commit_slot: CommitSlot,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match timeout(Duration::from_secs(5), reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {}
        _ => return,
    }
    let mut stream = reader.into_inner();

    match parse_request(&line) {
        Ok(CtlRequest::Info) => {
            let info = {
                let m = lock_meta(&meta);
                SessionInfo {
                    name: m.name.clone(),
                    commit: m.commit.clone(),
                    arch: m.arch.clone(),
                    folder: m.folder.clone(),
                    pid: m.pid,
                    started_at: m.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                }
            };
            let Ok(mut response) = serde_json::to_string(&info) else { return };
            response.push('\n');
            let _ = stream.write_all(response.as_bytes()).await;
        }
        Ok(CtlRequest::Connect { commit, client_id }) => {
            // First CONNECT wins the commit slot and wakes the relay.
            if let Some(tx) = take_commit_sender(&commit_slot) {
                lock_meta(&meta).commit = commit.clone();
                let _ = tx.send(commit.clone());
            }

            let established = lock_meta(&meta).commit.clone();
            if !established.is_empty() && commit != established {
                let response =
                    format!("ERR version mismatch: {established} running in relay mode\n");
                let _ = stream.write_all(response.as_bytes()).await;
                return;
            }

            // No token in relay mode; hold the connection as the lease.
            if stream.write_all(b"OK\n").await.is_err() {
                return;
            }
            info!(client = %client_id, commit = %commit, "relay lease granted");

            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        }
        Err(reject) => {
            let _ = stream.write_all(reject.response_line().as_bytes()).await;
        }
    }
}

fn take_commit_sender(slot: &CommitSlot) -> Option<oneshot::Sender<String>> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

struct RelayCleanup {
    store: SessionStore,
    name: String,
}

impl Drop for RelayCleanup {
    fn drop(&mut self) {
        info!(name = %self.name, "cleaning up relay session");
        if let Err(e) = self.store.remove(&self.name) {
            error!(name = %self.name, error = %e, "relay cleanup failed");
        }
    }
}
