//! Session lifecycle: provision, run code-server, serve the CTAP1 control
//! socket, and restart the server when the single attached editor asks for
//! a different version.
//!
//! One session owns two sockets in the socket directory: `<name>.sock`
//! (where code-server itself listens) and `<name>.ctl.sock` (where this
//! service answers `INFO` and `CONNECT`). The session runs until the server
//! process exits or a restart fails irrecoverably; a deferred cleanup
//! removes both sockets on every exit path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use codetap_core::control::{parse_request, CtlRequest, SessionInfo};
use codetap_core::ctl_client;
use codetap_core::frame::{read_frame, write_frame, Frame, FrameKind};
use codetap_core::store::SessionStore;
use codetap_core::token::TokenGenerator;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::provision::{Downloader, Extractor, Provisioner};
use crate::relay::remote::run_remote_side;
use crate::runner::{ServerHandle, ServerRunner};

/// Read deadline for the control request line. Cleared once a CONNECT
/// becomes a lease.
const CTL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved runtime configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub commit: String,
    pub arch: String,
    pub folder: String,
}

/// A discovered session: name, data-socket path, and the `INFO` snapshot
/// when the session answered the probe.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub name: String,
    pub socket_path: PathBuf,
    pub info: Option<SessionInfo>,
}

impl SessionEntry {
    pub fn is_alive(&self) -> bool {
        self.info.is_some()
    }
}

/// Orchestrates the codetap session lifecycle. All collaborators are
/// injected so tests can run the full lifecycle without the network or a
/// real server binary.
pub struct Service {
    downloader: Arc<dyn Downloader>,
    extractor: Arc<dyn Extractor>,
    provisioner: Arc<dyn Provisioner>,
    runner: Arc<dyn ServerRunner>,
    store: SessionStore,
    token_gen: Arc<dyn TokenGenerator>,
}

impl Service {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        extractor: Arc<dyn Extractor>,
        provisioner: Arc<dyn Provisioner>,
        runner: Arc<dyn ServerRunner>,
        store: SessionStore,
        token_gen: Arc<dyn TokenGenerator>,
    ) -> Self {
        Self { downloader, extractor, provisioner, runner, store, token_gen }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Ensure the server build for `commit` is installed, downloading and
    /// extracting when needed. Returns the server binary path.
    pub async fn provision(&self, commit: &str, arch: &str) -> Result<PathBuf> {
        if !self.provisioner.is_provisioned(commit) {
            let tarball = self
                .downloader
                .download(commit, arch)
                .await
                .context("download")?;
            let target = self.provisioner.server_dir(commit);
            self.extractor
                .extract(&tarball, &target)
                .await
                .context("extract")?;
        }
        Ok(self.provisioner.server_bin_path(commit))
    }

    /// Run a session until its server exits.
    ///
    /// Provisions the server, starts code-server on `<name>.sock`, then
    /// serves `INFO` and `CONNECT` on `<name>.ctl.sock`. Both sockets are
    /// removed when this returns.
    pub async fn run(&self, cfg: SessionConfig) -> Result<()> {
        info!(name = %cfg.name, commit = %cfg.commit, arch = %cfg.arch, "starting session");

        self.store.ensure_dir().context("ensure socket dir")?;

        let bin_path = self.provision(&cfg.commit, &cfg.arch).await?;

        let socket_path = self.store.socket_path(&cfg.name);
        let ctl_path = self.store.ctl_socket_path(&cfg.name);

        // A live control socket means another process owns this name.
        if ctl_path.exists() {
            if ctl_client::is_socket_alive(&ctl_path).await {
                bail!(
                    "session {:?} already running on {}; use a different --name \
                     or stop the existing session first",
                    cfg.name,
                    ctl_path.display()
                );
            }
            let _ = std::fs::remove_file(&ctl_path);
        }
        let _ = std::fs::remove_file(&socket_path);

        // Tokens are in-memory only and paired with the commit they open.
        let token = self.token_gen.generate().context("token")?;

        let state = Arc::new(Mutex::new(SessionState {
            name: cfg.name.clone(),
            commit: cfg.commit.clone(),
            arch: cfg.arch.clone(),
            folder: cfg.folder.clone(),
            token: token.clone(),
            pid: std::process::id(),
            started_at: Utc::now(),
            leases: HashMap::new(),
            restart_in_progress: false,
        }));

        let mut server = self
            .runner
            .start(&bin_path, &socket_path, Some(&token))
            .await?;

        if let Err(e) = wait_for_socket(&socket_path).await {
            server.stop();
            let _ = server.wait().await;
            return Err(e).context("server failed to start");
        }
        info!(socket = %socket_path.display(), "code-server ready");

        let ctl_listener = match UnixListener::bind(&ctl_path) {
            Ok(listener) => listener,
            Err(e) => {
                server.stop();
                let _ = server.wait().await;
                return Err(e).context("listen ctl socket");
            }
        };

        let _cleanup = SessionCleanup { store: self.store.clone(), name: cfg.name.clone() };

        let (restart_tx, restart_rx) = mpsc::channel::<RestartRequest>(1);
        let cancel = CancellationToken::new();

        let acceptor = tokio::spawn(accept_ctl_connections(
            ctl_listener,
            state.clone(),
            restart_tx.clone(),
            cancel.clone(),
        ));

        let result = self
            .lifecycle_loop(server, restart_rx, &state, &socket_path)
            .await;

        cancel.cancel();
        acceptor.abort();
        result
    }

    /// The restart state machine: wait on the running server and on restart
    /// requests from CONNECT handlers, swapping servers as requested.
    async fn lifecycle_loop(
        &self,
        mut server: ServerHandle,
        mut restart_rx: mpsc::Receiver<RestartRequest>,
        state: &SharedState,
        socket_path: &Path,
    ) -> Result<()> {
        loop {
            tokio::select! {
                exit = server.wait() => {
                    // Server gone. A restart request racing in right now
                    // still gets served; otherwise this exit ends the
                    // session.
                    match restart_rx.try_recv() {
                        Ok(request) => {
                            server = self.perform_restart(request, state, socket_path).await?;
                        }
                        Err(_) => return exit.map_err(Into::into),
                    }
                }
                Some(request) = restart_rx.recv() => {
                    info!(commit = %request.commit, "stopping server for version switch");
                    server.stop();
                    let _ = server.wait().await;
                    server = self.perform_restart(request, state, socket_path).await?;
                }
            }
        }
    }

    /// Run one restart, reporting the outcome to the requesting CONNECT.
    /// A failed restart is irrecoverable and ends the session.
    async fn perform_restart(
        &self,
        request: RestartRequest,
        state: &SharedState,
        socket_path: &Path,
    ) -> Result<ServerHandle> {
        match self.start_replacement(&request.commit, state, socket_path).await {
            Ok(server) => {
                let _ = request.respond.send(Ok(()));
                Ok(server)
            }
            Err(e) => {
                let reason = format!("{e:#}");
                let _ = request.respond.send(Err(e));
                Err(anyhow!("restart failed: {reason}"))
            }
        }
    }

    /// Provision and start a server for `commit`, then publish the new
    /// commit, token, and start time in one critical section.
    async fn start_replacement(
        &self,
        commit: &str,
        state: &SharedState,
        socket_path: &Path,
    ) -> Result<ServerHandle> {
        let arch = lock_state(state).arch.clone();

        let bin_path = self.provision(commit, &arch).await.context("provision")?;
        let new_token = self.token_gen.generate().context("token")?;

        let _ = std::fs::remove_file(socket_path);

        let server = self
            .runner
            .start(&bin_path, socket_path, Some(&new_token))
            .await
            .context("start")?;

        if let Err(e) = wait_for_socket(socket_path).await {
            server.stop();
            return Err(e).context("server failed to start after restart");
        }

        {
            let mut st = lock_state(state);
            st.commit = commit.to_string();
            st.token = new_token;
            st.started_at = Utc::now();
        }

        info!(commit, "code-server restarted");
        Ok(server)
    }

    /// All discovered sessions with their liveness and metadata.
    pub async fn list(&self) -> Result<Vec<SessionEntry>> {
        let mut entries = Vec::new();
        for name in self.store.list_session_names()? {
            let ctl_path = self.store.ctl_socket_path(&name);
            entries.push(SessionEntry {
                socket_path: self.store.socket_path(&name),
                info: ctl_client::query_info(&ctl_path).await,
                name,
            });
        }
        Ok(entries)
    }

    /// Remove every session whose control socket no longer answers INFO.
    pub async fn clean(&self) -> Result<()> {
        let mut removed = 0usize;
        for name in self.store.list_session_names().context("list sessions")? {
            let ctl_path = self.store.ctl_socket_path(&name);
            if ctl_client::query_info(&ctl_path).await.is_none() {
                info!(name = %name, "removing stale session");
                if let Err(e) = self.store.remove(&name) {
                    error!(name = %name, error = %e, "remove stale session failed");
                    continue;
                }
                removed += 1;
            }
        }
        info!(removed, "cleanup complete");
        Ok(())
    }

    /// Run a stdio session: start code-server on a private temp socket and
    /// relay all traffic over `stdin`/`stdout` with the mux frame protocol.
    ///
    /// When `cfg.commit` is empty the session blocks on an INIT frame for
    /// the commit; an empty INIT payload falls back to `resolve_commit`.
    /// After the server is up, the acknowledged commit goes back as an INIT
    /// frame before any mux traffic.
    pub async fn run_stdio<R, W, F, Fut>(
        &self,
        cfg: SessionConfig,
        mut stdin: R,
        mut stdout: W,
        resolve_commit: F,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<String>>,
    {
        let mut commit = cfg.commit.clone();
        let init_phase = commit.is_empty();

        if init_phase {
            info!("waiting for init frame with commit hash");
            commit = read_init_commit(&mut stdin).await?;
            if commit.is_empty() {
                info!("init frame had no commit, resolving locally");
                commit = resolve_commit().await.context("resolve commit")?;
                if commit.is_empty() {
                    bail!("no commit available from init frame or local resolution");
                }
                info!(commit = %commit, "resolved commit locally");
            } else {
                info!(commit = %commit, "received init frame");
            }
        }

        info!(commit = %commit, arch = %cfg.arch, "starting stdio session");

        let bin_path = self.provision(&commit, &cfg.arch).await?;

        let tmp_socket = std::env::temp_dir().join(format!("codetap-{}.sock", std::process::id()));
        match std::fs::remove_file(&tmp_socket) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("remove stale temp socket"),
        }

        // No token on the stdio path: the only route to the socket is the
        // frame stream itself.
        let mut server = self.runner.start(&bin_path, &tmp_socket, None).await?;

        if let Err(e) = wait_for_socket(&tmp_socket).await {
            server.stop();
            let _ = server.wait().await;
            return Err(e).context("server failed to start");
        }
        info!(socket = %tmp_socket.display(), "server ready, starting relay");

        if init_phase {
            write_frame(&mut stdout, &Frame::init(commit.clone().into_bytes()))
                .await
                .context("write init ack")?;
            info!(commit = %commit, "init ack sent");
        }

        let relay = run_remote_side(stdin, stdout, &tmp_socket);
        tokio::pin!(relay);

        tokio::select! {
            exit = server.wait() => exit.map_err(Into::into),
            relay_result = &mut relay => {
                info!("relay ended, stopping code-server");
                server.stop();
                let _ = server.wait().await;
                relay_result
            }
        }
    }
}

// ── Session state ────────────────────────────────────────────────────────────

/// Mutable state of a running session, shared between the lifecycle loop
/// and the control-connection handlers. Critical sections are bounded: no
/// I/O ever happens under this lock.
struct SessionState {
    name: String,
    commit: String,
    arch: String,
    folder: String,
    token: String,
    pid: u32,
    started_at: DateTime<Utc>,
    leases: HashMap<String, LeaseSlot>,
    restart_in_progress: bool,
}

type SharedState = Arc<Mutex<SessionState>>;

fn lock_state(state: &SharedState) -> std::sync::MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A granted lease. The handler task owns the connection; the slot carries
/// enough identity to displace the lease on reconnect.
#[derive(Clone)]
struct LeaseSlot {
    id: u64,
    cancel: CancellationToken,
}

impl LeaseSlot {
    fn new() -> Self {
        static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        }
    }
}

/// Asks the lifecycle loop to swap the server to another commit.
struct RestartRequest {
    commit: String,
    respond: oneshot::Sender<Result<()>>,
}

struct SessionCleanup {
    store: SessionStore,
    name: String,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        info!(name = %self.name, "cleaning up session");
        if let Err(e) = self.store.remove(&self.name) {
            error!(name = %self.name, error = %e, "cleanup failed");
        }
    }
}

// ── Control socket ───────────────────────────────────────────────────────────

async fn accept_ctl_connections(
    listener: UnixListener,
    state: SharedState,
    restart_tx: mpsc::Sender<RestartRequest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    tokio::spawn(handle_ctl_connection(stream, state.clone(), restart_tx.clone()));
                }
                Err(e) => {
                    error!(error = %e, "accept on control socket");
                    // Brief pause so a persistent accept failure does not
                    // spin the loop.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Dispatch one control connection: read the request line under the
/// 5-second deadline, then answer INFO or run the CONNECT state machine.
async fn handle_ctl_connection(
    stream: UnixStream,
    state: SharedState,
    restart_tx: mpsc::Sender<RestartRequest>,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match timeout(CTL_REQUEST_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {}
        // Timeout, read error, or EOF before a request: drop silently.
        _ => return,
    }
    let mut stream = reader.into_inner();

    match parse_request(&line) {
        Ok(CtlRequest::Info) => handle_info(stream, &state).await,
        Ok(CtlRequest::Connect { commit, client_id }) => {
            handle_connect(stream, state, restart_tx, commit, client_id).await;
        }
        Err(reject) => {
            let _ = stream.write_all(reject.response_line().as_bytes()).await;
        }
    }
}

/// Answer `CTAP1 INFO` with one JSON line snapshotted under the lock.
async fn handle_info(mut stream: UnixStream, state: &SharedState) {
    let info = {
        let st = lock_state(state);
        SessionInfo {
            name: st.name.clone(),
            commit: st.commit.clone(),
            arch: st.arch.clone(),
            folder: st.folder.clone(),
            pid: st.pid,
            started_at: st.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    };
    let Ok(mut line) = serde_json::to_string(&info) else { return };
    line.push('\n');
    let _ = stream.write_all(line.as_bytes()).await;
}

/// Outcome of the locked portion of the CONNECT state machine.
enum ConnectDecision {
    Grant { token: String, lease: LeaseSlot },
    Reject(String),
    Restart { current_commit: String },
}

/// The CONNECT state machine.
///
/// A same-version CONNECT becomes a lease immediately. A different-version
/// CONNECT is the version-switch path: allowed only when no other client
/// holds a lease and no restart is already in flight.
async fn handle_connect(
    mut stream: UnixStream,
    state: SharedState,
    restart_tx: mpsc::Sender<RestartRequest>,
    commit: String,
    client_id: String,
) {
    let decision = {
        let mut st = lock_state(&state);

        // Reconnect with the same client_id displaces the previous lease.
        if let Some(old) = st.leases.remove(&client_id) {
            old.cancel.cancel();
        }

        if commit == st.commit {
            let lease = LeaseSlot::new();
            st.leases.insert(client_id.clone(), lease.clone());
            ConnectDecision::Grant { token: st.token.clone(), lease }
        } else {
            let conflicting = st.leases.keys().filter(|id| *id != &client_id).count();
            if conflicting > 0 {
                ConnectDecision::Reject(format!(
                    "ERR version mismatch: {} running, {} client(s) connected\n",
                    st.commit, conflicting
                ))
            } else if st.restart_in_progress {
                ConnectDecision::Reject("ERR restart already in progress\n".to_string())
            } else {
                st.restart_in_progress = true;
                ConnectDecision::Restart { current_commit: st.commit.clone() }
            }
        }
    };

    match decision {
        ConnectDecision::Grant { token, lease } => {
            grant_lease(stream, state, client_id, commit, token, lease).await;
        }
        ConnectDecision::Reject(response) => {
            let _ = stream.write_all(response.as_bytes()).await;
        }
        ConnectDecision::Restart { current_commit } => {
            info!(from = %current_commit, to = %commit, client = %client_id, "restart requested");

            let (respond_tx, respond_rx) = oneshot::channel();
            let request = RestartRequest { commit: commit.clone(), respond: respond_tx };
            if restart_tx.send(request).await.is_err() {
                lock_state(&state).restart_in_progress = false;
                let _ = stream
                    .write_all(b"ERR restart failed: session is shutting down\n")
                    .await;
                return;
            }

            let outcome = respond_rx
                .await
                .unwrap_or_else(|_| Err(anyhow!("session ended during restart")));

            let granted = {
                let mut st = lock_state(&state);
                st.restart_in_progress = false;
                match outcome {
                    Ok(()) => {
                        let lease = LeaseSlot::new();
                        st.leases.insert(client_id.clone(), lease.clone());
                        Ok((st.token.clone(), lease))
                    }
                    Err(e) => Err(format!("ERR restart failed: {e:#}\n")),
                }
            };

            match granted {
                Ok((token, lease)) => {
                    grant_lease(stream, state, client_id, commit, token, lease).await;
                }
                Err(response) => {
                    let _ = stream.write_all(response.as_bytes()).await;
                }
            }
        }
    }
}

/// Send `OK <token>` and hold the connection as the client's lease until it
/// closes or a reconnect displaces it.
async fn grant_lease(
    mut stream: UnixStream,
    state: SharedState,
    client_id: String,
    commit: String,
    token: String,
    lease: LeaseSlot,
) {
    let response = format!("OK {token}\n");
    let _ = stream.write_all(response.as_bytes()).await;
    info!(client = %client_id, commit = %commit, "lease granted");
    monitor_lease(stream, state, client_id, lease).await;
}

/// Block on the lease connection. Any activity (EOF, error, even a stray
/// byte) or displacement releases the lease. The table entry is removed
/// only while it still refers to this lease, so a replace-on-reconnect
/// never evicts its successor.
async fn monitor_lease(mut stream: UnixStream, state: SharedState, client_id: String, lease: LeaseSlot) {
    let mut buf = [0u8; 1];
    tokio::select! {
        _ = lease.cancel.cancelled() => {}
        _ = stream.read(&mut buf) => {}
    }

    let mut st = lock_state(&state);
    if st.leases.get(&client_id).map(|slot| slot.id) == Some(lease.id) {
        st.leases.remove(&client_id);
        info!(client = %client_id, "lease released");
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Read the INIT frame that opens a host-driven stdio session. The payload
/// is the commit hex, possibly empty.
async fn read_init_commit<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let frame = read_frame(r).await.context("read init frame")?;
    if frame.kind != FrameKind::Init {
        bail!(
            "expected INIT frame (0x{:02x}), got 0x{:02x}",
            FrameKind::Init as u8,
            frame.kind as u8
        );
    }
    Ok(String::from_utf8_lossy(&frame.payload).to_string())
}

/// Poll for the server's data socket to appear: 100 attempts, 100ms apart.
async fn wait_for_socket(path: &Path) -> Result<()> {
    for _ in 0..100 {
        if path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("timeout waiting for socket {}", path.display())
}
