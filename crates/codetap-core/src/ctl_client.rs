//! Client helpers for the CTAP1 control socket.
//!
//! Everything here is best-effort with tight deadlines: discovery probes a
//! directory full of sockets that may be stale, so a dead socket must cost
//! one second, not a hang. Only [`connect`] waits longer, because a version
//! switch on the far side may have to provision a server from scratch.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::control::SessionInfo;

/// Connect deadline for liveness probes and INFO queries.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Overall deadline for the INFO request/response exchange.
const INFO_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);
/// Deadline for a CONNECT response. Covers a provision-from-scratch restart
/// on the session side.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Whether something is accepting connections at `path`.
pub async fn is_socket_alive(path: &Path) -> bool {
    matches!(
        timeout(PROBE_CONNECT_TIMEOUT, UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}

/// Send `CTAP1 INFO` to the control socket at `ctl_path` and parse the JSON
/// response. Returns `None` on any failure: the session is reported dead.
pub async fn query_info(ctl_path: &Path) -> Option<SessionInfo> {
    let stream = match timeout(PROBE_CONNECT_TIMEOUT, UnixStream::connect(ctl_path)).await {
        Ok(Ok(stream)) => stream,
        _ => return None,
    };
    timeout(INFO_EXCHANGE_TIMEOUT, info_exchange(stream))
        .await
        .ok()
        .flatten()
}

async fn info_exchange(mut stream: UnixStream) -> Option<SessionInfo> {
    stream.write_all(b"CTAP1 INFO\n").await.ok()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    serde_json::from_str(line.trim()).ok()
}

/// An established lease on a session. Dropping the lease (its socket)
/// releases the client's claim on the running server version.
#[derive(Debug)]
pub struct Lease {
    /// Connection token for the data socket. Empty in relay mode.
    pub token: String,
    stream: UnixStream,
}

impl Lease {
    /// The underlying control connection. Kept open for the lease lifetime.
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Give up the token and take the raw connection, e.g. to watch for the
    /// session closing it.
    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

/// Send `CTAP1 CONNECT <commit> <client_id>` and wait for the verdict.
///
/// On `OK` the returned [`Lease`] holds the connection open; dropping it
/// ends the lease. `ERR` responses (version mismatch, restart already in
/// progress, restart failure) surface as errors carrying the reason.
pub async fn connect(ctl_path: &Path, commit: &str, client_id: &str) -> Result<Lease> {
    let mut stream = UnixStream::connect(ctl_path)
        .await
        .with_context(|| format!("connect to control socket {}", ctl_path.display()))?;

    let request = format!("CTAP1 CONNECT {commit} {client_id}\n");
    stream
        .write_all(request.as_bytes())
        .await
        .context("write CONNECT request")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    timeout(CONNECT_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("CONNECT timed out")?
        .context("read CONNECT response")?;

    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix("OK") {
        return Ok(Lease {
            token: rest.trim_start().to_string(),
            stream: reader.into_inner(),
        });
    }
    if let Some(reason) = line.strip_prefix("ERR ") {
        bail!("session refused CONNECT: {reason}");
    }
    bail!("unexpected CONNECT response {line:?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_info_on_missing_socket_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost.ctl.sock");
        assert!(query_info(&path).await.is_none());
        assert!(!is_socket_alive(&path).await);
    }

    #[tokio::test]
    async fn query_info_on_stale_socket_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.ctl.sock");
        std::fs::write(&path, b"").unwrap();
        assert!(query_info(&path).await.is_none());
    }

    #[tokio::test]
    async fn query_info_parses_served_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.ctl.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(&mut stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "CTAP1 INFO\n");
            stream
                .write_all(
                    b"{\"name\":\"live\",\"commit\":\"abc\",\"arch\":\"x64\",\
                      \"folder\":\"/ws\",\"pid\":7,\"started_at\":\"2026-08-02T10:15:00Z\"}\n",
                )
                .await
                .unwrap();
        });

        let info = query_info(&path).await.expect("info");
        assert_eq!(info.name, "live");
        assert_eq!(info.pid, 7);
        assert!(is_socket_alive(&path).await);
    }

    #[tokio::test]
    async fn connect_surfaces_err_responses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.ctl.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(&mut stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            stream
                .write_all(b"ERR restart already in progress\n")
                .await
                .unwrap();
        });

        let err = connect(&path, &"a".repeat(40), "c1").await.unwrap_err();
        assert!(err.to_string().contains("restart already in progress"));
    }
}
