//! Stdio-mode session tests: the INIT handshake and host-driven commit
//! resolution, driven through in-memory pipes and mock collaborators.
//!
//! These are serialized because a stdio session binds its temp data socket
//! at a path derived from the process id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use codetap::provision::{Downloader, Extractor, Provisioner};
use codetap::runner::{ServerExit, ServerHandle, ServerRunner};
use codetap::service::{Service, SessionConfig};
use codetap_core::frame::{read_frame, write_frame, Frame, FrameKind};
use codetap_core::store::SessionStore;
use codetap_core::token::TokenGenerator;
use serial_test::serial;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const COMMIT_D: &str = "dddddddddddddddddddddddddddddddddddddddd";

struct NoDownloader;

#[async_trait]
impl Downloader for NoDownloader {
    async fn download(&self, _commit: &str, _arch: &str) -> Result<PathBuf> {
        bail!("download must not run in these tests");
    }
}

struct NoExtractor;

#[async_trait]
impl Extractor for NoExtractor {
    async fn extract(&self, _tarball: &Path, _target_dir: &Path) -> Result<()> {
        bail!("extract must not run in these tests");
    }
}

struct AlwaysProvisioned;

impl Provisioner for AlwaysProvisioned {
    fn is_provisioned(&self, _commit: &str) -> bool {
        true
    }

    fn server_bin_path(&self, commit: &str) -> PathBuf {
        PathBuf::from("/repo").join(commit).join("bin/code-server")
    }

    fn server_dir(&self, commit: &str) -> PathBuf {
        PathBuf::from("/repo").join(commit)
    }
}

struct FixedToken;

impl TokenGenerator for FixedToken {
    fn generate(&self) -> Result<String> {
        Ok("unused".to_string())
    }
}

/// Records the commits it was started for; the fake server runs until the
/// relay side stops it.
#[derive(Default)]
struct RecordingRunner {
    started: Mutex<Vec<(PathBuf, Option<String>)>>,
}

#[async_trait]
impl ServerRunner for RecordingRunner {
    async fn start(&self, bin: &Path, socket: &Path, token: Option<&str>) -> Result<ServerHandle> {
        std::fs::write(socket, b"")?;
        self.started
            .lock()
            .unwrap()
            .push((bin.to_path_buf(), token.map(str::to_string)));

        let stop = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel::<Result<(), ServerExit>>();
        let stop_wait = stop.clone();
        tokio::spawn(async move {
            stop_wait.cancelled().await;
            let _ = exit_tx.send(Ok(()));
        });
        let stopper: Arc<dyn Fn() + Send + Sync> = Arc::new(move || stop.cancel());
        Ok(ServerHandle::from_parts(0, exit_rx, stopper))
    }
}

fn stdio_service(runner: Arc<RecordingRunner>, dir: &tempfile::TempDir) -> Service {
    Service::new(
        Arc::new(NoDownloader),
        Arc::new(NoExtractor),
        Arc::new(AlwaysProvisioned),
        runner,
        SessionStore::new(dir.path()),
        Arc::new(FixedToken),
    )
}

fn stdio_config(commit: &str) -> SessionConfig {
    SessionConfig {
        name: "stdio".to_string(),
        commit: commit.to_string(),
        arch: "x64".to_string(),
        folder: "/workspace".to_string(),
    }
}

#[tokio::test]
#[serial]
async fn stdio_acks_commit_from_init_frame() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let svc = stdio_service(runner.clone(), &dir);

    let (mut input, input_rx) = tokio::io::duplex(1 << 16);
    let (output_tx, mut output) = tokio::io::duplex(1 << 16);

    let session = tokio::spawn(async move {
        svc.run_stdio(stdio_config(""), input_rx, output_tx, || async {
            bail!("fallback must not run when the init frame carries a commit")
        })
        .await
    });

    write_frame(&mut input, &Frame::init(COMMIT_D.as_bytes().to_vec()))
        .await
        .unwrap();

    let ack = read_frame(&mut output).await.unwrap();
    assert_eq!(ack.kind, FrameKind::Init);
    assert_eq!(ack.payload, COMMIT_D.as_bytes());

    // The server was started for that commit, without a connection token.
    {
        let started = runner.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(
            started[0].0,
            PathBuf::from(format!("/repo/{COMMIT_D}/bin/code-server"))
        );
        assert_eq!(started[0].1, None);
    }

    // Ending the frame stream ends the session cleanly.
    drop(input);
    session.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn stdio_empty_init_uses_fallback_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let svc = stdio_service(runner.clone(), &dir);

    let (mut input, input_rx) = tokio::io::duplex(1 << 16);
    let (output_tx, mut output) = tokio::io::duplex(1 << 16);

    let session = tokio::spawn(async move {
        svc.run_stdio(stdio_config(""), input_rx, output_tx, || async {
            Ok(COMMIT_D.to_string())
        })
        .await
    });

    write_frame(&mut input, &Frame::init(Vec::new())).await.unwrap();

    let ack = read_frame(&mut output).await.unwrap();
    assert_eq!(ack.payload, COMMIT_D.as_bytes());

    drop(input);
    session.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn stdio_fails_when_no_commit_available() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let svc = stdio_service(runner.clone(), &dir);

    let (mut input, input_rx) = tokio::io::duplex(1 << 16);
    let (output_tx, _output) = tokio::io::duplex(1 << 16);

    let session = tokio::spawn(async move {
        svc.run_stdio(stdio_config(""), input_rx, output_tx, || async { Ok(String::new()) })
            .await
    });

    write_frame(&mut input, &Frame::init(Vec::new())).await.unwrap();

    let err = session.await.unwrap().unwrap_err();
    assert!(
        format!("{err:#}").contains("no commit available"),
        "got {err:#}"
    );
    assert!(runner.started.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn stdio_prebaked_commit_skips_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let svc = stdio_service(runner.clone(), &dir);

    let (input, input_rx) = tokio::io::duplex(1 << 16);
    let (output_tx, mut output) = tokio::io::duplex(1 << 16);

    let session = tokio::spawn(async move {
        svc.run_stdio(stdio_config(COMMIT_D), input_rx, output_tx, || async {
            bail!("fallback must not run with a pre-baked commit")
        })
        .await
    });

    // No INIT is read and no ack is written: the stream just ends.
    drop(input);
    session.await.unwrap().unwrap();
    assert!(read_frame(&mut output).await.is_err());
    assert_eq!(runner.started.lock().unwrap().len(), 1);
}
