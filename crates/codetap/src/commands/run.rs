//! `codetap run`: start a session, directly or in stdio relay mode.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use codetap_core::platform;
use tracing::info;

use crate::provision::resolve::{probe_code_cli, CommitResolver};
use crate::service::SessionConfig;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Session name (default: hostname)
    #[arg(long)]
    name: Option<String>,

    /// Version, commit hash, or "latest" (auto-resolved if omitted)
    #[arg(long)]
    commit: Option<String>,

    /// Workspace folder path (default: current directory)
    #[arg(long)]
    folder: Option<PathBuf>,

    /// Socket directory (default: /dev/shm/codetap)
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Relay traffic over stdin/stdout instead of a host socket
    #[arg(long)]
    stdio: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let arch = platform::detect_arch()?;

    // Commit chain: flag, env, ~/.codetap/.commit, local code CLI, latest.
    let raw_commit = platform::resolve_commit_input(args.commit.as_deref())?;
    let resolver = CommitResolver::new(arch);
    let mut commit = resolver.resolve(&raw_commit).await?;

    if commit.is_empty() {
        if let Some(probed) = probe_code_cli().await {
            info!(commit = %&probed[..12], "detected commit from local VS Code");
            commit = probed;
        }
    }

    if commit.is_empty() && !args.stdio {
        // Stdio mode defers to the init handshake instead of the network.
        info!("no commit specified, fetching latest stable");
        commit = resolver.resolve("latest").await.context(
            "auto-resolve commit failed; to run offline, provide --commit, set \
             CODETAP_COMMIT, or write a value to ~/.codetap/.commit",
        )?;
        info!(commit = %&commit[..12], "resolved latest stable");
    }

    let name = args.name.unwrap_or_else(platform::default_session_name);
    let folder = match args.folder {
        Some(folder) => folder,
        None => std::env::current_dir().unwrap_or_default(),
    };
    let socket_dir = platform::resolve_socket_dir(args.socket_dir.as_deref());

    let service = super::build_service(socket_dir)?;
    let cfg = SessionConfig {
        name,
        commit,
        arch: arch.to_string(),
        folder: folder.display().to_string(),
    };

    if args.stdio {
        let fallback_resolver = CommitResolver::new(arch);
        let fallback = move || async move {
            info!("no commit from relay, fetching latest stable");
            let commit = fallback_resolver
                .resolve("latest")
                .await
                .context("auto-resolve commit")?;
            info!(commit = %&commit[..12], "resolved latest stable");
            Ok(commit)
        };
        service
            .run_stdio(cfg, tokio::io::stdin(), tokio::io::stdout(), fallback)
            .await
    } else {
        service.run(cfg).await
    }
}
