//! CLI command dispatch and execution.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use codetap_core::platform;
use codetap_core::store::SessionStore;
use codetap_core::token::RandomTokenGenerator;

use crate::provision::{HttpDownloader, TarExtractor};
use crate::runner::ProcessRunner;
use crate::service::Service;

mod clean;
mod list;
mod relay_cmd;
mod run;

/// codetap - VS Code Server sessions for containers and remote machines
#[derive(Parser, Debug)]
#[command(
    name = "codetap",
    version,
    about = "VS Code Server sessions for containers and remote machines",
    long_about = "Opens a remote project folder in a workstation editor without \
                  installing anything on the remote side beforehand. Sessions \
                  live as Unix socket pairs in the socket directory; the relay \
                  subcommand carries a remote session over any stdio transport."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a VS Code Server session
    Run(run::RunArgs),

    /// Relay a remote session over stdio (e.g. ssh, docker exec)
    Relay(relay_cmd::RelayArgs),

    /// List discovered sessions
    List(list::ListArgs),

    /// Remove stale sessions whose control sockets no longer answer
    Clean(clean::CleanArgs),
}

impl Cli {
    /// Execute the selected command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => run::execute(args).await,
            Commands::Relay(args) => relay_cmd::execute(args).await,
            Commands::List(args) => list::execute(args).await,
            Commands::Clean(args) => clean::execute(args).await,
        }
    }
}

/// Wire the production collaborators into a [`Service`] rooted at the given
/// socket directory.
fn build_service(socket_dir: PathBuf) -> Result<Service> {
    let cache_dir = platform::cache_dir()?;
    let repository_dir = platform::repository_dir()?;
    let extractor = Arc::new(TarExtractor::new(repository_dir));

    Ok(Service::new(
        Arc::new(HttpDownloader::new(cache_dir)),
        extractor.clone(),
        extractor,
        Arc::new(ProcessRunner),
        SessionStore::new(socket_dir),
        Arc::new(RandomTokenGenerator),
    ))
}
