//! `codetap clean`: remove sessions whose control sockets are dead.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use codetap_core::platform;

#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Socket directory (default: /dev/shm/codetap)
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

pub async fn execute(args: CleanArgs) -> Result<()> {
    let socket_dir = platform::resolve_socket_dir(args.socket_dir.as_deref());
    let service = super::build_service(socket_dir)?;
    service.clean().await
}
