//! codetap - VS Code Server sessions for containers and remote machines.

use clap::Parser;
use codetap::commands::Cli;

#[tokio::main]
async fn main() {
    codetap_core::logging::init();

    let cli = Cli::parse();
    if let Err(e) = cli.execute().await {
        eprintln!("codetap: {e:#}");
        std::process::exit(1);
    }
}
