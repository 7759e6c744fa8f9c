mod args;
mod cmd_backend;
mod cmd_completions;
mod cmd_family;

use args::{Cli, Commands};
use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    procfamily::logging::init(None)?;

    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => cmd_completions::cmd_completions(*shell),
        Commands::Backend => cmd_backend::cmd_backend(cli.json)?,
        _ => cmd_family::cmd_family(&cli).await?,
    }

    Ok(())
}
