mod cli;
mod server;

use bundlebox::config::Config;
use bundlebox::observability;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    observability::init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => server::run(args.address).await?,
        Commands::Config => {
            let config = Config::load()?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
