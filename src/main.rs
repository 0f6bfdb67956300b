use anyhow::Result;
use clap::Parser;

use proxygate::{cli::Cli, logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log)?;
    if cli.check {
        let services = settings.load_services()?;
        tracing::info!(services = services.len(), "configuration is valid");
        return Ok(());
    }
    run(settings).await
}
