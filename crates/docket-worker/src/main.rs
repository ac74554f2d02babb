//! # Docket Worker
//!
//! Entry point for the worker daemon and operator commands.

use clap::Parser;
use docket_config::ConfigLoader;
use docket_worker::startup::{init_logging, print_startup_info};
use docket_worker::{App, Cli, Command};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loader = match ConfigLoader::new(cli.config.clone()) {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    let config = loader.get().await;

    init_logging(&config.observability);
    if matches!(cli.command, Command::Work(_)) {
        print_startup_info(&config);
    }
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let status = match run(cli, config).await {
        Ok(status) => status,
        Err(e) => {
            error!("Application error: {e:#}");
            1
        }
    };
    std::process::exit(status);
}

async fn run(cli: Cli, config: docket_config::AppConfig) -> anyhow::Result<i32> {
    let app = App::bootstrap(config).await?.with_config_dir(cli.config);
    let mut stdout = std::io::stdout();
    app.run(&cli.command, &mut stdout).await
}
