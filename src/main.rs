//! taskherd CLI entry point.

use clap::Parser;

use taskherd::cli::{Cli, Commands};
use taskherd::infrastructure::config::ConfigLoader;
use taskherd::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // A broken config file is reported by the command itself; log with defaults meanwhile.
    let log_config = ConfigLoader::load()
        .map(|config| LogConfig::from(&config.logging))
        .unwrap_or_default();
    let _logger = match LoggerImpl::init(&log_config) {
        Ok(logger) => Some(logger),
        Err(err) => {
            eprintln!("Failed to initialize logging: {err:#}");
            None
        }
    };

    let result = match cli.command {
        Commands::Config(args) => taskherd::cli::commands::config::execute(args, cli.json).await,
        Commands::Simulate(args) => {
            taskherd::cli::commands::simulate::execute(args, cli.json).await
        }
    };

    if let Err(err) = result {
        taskherd::cli::handle_error(err, cli.json);
    }
}
