//! Command-line interface for taskherd.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::config::ConfigArgs;
use commands::simulate::SimulateArgs;

#[derive(Parser, Debug)]
#[command(name = "taskherd")]
#[command(about = "taskherd - background task orchestration engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and validate configuration
    Config(ConfigArgs),

    /// Run a batch of tasks against the in-memory mock backend
    Simulate(SimulateArgs),
}

/// Report a command failure and exit non-zero.
pub fn handle_error(err: anyhow::Error, json: bool) -> ! {
    if json {
        let body = serde_json::json!({ "error": format!("{err:#}") });
        eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::parse_from([
            "taskherd", "--json", "simulate", "--tasks", "4", "--agent", "oracle", "--limit", "2",
        ]);
        assert!(cli.json);
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.tasks, 4);
                assert_eq!(args.agent, "oracle");
                assert_eq!(args.limit, Some(2));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
