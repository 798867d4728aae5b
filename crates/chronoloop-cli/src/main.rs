//! Chronoloop CLI - The `chronoloop` command.
//!
//! Small drivers around `chronoloop-core`:
//!
//! - **timers**: schedule media-time timers on a live clock and watch them fire
//! - **jitter**: feed a simulated clock noisy anchor updates
//! - **config**: print the effective configuration

mod jitter;
mod timers;

use anyhow::{Context, Result};
use chronoloop_core::Config;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Chronoloop - loopers and media clocks
#[derive(Parser, Debug)]
#[command(name = "chronoloop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive chronoloop loopers and media clocks", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule timers at media-time offsets and report when they fire
    Timers(timers::TimersArgs),

    /// Simulate noisy anchor updates and report how they were handled
    Jitter(jitter::JitterArgs),

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Timers(timers_args) => timers::run(&config, timers_args),
        Commands::Jitter(jitter_args) => {
            let report = jitter::run(&config, &jitter_args)?;
            println!("{}", report);
            Ok(())
        }
        Commands::Config => {
            let text = config
                .to_toml_string()
                .context("Failed to serialize configuration")?;
            print!("{}", text);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            log::info!("Loading config from {}", path.display());
            Config::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_timers_command() {
        let args = Args::try_parse_from([
            "chronoloop",
            "timers",
            "250ms",
            "1s",
            "--rate",
            "2",
            "--config",
            "clock.toml",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("clock.toml")));
        match args.command {
            Commands::Timers(timers) => {
                assert_eq!(
                    timers.offsets,
                    vec![Duration::from_millis(250), Duration::from_secs(1)]
                );
                assert_eq!(timers.rate, 2.0);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_timers_requires_offsets() {
        assert!(Args::try_parse_from(["chronoloop", "timers"]).is_err());
    }

    #[test]
    fn test_default_config_without_path() {
        assert_eq!(load_config(None).unwrap(), Config::default());
        assert!(load_config(Some(Path::new("/nonexistent/chronoloop.toml"))).is_err());
    }
}
