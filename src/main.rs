//! nspawnctl entry point.

use clap::Parser;
use log::debug;

mod cli;
mod config;
mod error;
mod fleet;
mod id;
mod ports;
mod prefs;
mod replicator;
mod runtime;
mod scheduler;
mod ssh;
mod store;
mod types;

use cli::Cli;
use config::Config;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();

    let result = match Config::load() {
        Ok(config) => {
            debug!("configuration: {:?}", config);
            cli.run(config).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(cli::exit_code(&e));
    }
}
