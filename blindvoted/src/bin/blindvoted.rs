//! blindvoted binary
//!
//! Initializes tracing, validates the configuration from command-line arguments or `BLINDVOTED_*`
//! environment variables, and runs the batch engines until ctrl-c.

use std::process::ExitCode;

use blindvoted::config::Config;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let config = Config::parse();
    if let Err(err) = config.validate() {
        tracing::error!("invalid configuration: {err}");
        return Ok(ExitCode::FAILURE);
    }

    match blindvoted::start(config, blindvoted::default_shutdown_signal()).await {
        Ok(()) => {
            tracing::info!("good night!");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            // already carries the full chain, don't let eyre print it again
            tracing::error!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}
