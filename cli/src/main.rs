//! Kiln CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_cli::commands::{dispatch, Cli};
use kiln_core::{style, Reporter};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if cli.no_color {
        style::disable_color();
    }
    let reporter = Reporter::new(true, cli.no_timestamps);

    if let Err(e) = dispatch(cli, &reporter).await {
        reporter.error(e.to_string());
        std::process::exit(1);
    }
}
