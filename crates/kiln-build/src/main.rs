//! Kiln CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kiln_build::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let directive = if cli.debug { "kiln=debug" } else { "kiln=info" };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    cli.execute().await
}
