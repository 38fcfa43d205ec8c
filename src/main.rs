//! apply-forge CLI entry point.
//!
//! Sets up logging on stderr, leaving stdout to reports, then hands off to
//! the CLI module and exits with its status code.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = apply_forge::cli::parse_cli();

    // RUST_LOG wins over --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let code = apply_forge::cli::run_with_cli(cli).await?;
    std::process::exit(code);
}
