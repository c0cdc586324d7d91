type Result<T> = color_eyre::eyre::Result<T>;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use testbed::cli::{self, Cli};
use testbed::signals::Signals;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let default_level = if cli.global.debug { "testbed=debug" } else { "testbed=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Interrupts cancel the run; teardown then runs with its own token
    let cancel = CancellationToken::new();
    let _forwarder = Signals::new()?.cancel_on_interrupt(cancel.clone());

    debug!("testbed starting");
    cli::run(cli, cancel).await
}
