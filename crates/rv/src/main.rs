mod cli;
mod commands;
mod shutdown;

use clap::Parser as _;
use tracing_subscriber::EnvFilter;

use rv_core::error::RvError;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("RV_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match commands::dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            // The remote job's own non-zero exit propagates verbatim;
            // everything else is 1.
            match err.downcast_ref::<RvError>() {
                Some(e) => e.exit_code(),
                None => 1,
            }
        }
    };
    std::process::exit(code);
}
