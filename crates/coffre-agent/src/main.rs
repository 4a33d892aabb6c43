use clap::Parser;
use tracing_subscriber::EnvFilter;

use coffre_agent::cli::{self, Cli};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("COFFRE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match cli::run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("coffre: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}
