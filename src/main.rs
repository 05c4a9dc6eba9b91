//! Entry point: parse the command line, load config, set up logging,
//! run the requested command, and exit with its error code.

use clap::Parser;
use debtx::cli::{self, Cli};
use debtx::config::TxConfig;
use debtx::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match TxConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("could not load configuration: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = logging::init_logging(&config) {
        eprintln!("could not initialize logging: {}", err);
        std::process::exit(1);
    }

    let exit_code = cli::run(cli, config).await;
    std::process::exit(exit_code);
}
