//! bpforge CLI: expand and validate deployment blueprints.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "bpforge",
    version,
    about = "Blueprint expansion and validation: module wiring, reference checks, preflight"
)]
struct Cli {
    #[command(subcommand)]
    command: bpforge::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = bpforge::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
