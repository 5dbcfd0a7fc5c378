use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use surge_load::{cli, report};

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing(args.verbose);

    let json = args.json;
    let config = cli::build_config(args)?;

    println!("starting benchmark...");
    let summary = surge_load::run(config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        report::print_report(&summary);
    }
    Ok(())
}
