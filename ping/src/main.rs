use std::io::{self, Write};

use anyhow::Result;
use clap::Parser;
use common::LossStatistics;
use tokio::signal;
use tracing::{info, Level};

mod args;
mod error;
mod icmp;
mod probe;
mod runner;
mod session;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let opts = args::Opts::parse();
    init_logging(opts.verbose);

    let Some(target) = opts.target.as_deref() else {
        println!(
            "Hostname not provided.! Please provide a hostname as an argument"
        );
        std::process::exit(1);
    };
    let config = args::Config::from(&opts);

    let dst = probe::resolve_target(target).await?;
    let prober = probe::Prober::new(session::RawConnector, dst, config.clone());
    info!(
        %dst,
        family = %prober.family(),
        identifier = config.identifier,
        "starting"
    );

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", runner::header(target))?;

    let stats = LossStatistics::new();
    let snapshot = runner::run(
        &prober,
        &stats,
        config.interval,
        &mut stdout,
        signal::ctrl_c(),
    )
    .await?;
    runner::write_summary(&mut stdout, &snapshot)?;

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // stdout is reserved for the report
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}
