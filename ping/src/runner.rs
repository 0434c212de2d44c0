use std::{future::Future, io, io::Write, net::IpAddr, time::Duration};

use anyhow::Result;
use common::{LossSnapshot, LossStatistics};
use tracing::info;

use crate::{
    probe::{ProbeOutcome, Prober},
    session::Connector,
};

/// Column header, printed once before the first probe
pub fn header(target: &str) -> String {
    format!("\n{:>30} {:>25}  {:>20}", target, "RTT", "Packet Loss")
}

/// One report line per probe cycle
pub fn cycle_line(
    target: &IpAddr,
    outcome: &ProbeOutcome,
    snapshot: &LossSnapshot,
) -> String {
    let result = match outcome {
        ProbeOutcome::Success { rtt } => format!("{:?}", rtt),
        ProbeOutcome::Failure(e) => e.to_string(),
    };
    format!(
        "{:>30}: {:>30}  {:>10.2}%",
        target.to_string(),
        result,
        snapshot.loss_percent
    )
}

pub fn write_summary<W: Write>(
    out: &mut W,
    snapshot: &LossSnapshot,
) -> io::Result<()> {
    writeln!(out, "\n !! Process Ping Interrupted !!")?;
    writeln!(out, "{}", snapshot)?;
    out.flush()
}

/// Probe until `shutdown` resolves, then return the final loss figures.
///
/// Each probe and each pause between probes is raced against `shutdown`. A
/// probe interrupted this way is neither counted nor printed. An error from
/// `shutdown` means the interrupt listener could not be set up and is
/// returned as is.
pub async fn run<C, W, S>(
    prober: &Prober<C>,
    stats: &LossStatistics,
    interval: Duration,
    out: &mut W,
    shutdown: S,
) -> Result<LossSnapshot>
where
    C: Connector,
    W: Write,
    S: Future<Output = io::Result<()>>,
{
    tokio::pin!(shutdown);
    let target = prober.target();

    loop {
        let outcome = tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            outcome = prober.probe() => outcome,
        };

        let snapshot = if outcome.is_success() {
            stats.record_success()
        } else {
            stats.record_failure()
        };
        writeln!(out, "{}", cycle_line(&target, &outcome, &snapshot))?;
        out.flush()?;

        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("interrupted, stopping");

    Ok(stats.snapshot())
}
