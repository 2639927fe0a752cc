use std::{collections::BTreeSet, process::ExitCode, time::Duration};

use clap::{command, Parser, ValueEnum};
use kube::Client;
use tracing::{error, info, warn};

mod error;
mod eso;
mod report;
mod track;

use error::Error;
use report::Report;
use track::{ConvergenceTracker, EmptySet, ResourceRef, StatusReader, SyncTrigger};

/// Forces a resync of ExternalSecrets and tracks the controller until every
/// one of them has completed a reconciliation attempt.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Only consider ExternalSecrets in this namespace.
    #[clap(long, short = 'n')]
    namespace: Option<String>,

    /// Only resync this ExternalSecret. Requires --namespace.
    #[clap(long, requires = "namespace")]
    name: Option<String>,

    /// Seconds to wait for every triggered resource to converge.
    #[clap(long, default_value_t = 120)]
    timeout: u64,

    /// Seconds between convergence polls.
    #[clap(long, default_value_t = 2)]
    interval: u64,

    /// Fire the resync triggers and exit immediately without tracking.
    #[clap(long)]
    no_wait: bool,

    /// How the final report is rendered.
    #[clap(long, value_enum, default_value_t = Output::Table)]
    output: Output,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Output {
    Table,
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<bool, Error> {
    let client = Client::try_default().await?;

    let resources =
        eso::discover(&client, args.namespace.as_deref(), args.name.as_deref()).await?;

    let started = std::time::Instant::now();

    let tracker = ConvergenceTracker::new(
        eso::EsoStatusReader::new(client.clone()),
        eso::ForceSyncTrigger::new(client),
    )
    .with_interval(Duration::from_secs(args.interval));

    let Some(report) = resync(
        &tracker,
        resources,
        Duration::from_secs(args.timeout),
        args.no_wait,
    )
    .await
    else {
        return Ok(true);
    };

    match args.output {
        Output::Table => print!("{report}"),
        Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    let counts = report.counts;
    info!(
        "resynced {total} externalsecrets in {elapsed:.1}s: {synced} synced, {failed} failed, {timed_out} timed out",
        total = counts.total,
        elapsed = started.elapsed().as_secs_f64(),
        synced = counts.synced,
        failed = counts.failed,
        timed_out = counts.timed_out,
    );

    Ok(report.all_synced())
}

/// Everything between discovery and rendering: baseline capture, trigger
/// fan-out and, unless `no_wait` is set, convergence tracking. Returns
/// `None` when there is nothing to report — an empty resource set, or a
/// `no_wait` run — both of which exit successfully.
async fn resync<R, T>(
    tracker: &ConvergenceTracker<R, T>,
    resources: BTreeSet<ResourceRef>,
    timeout: Duration,
    no_wait: bool,
) -> Option<Report>
where
    R: StatusReader,
    T: SyncTrigger,
{
    let mut session = match tracker.start_session(resources, timeout).await {
        Ok(session) => session,
        Err(EmptySet) => {
            info!("no externalsecrets matched the given filters, nothing to resync");
            return None;
        }
    };

    tracker.trigger(&mut session).await;
    info!("triggered resync of {} externalsecrets", session.len());

    if no_wait {
        info!("--no-wait set, not tracking convergence");
        return None;
    }

    tokio::select! {
        _ = tracker.poll_until_converged(&mut session) => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, reporting what has resolved so far");
        }
    }

    Some(report::render(&session))
}
