//! Duet simulator: one host and several clients editing shared documents
//! over delayed in-memory links, with the consistency watchdog running on
//! the host.
//!
//! Exits with a failure status when the clients do not confirm the host's
//! state in time, or when any client copy differs from the host's copy.

mod cli;
mod client;
mod host;
mod network;

use std::collections::{BTreeMap, HashMap};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use duet_collab::{ConsistencyWatchdog, DocPath, ExecutionGate, WatchdogConfig};
use log::{error, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use cli::Cli;
use client::{ClientReport, SimClient};
use host::{run_host, SimHost};
use network::DelayedLink;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let seed = cli.seed.unwrap_or_else(rand::random);
    info!("Starting Duet simulation with seed {seed}");

    let documents: BTreeMap<DocPath, String> = (0..cli.documents)
        .map(|i| (DocPath::new(format!("doc-{i}.txt")), format!("document {i}\n")))
        .collect();

    let host = Arc::new(SimHost::new(documents.clone()));
    let max_delay = Duration::from_millis(cli.max_delay_ms);
    let interval = Duration::from_millis(cli.checksum_interval_ms);

    let (up_tx, up_rx) = mpsc::unbounded_channel();
    let mut links = HashMap::new();
    let mut clients = Vec::new();
    for i in 0..cli.clients {
        let id = Uuid::new_v4();
        host.relay().add_client(id);

        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let base = seed.wrapping_add(3 * i as u64);
        links.insert(id, DelayedLink::spawn(down_tx, max_delay, base));
        let upstream = DelayedLink::spawn(up_tx.clone(), max_delay, base.wrapping_add(1));

        let client = SimClient::new(id, documents.clone(), upstream, base.wrapping_add(2));
        let corrupt_at = (cli.corrupt && i == 0).then_some(cli.edits / 2);
        clients.push((id, client, down_rx, corrupt_at));
    }
    drop(up_tx);

    let watchdog = ConsistencyWatchdog::new(WatchdogConfig {
        interval,
        disconnected_interval: interval * 3,
        initial_delay: interval,
        ..WatchdogConfig::default()
    });
    let gate = ExecutionGate::new();
    let checksums = watchdog.subscribe();
    if let Err(e) = watchdog.start(host.clone(), gate.subscribe()) {
        error!("Failed to start watchdog: {e}");
        return ExitCode::FAILURE;
    }

    let started = Instant::now();
    let pace = Duration::from_millis(cli.pace_ms);
    let tasks: Vec<_> = clients
        .into_iter()
        .map(|(id, client, down_rx, corrupt_at)| {
            let edits = cli.edits;
            tokio::spawn(async move { (id, client.run(down_rx, edits, pace, corrupt_at).await) })
        })
        .collect();

    let settle_timeout = Duration::from_millis(cli.settle_timeout_ms);
    let host_report = run_host(host.clone(), up_rx, links, checksums, settle_timeout).await;

    watchdog.stop().await;
    host.end();

    let mut reports: Vec<(Uuid, ClientReport)> = Vec::new();
    for joined in futures_util::future::join_all(tasks).await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!("Client task failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let canonical = host.documents();
    println!("Session finished in {:.2?} (seed {seed})", started.elapsed());
    println!(
        "Host: {} relayed, {} rejected, {} failed applies, {} resyncs, {} checksums sent, {} verdicts, {} watchdog cycles",
        host_report.relayed,
        host_report.rejected,
        host_report.failed_applies,
        host_report.resyncs,
        host_report.checksums_sent,
        host_report.verdicts,
        watchdog.cycles(),
    );

    let mut diverged = 0;
    for (id, report) in &reports {
        println!(
            "Client {id}: {} edits ({} skipped), {} applied, checksums {}/{}/{} consistent/deferred/inconsistent, {} resyncs",
            report.edits,
            report.skipped_edits,
            report.applied,
            report.consistent,
            report.deferred,
            report.inconsistent,
            report.resyncs,
        );
        for (path, content) in &canonical {
            if report.documents.get(path) != Some(content) {
                error!("Client {id} diverged on {path}");
                diverged += 1;
            }
        }
    }

    if diverged > 0 {
        println!("{diverged} diverged document copies");
        return ExitCode::FAILURE;
    }
    if !host_report.settled {
        println!("Clients did not confirm the final state within {settle_timeout:?}");
        return ExitCode::FAILURE;
    }
    println!("All {} clients converged on {} documents", reports.len(), canonical.len());
    ExitCode::SUCCESS
}
