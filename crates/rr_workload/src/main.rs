//! Replication consistency workload.
//!
//! Spawns paired writers and readers: each writer counts its own key up on
//! the primary while its reader checks the replica after every write. Wrong
//! values and per-key totals are logged as they happen.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rr_toolkit::config::DEFAULT_KEY_PREFIX;
use rr_toolkit::events::{self, format_rate, Event};
use rr_toolkit::resp::RedisEndpoint;
use rr_toolkit::{run_probe, ProbeConfig, RespConnector};
use tokio_util::sync::CancellationToken;

/// CLI options for the probe.
#[derive(Parser, Debug)]
#[command(name = "rr-replication")]
struct Args {
    /// Primary endpoint (RESP), `redis://...` or `host:port`.
    #[arg(long, env = "URL_M", default_value = "redis://127.0.0.1:6379")]
    write_url: String,

    /// Replica endpoint read after every write.
    #[arg(long, env = "URL_R", default_value = "redis://127.0.0.1:6380")]
    read_url: String,

    /// Number of concurrent writer/reader pairs (two connections each).
    #[arg(long, default_value_t = 100)]
    clients: usize,

    /// Writes per pair.
    #[arg(long, default_value_t = 1000)]
    operations: usize,

    /// Keys are generated as `{key_prefix}{client}`.
    #[arg(long, default_value = DEFAULT_KEY_PREFIX)]
    key_prefix: String,
}

#[tokio::main]
/// Parse CLI args, run the probe and print one line per event.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    let writer = RedisEndpoint::parse(&args.write_url).context("--write-url")?;
    let reader = RedisEndpoint::parse(&args.read_url).context("--read-url")?;
    tracing::debug!(%writer, %reader, clients = args.clients, operations = args.operations, "starting probe");

    let config = ProbeConfig {
        clients: args.clients,
        operations: args.operations,
        key_prefix: args.key_prefix,
    };

    let (events, reporter) = events::channel();
    let printing = tokio::spawn(reporter.run(|record| match &record.event {
        Event::WrongValue { key, got, expected } => println!(
            "wrong value for {key}: got {}, expected {expected}",
            got.as_deref().unwrap_or("(nil)")
        ),
        Event::Done {
            key,
            total_reads,
            stale_reads,
            error_rate,
        } => println!(
            "{key} done: {stale_reads}/{total_reads} stale reads, error rate {}",
            format_rate(*error_rate)
        ),
        _ => {}
    }));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = run_probe(
        &config,
        Arc::new(RespConnector::new(writer)),
        Arc::new(RespConnector::new(reader)),
        events,
        &cancel,
    )
    .await;
    printing.await.context("reporter task panicked")?;

    let summaries = result.context("replication probe")?;
    println!("{} clients all done", summaries.len());
    Ok(())
}
