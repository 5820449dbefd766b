//! `rr`: inspect a sentinel-managed Redis deployment, run failover drills
//! against its Kubernetes pods and probe replica consistency.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use rr_toolkit::config::{DEFAULT_CLUSTER, DEFAULT_KEY_PREFIX};
use rr_toolkit::events::{self, Reporter};
use rr_toolkit::k8s::{self, KubePods};
use rr_toolkit::printer::{OutputFormat, Record};
use rr_toolkit::resp::RedisEndpoint;
use rr_toolkit::sentinel::{self, Coordinator};
use rr_toolkit::{
    run_failover_drill, run_probe, DrillConfig, DrillError, OutputConfig, ProbeConfig,
    RespConnector, SentinelConfig,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rr")]
#[command(about = "Resiliency checks for Redis sentinel deployments on Kubernetes", long_about = None)]
struct Args {
    /// Log debug diagnostics and render debug events.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Pretty-print JSON output.
    #[arg(short, long, global = true)]
    pretty: bool,

    /// Output format.
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    output: OutputFormat,

    /// Kubeconfig to use instead of in-cluster or default discovery.
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace of the Redis pods. Defaults to the kubeconfig context's.
    #[arg(long, global = true, env = "NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query and exercise the sentinel coordinator.
    Sentinel(SentinelArgs),
    /// Measure stale reads between a primary and a replica.
    Replication(ReplicationArgs),
    /// Print the version.
    Version,
}

#[derive(clap::Args)]
struct SentinelArgs {
    /// Sentinel URL, `redis://[user][:password@]host[:port][/db]` or `host:port`.
    #[arg(long, env = "RR_SENTINEL_URL", default_value = "redis://127.0.0.1:26379")]
    sentinel: String,

    /// Name of the monitored cluster.
    #[arg(long, env = "RR_SENTINEL_MASTER", default_value = DEFAULT_CLUSTER)]
    master: String,

    /// Bound on `wait` and `kill`.
    #[arg(short, long, default_value = "60s")]
    timeout: humantime::Duration,

    #[command(subcommand)]
    command: SentinelCommand,
}

#[derive(Subcommand)]
enum SentinelCommand {
    /// Show the current primary.
    Status,
    /// Show the coordinator's view of the primary.
    Master,
    /// List replicas of the primary.
    Replicas,
    /// List the other sentinels monitoring the cluster.
    Sentinels,
    /// Ask the coordinator for a failover, then show the primary.
    Failover,
    /// Print coordinator notifications until interrupted.
    Watch {
        /// Channel pattern to subscribe to.
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Wait for the next promotion of the cluster.
    Wait,
    /// Kill the primary's pod until a replica is promoted.
    Kill {
        /// Pod to delete. Derived from the primary's host name when unset.
        #[arg(long)]
        pod: Option<String>,

        /// Grace period for each delete.
        #[arg(long, default_value = "0s")]
        grace: humantime::Duration,
    },
}

#[derive(clap::Args)]
struct ReplicationArgs {
    /// Primary to write to.
    #[arg(long, env = "URL_M", default_value = "redis://127.0.0.1:6379")]
    write_url: String,

    /// Replica to read from.
    #[arg(long, env = "URL_R", default_value = "redis://127.0.0.1:6380")]
    read_url: String,

    /// Number of writer/reader pairs.
    #[arg(long, default_value_t = 100)]
    clients: usize,

    /// Writes per pair.
    #[arg(long, default_value_t = 1000)]
    operations: usize,

    /// Keys are `{key_prefix}{client}`.
    #[arg(long, default_value = DEFAULT_KEY_PREFIX)]
    key_prefix: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // Diagnostics go to stderr; records own stdout.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let fallback = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();

    let output = OutputConfig {
        format: args.output,
        pretty: args.pretty,
        verbose: args.verbose,
    };
    match args.command {
        Command::Sentinel(sentinel) => {
            let cluster = SentinelConfig::parse(&sentinel.sentinel, sentinel.master.as_str())
                .context("sentinel configuration")?;
            let timeout: Duration = sentinel.timeout.into();
            match sentinel.command {
                SentinelCommand::Status => status(&cluster, output).await,
                SentinelCommand::Master => {
                    let master = cluster.client().master(&cluster.cluster_name).await?;
                    print(
                        output,
                        &[master],
                        &["name", "quorum", "config-epoch", "num-slaves", "port", "ip"],
                    )
                }
                SentinelCommand::Replicas => {
                    let replicas = cluster.client().replicas(&cluster.cluster_name).await?;
                    print(
                        output,
                        &replicas,
                        &[
                            "name",
                            "ip",
                            "port",
                            "flags",
                            "master-link-status",
                            "slave-repl-offset",
                        ],
                    )
                }
                SentinelCommand::Sentinels => {
                    let sentinels = cluster.client().sentinels(&cluster.cluster_name).await?;
                    print(output, &sentinels, &["name", "ip", "port", "flags"])
                }
                SentinelCommand::Failover => {
                    let reply = cluster.client().failover(&cluster.cluster_name).await?;
                    print(output, &[record(&[("result", reply)])], &["result"])?;
                    status(&cluster, output).await
                }
                SentinelCommand::Watch { pattern } => watch(&cluster, &pattern, output).await,
                SentinelCommand::Wait => wait(&cluster, timeout, output).await,
                SentinelCommand::Kill { pod, grace } => {
                    let namespace = args.namespace.clone();
                    kill(
                        &cluster,
                        KillArgs {
                            pod,
                            grace: grace.into(),
                            timeout,
                            kubeconfig: args.kubeconfig.clone(),
                            namespace,
                        },
                        output,
                    )
                    .await
                }
            }
        }
        Command::Replication(replication) => replicate(replication, output).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn record(pairs: &[(&str, String)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn print(output: OutputConfig, records: &[Record], columns: &[&str]) -> anyhow::Result<()> {
    output
        .printer()
        .print(records, columns)
        .context("write output")
}

/// Cancel the returned token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; stopping");
            trigger.cancel();
        }
    });
    token
}

/// Render events as they arrive, one record per line.
fn spawn_reporter(reporter: Reporter, output: OutputConfig) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        let mut printer = output.printer().itemise(true).skip_headers(true);
        let mut written = Ok(());
        reporter
            .include_debug(output.verbose)
            .run(|record| {
                if written.is_ok() {
                    written = printer.print(&[record.to_record()], &record.columns());
                }
            })
            .await;
        written
    })
}

async fn status(cluster: &SentinelConfig, output: OutputConfig) -> anyhow::Result<()> {
    let primary = cluster
        .client()
        .query_primary(&cluster.cluster_name)
        .await
        .context("query primary")?;
    print(
        output,
        &[record(&[
            ("host", primary.host),
            ("port", primary.port.to_string()),
        ])],
        &["host", "port"],
    )
}

async fn watch(cluster: &SentinelConfig, pattern: &str, output: OutputConfig) -> anyhow::Result<()> {
    let mut messages = cluster
        .client()
        .subscribe(pattern)
        .await
        .with_context(|| format!("subscribe to {pattern}"))?;
    let cancel = cancel_on_interrupt();
    let mut printer = output.printer().itemise(true).skip_headers(true);
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = messages.next() => message,
        };
        let Some(message) = message else {
            anyhow::bail!("sentinel closed the subscription");
        };
        let message = message?;
        printer
            .print(
                &[record(&[("ch", message.channel), ("msg", message.payload)])],
                &["ch", "msg"],
            )
            .context("write output")?;
    }
}

async fn wait(cluster: &SentinelConfig, timeout: Duration, output: OutputConfig) -> anyhow::Result<()> {
    let client = cluster.client();
    let cancel = cancel_on_interrupt();
    let promotion = tokio::time::timeout(
        timeout,
        sentinel::wait_for_promotion(&client, &cluster.cluster_name, &cancel),
    )
    .await
    .map_err(|_| DrillError::Timeout { after: timeout })??;
    print(
        output,
        &[record(&[
            ("host", promotion.new_host),
            ("port", promotion.new_port.to_string()),
            ("previous_host", promotion.old_host),
            ("previous_port", promotion.old_port.to_string()),
        ])],
        &["host", "port", "previous_host", "previous_port"],
    )
}

struct KillArgs {
    pod: Option<String>,
    grace: Duration,
    timeout: Duration,
    kubeconfig: Option<PathBuf>,
    namespace: Option<String>,
}

async fn kill(cluster: &SentinelConfig, args: KillArgs, output: OutputConfig) -> anyhow::Result<()> {
    let pods = KubePods::connect(args.kubeconfig.as_deref())
        .await
        .context("connect to kubernetes")?;
    let namespace = k8s::resolve_namespace(args.namespace.as_deref(), Some(pods.default_namespace()));
    let mut config = DrillConfig::new(cluster.cluster_name.as_str(), namespace);
    config.pod_name = args.pod;
    config.grace_period = args.grace;
    config.timeout = args.timeout;

    let (events, reporter) = events::channel();
    let printing = spawn_reporter(reporter, output);
    let cancel = cancel_on_interrupt();
    let result = run_failover_drill(
        &config,
        Arc::new(cluster.client()),
        Arc::new(pods),
        events,
        &cancel,
    )
    .await;
    // Flush every event before reporting the outcome.
    printing.await.context("reporter task")?.context("write events")?;

    let report = result.context("failover drill")?;
    tracing::info!(
        cluster = %cluster.cluster_name,
        pod = %report.pod_name,
        from = %report.initial_primary,
        to = %report.final_primary,
        "failover confirmed"
    );
    Ok(())
}

async fn replicate(args: ReplicationArgs, output: OutputConfig) -> anyhow::Result<()> {
    let writer = RedisEndpoint::parse(&args.write_url).context("--write-url")?;
    let reader = RedisEndpoint::parse(&args.read_url).context("--read-url")?;
    let config = ProbeConfig {
        clients: args.clients,
        operations: args.operations,
        key_prefix: args.key_prefix,
    };

    let (events, reporter) = events::channel();
    let printing = spawn_reporter(reporter, output);
    let cancel = cancel_on_interrupt();
    let result = run_probe(
        &config,
        Arc::new(RespConnector::new(writer)),
        Arc::new(RespConnector::new(reader)),
        events,
        &cancel,
    )
    .await;
    printing.await.context("reporter task")?.context("write events")?;

    let summaries = result.context("replication probe")?;
    let stale: u64 = summaries.values().map(|s| s.stale_reads).sum();
    let total: u64 = summaries.values().map(|s| s.total_reads).sum();
    tracing::info!(clients = summaries.len(), total, stale, "replication probe finished");
    Ok(())
}
