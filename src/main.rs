#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use kube::{api::Api, runtime::watcher};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[command(
    name = "podiam",
    about = "Issues AWS IAM credentials to Kubernetes pods via the instance metadata protocol"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the cluster-wide broker server.
    Server(ServerArgs),
    /// Runs the per-node metadata agent.
    Agent(AgentArgs),
    /// Checks broker server health over the RPC channel.
    Health(HealthArgs),
}

#[derive(Debug, Args)]
struct ServerArgs {
    #[arg(long, default_value = "podiam=info,warn", env = "PODIAM_LOG")]
    log_level: kubert::LogFilter,

    #[arg(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[command(flatten)]
    client: kubert::ClientArgs,

    #[command(flatten)]
    admin: kubert::AdminArgs,

    /// Address the broker RPC server listens on.
    #[arg(long, default_value = "0.0.0.0:443")]
    bind_address: SocketAddr,

    /// Interval between full pod/namespace relists backstopping the watches.
    #[arg(long, default_value = "3m", value_parser = humantime::parse_duration)]
    pod_sync_interval: Duration,

    /// How long the watches may be disconnected before lookups degrade.
    #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
    staleness_budget: Duration,

    /// Session name presented to STS when assuming roles.
    #[arg(long, default_value = "podiam")]
    session_name: String,

    /// Prefix prepended to role names to form the role ARN,
    /// e.g. arn:aws:iam::123456789012:role/.
    #[arg(long)]
    role_base_arn: String,

    /// Lifetime requested for issued credentials.
    #[arg(long, default_value = "15m", value_parser = humantime::parse_duration)]
    session_duration: Duration,

    /// Server certificate presented to agents.
    #[arg(long)]
    server_cert: PathBuf,

    #[arg(long)]
    server_key: PathBuf,

    /// CA bundle that client certificates are verified against.
    #[arg(long)]
    ca: PathBuf,

    /// Number of prefetch workers consuming pod updates.
    #[arg(long, default_value = "8")]
    parallel_fetchers: usize,

    /// Buffered pod updates between the cache and the prefetch workers.
    #[arg(long, default_value = "1000")]
    prefetch_buffer_size: usize,
}

#[derive(Debug, Args)]
struct AgentArgs {
    #[arg(long, default_value = "podiam=info,warn", env = "PODIAM_AGENT_LOG")]
    log_level: String,

    #[arg(long, default_value = "3100")]
    listen_port: u16,

    /// Upstream cloud metadata endpoint for proxied paths.
    #[arg(long, default_value = "http://169.254.169.254")]
    metadata_endpoint: String,

    /// Honor an `ip` query parameter overriding the source address.
    /// Test and debug use only.
    #[arg(long)]
    allow_ip_query: bool,

    /// Retry budget for resolving just-started pods.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    max_elapsed_time: Duration,

    /// Broker server address, e.g. https://podiam-server:443.
    #[arg(long)]
    server_address: String,

    /// Client certificate presented to the broker server.
    #[arg(long)]
    tls_cert: PathBuf,

    #[arg(long)]
    tls_key: PathBuf,

    /// CA bundle the server certificate is verified against.
    #[arg(long)]
    ca: PathBuf,
}

#[derive(Debug, Args)]
struct HealthArgs {
    #[arg(long)]
    server_address: String,

    #[arg(long)]
    tls_cert: PathBuf,

    #[arg(long)]
    tls_key: PathBuf,

    #[arg(long)]
    ca: PathBuf,

    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Server(args) => server(args).await,
        Command::Agent(args) => agent(args).await,
        Command::Health(args) => health(args).await,
    }
}

async fn server(args: ServerArgs) -> Result<()> {
    let (index, updates) =
        podiam_k8s::Index::new(args.staleness_budget, args.prefetch_buffer_size);

    let mut prom = <prometheus_client::registry::Registry>::default();
    podiam_k8s::register_metrics(prom.sub_registry_with_prefix("pod_index"), index.clone());
    let cache_metrics = podiam_sts::CacheMetrics::register(prom.sub_registry_with_prefix("sts"));

    let runtime = kubert::Runtime::builder()
        .with_log(args.log_level, args.log_format)
        .with_admin(args.admin.into_builder().with_prometheus(prom))
        .with_client(args.client)
        .build()
        .await?;
    let client = runtime.client();

    // Watches Pods and Namespaces to keep the lookup indexes current; a
    // periodic relist backstops missed deletes.
    let pods = watcher(Api::all(client.clone()), watcher::Config::default()).into();
    let namespaces = watcher(Api::all(client.clone()), watcher::Config::default()).into();
    let resync = podiam_k8s::Resync {
        pods: Api::all(client.clone()),
        namespaces: Api::all(client),
        interval: args.pod_sync_interval,
    };
    tokio::spawn(
        podiam_k8s::run(index.clone(), pods, namespaces, resync).instrument(info_span!("index")),
    );

    let gateway = podiam_sts::StsGateway::from_env(args.session_duration).await;
    let cache = podiam_sts::Cache::new(
        Arc::new(gateway),
        args.role_base_arn,
        args.session_name,
        args.session_duration / 4,
        cache_metrics,
    );

    let drain = runtime.shutdown_handle();
    let manager =
        podiam_server::CredentialManager::new(cache.clone(), index.clone(), updates);
    tokio::spawn(
        manager
            .run(args.parallel_fetchers, drain.clone())
            .instrument(info_span!("prefetch")),
    );

    let svc = podiam_server::BrokerGrpc::new(podiam_server::IndexFinder::new(index), cache);
    let tls = podiam_server::TlsPaths {
        cert: args.server_cert,
        key: args.server_key,
        ca: args.ca,
    };
    tokio::spawn(async move {
        if let Err(error) = podiam_server::serve(args.bind_address, tls, svc, drain).await {
            error!(%error, "broker gRPC server failed");
        }
    });

    // Block on the shutdown signal; background tasks drain before exit.
    if runtime.run().await.is_err() {
        bail!("aborted");
    }
    Ok(())
}

async fn agent(args: AgentArgs) -> Result<()> {
    init_tracing(&args.log_level)?;

    let tls = podiam_agent::TlsPaths {
        cert: args.tls_cert,
        key: args.tls_key,
        ca: args.ca,
    };
    let broker = podiam_agent::GrpcBroker::connect(args.server_address, &tls).await?;

    let mut config = podiam_agent::Config::new(args.listen_port);
    config.metadata_endpoint = args.metadata_endpoint;
    config.allow_ip_query = args.allow_ip_query;
    config.max_elapsed_time = args.max_elapsed_time;

    let registry = prometheus_client::registry::Registry::default();

    let (drain_tx, drain_rx) = drain::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        drain_tx.drain().await;
    });

    podiam_agent::serve(config, broker, registry, drain_rx).await
}

async fn health(args: HealthArgs) -> Result<()> {
    init_tracing("warn")?;

    let tls = podiam_agent::TlsPaths {
        cert: args.tls_cert,
        key: args.tls_key,
        ca: args.ca,
    };
    let broker = podiam_agent::GrpcBroker::connect(args.server_address, &tls).await?;
    let message = tokio::time::timeout(args.timeout, broker.health())
        .await
        .context("health check timed out")??;
    println!("{message}");
    Ok(())
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .with_context(|| format!("invalid log level {filter}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}
