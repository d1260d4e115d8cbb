use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kmirror_api::{Controller, KubeClient};
use kmirror_core::{ControllerConfig, ManagedObject, ObjectKey};
use kmirror_kubehub::ClusterClient;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "Local Deployment mirror")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to mirror (default: KMIRROR_NAMESPACE, else "default")
    #[arg(long = "ns", global = true, conflicts_with = "all_namespaces")]
    namespace: Option<String>,

    /// Mirror every namespace
    #[arg(short = 'A', long = "all-namespaces", global = true, action = ArgAction::SetTrue)]
    all_namespaces: bool,

    /// Periodic resync in seconds; 0 disables it (default: KMIRROR_RESYNC_SECS, else 60)
    #[arg(long = "resync-secs", global = true)]
    resync_secs: Option<u64>,

    /// Cluster DNS suffix used to build service host names (default: KMIRROR_DOMAIN_SUFFIX)
    #[arg(long = "domain-suffix", global = true)]
    domain_suffix: Option<String>,

    /// How long one-shot commands wait for the initial listing
    #[arg(long = "wait-secs", global = true, default_value_t = 8)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List mirrored Deployments
    Ls,
    /// Print mirrored keys (namespace/name)
    Keys,
    /// Show one Deployment by key
    Get {
        /// Key, e.g. "default/web"
        key: String,
        /// Read from the API server instead of the mirror
        #[arg(long = "live", action = ArgAction::SetTrue)]
        live: bool,
    },
    /// Keep the mirror running until Ctrl-C, logging stats periodically
    Run,
}

/// Logs go to stderr; stdout carries command output.
fn init_tracing() {
    let filter = std::env::var("KMIRROR_LOG")
        .ok()
        .and_then(|directives| tracing_subscriber::EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Prometheus endpoint, only when KMIRROR_METRICS_ADDR is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("KMIRROR_METRICS_ADDR") else { return };
    let sock: std::net::SocketAddr = match addr.parse() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr = %addr, error = %e, "metrics: ignoring KMIRROR_METRICS_ADDR; expected host:port");
            return;
        }
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(%sock, "metrics: prometheus exporter listening"),
        Err(e) => warn!(error = %e, "metrics: exporter not installed"),
    }
}

/// Environment first, then flags on top.
fn build_config(cli: &Cli) -> ControllerConfig {
    let mut cfg = ControllerConfig::from_env();
    if cli.all_namespaces {
        cfg.namespace = None;
    } else if let Some(ns) = cli.namespace.as_deref() {
        cfg.namespace = (!ns.is_empty() && ns != "*").then(|| ns.to_string());
    }
    if let Some(secs) = cli.resync_secs {
        cfg.resync_period = Duration::from_secs(secs);
    }
    if let Some(suffix) = cli.domain_suffix.clone() {
        cfg.domain_suffix = suffix;
    }
    cfg
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = build_config(&cli);
    let wait = Duration::from_secs(cli.wait_secs);

    let client: Arc<dyn ClusterClient> = Arc::new(KubeClient::try_default().await?);

    // live reads bypass the mirror entirely
    if let Commands::Get { key, live: true } = &cli.command {
        let key: ObjectKey = key.parse()?;
        let obj = client.get(&key).await?;
        return print_one(cli.output, &cfg, &key, obj.as_ref());
    }

    let controller = Controller::start_with(cfg.clone(), client)?;
    if !matches!(cli.command, Commands::Run) {
        controller.wait_for_sync(wait).await.context("waiting for initial listing")?;
    }

    match &cli.command {
        Commands::Ls => {
            let items = controller.list_deployments();
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<32} {:<10} {:<7} AGE", "NAMESPACE", "NAME", "VERSION", "READY");
                    for o in &items {
                        let ns_col = o.key.namespace.as_deref().unwrap_or("-");
                        println!("{:<16} {:<32} {:<10} {:<7} {}", ns_col, o.key.name, o.resource_version, render_ready(o), render_age(o));
                    }
                }
                Output::Json => {
                    let payloads: Vec<&serde_json::Value> = items.iter().map(|o| &o.payload).collect();
                    println!("{}", serde_json::to_string_pretty(&payloads)?);
                }
            }
        }
        Commands::Keys => {
            let keys = controller.list_keys();
            match cli.output {
                Output::Human => keys.iter().for_each(|k| println!("{}", k)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
            }
        }
        Commands::Get { key, .. } => {
            let obj = controller.get_by_key(key)?;
            let key: ObjectKey = key.parse()?;
            print_one(cli.output, &cfg, &key, obj.as_ref())?;
        }
        Commands::Run => run(&controller, cli.output).await?,
    }

    controller.shutdown().await?;
    Ok(())
}

async fn run(controller: &Controller, output: Output) -> Result<()> {
    let period = match controller.config().resync_period {
        p if p.is_zero() => Duration::from_secs(60),
        p => p,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupt received; stopping");
                break;
            }
            _ = ticker.tick() => {
                let stats = controller.stats();
                match output {
                    Output::Human => info!(
                        items = stats.items,
                        synced = stats.has_synced,
                        queue = stats.queue_len,
                        rv = ?stats.last_sync_resource_version,
                        "mirror stats"
                    ),
                    Output::Json => println!("{}", serde_json::to_string(&stats)?),
                }
            }
        }
    }
    Ok(())
}

fn print_one(output: Output, cfg: &ControllerConfig, key: &ObjectKey, obj: Option<&ManagedObject>) -> Result<()> {
    let Some(obj) = obj else {
        anyhow::bail!("not found: {}", key);
    };
    match output {
        Output::Human => {
            println!("key:     {}", obj.key);
            println!("rv:      {}", obj.resource_version);
            println!("ready:   {}", render_ready(obj));
            println!("age:     {}", render_age(obj));
            if let Some(ns) = obj.key.namespace.as_deref() {
                println!("host:    {}", cfg.service_host(&obj.key.name, ns));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&obj.payload)?),
    }
    Ok(())
}

fn render_ready(o: &ManagedObject) -> String {
    let replicas = o.payload.pointer("/spec/replicas").and_then(|v| v.as_i64()).unwrap_or(1);
    let ready = o.payload.pointer("/status/readyReplicas").and_then(|v| v.as_i64()).unwrap_or(0);
    format!("{}/{}", ready, replicas)
}

fn render_age(o: &ManagedObject) -> String {
    o.creation_timestamp()
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .map(|created| format_age(chrono::Utc::now().signed_duration_since(created)))
        .unwrap_or_else(|| "-".to_string())
}

/// Two most significant units, kubectl style: `3d4h`, `5h12m`, `7m`, `42s`.
fn format_age(elapsed: chrono::Duration) -> String {
    let elapsed = elapsed.max(chrono::Duration::zero());
    match (elapsed.num_days(), elapsed.num_hours(), elapsed.num_minutes()) {
        (d, h, _) if d > 0 => format!("{}d{}h", d, h % 24),
        (_, h, m) if h > 0 => format!("{}h{}m", h, m % 60),
        (_, _, m) if m > 0 => format!("{}m", m),
        _ => format!("{}s", elapsed.num_seconds()),
    }
}
