use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kestrel_core::{ChangeType, ItemParams, KindIdentity, KubeObject, ResourceDescriptor, ResourceObject, SyncConfig};
use kestrel_kubehub::{KubeTransport, MemoryTransport, Transport, TransportClient};
use kestrel_metrics::{node_metrics_queries, MetricsGateway, MetricsRange};
use kestrel_store::kinds::{self, nodes::NodeView, roles, BUILTIN_ALIASES};
use kestrel_store::{KindSpec, LoadParams, ResourceStore, StoreChange, StoreRegistry};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

mod demo;

#[derive(Parser, Debug)]
#[command(name = "kestrelctl", version, about = "Kestrel CLI: cached, live-synced Kubernetes resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to restrict to (repeatable; default: all)
    #[arg(long = "ns", global = true)]
    namespaces: Vec<String>,

    /// Label selector, e.g. "app=web,tier"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Serve everything from a seeded in-memory cluster
    #[arg(long = "demo", global = true, action = ArgAction::SetTrue, env = "KESTREL_DEMO")]
    demo: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(clap::Args, Debug, Clone)]
struct KindArg {
    /// Built-in alias (pods, roles, nodes, ...) or "apiVersion/Kind"
    kind: String,
    /// Plural path segment for non-built-in kinds (default: lowercase kind + "s")
    #[arg(long = "plural")]
    plural: Option<String>,
    /// Non-built-in kind is cluster-scoped
    #[arg(long = "cluster-scoped", action = ArgAction::SetTrue)]
    cluster_scoped: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a kind and print its sorted view
    Ls {
        #[command(flatten)]
        kind: KindArg,
    },
    /// Load a kind, then print changes as they arrive
    Watch {
        #[command(flatten)]
        kind: KindArg,
    },
    /// Fetch one object
    Get {
        #[command(flatten)]
        kind: KindArg,
        name: String,
    },
    /// Delete one object
    Delete {
        #[command(flatten)]
        kind: KindArg,
        name: String,
    },
    /// Node usage and capacity from the metrics backend
    NodeMetrics {
        /// Window to query, in minutes
        #[arg(long = "window", default_value_t = 60)]
        window_mins: u64,
        /// Resolution, in seconds
        #[arg(long = "step", default_value_t = 60)]
        step_secs: u64,
        /// Backend path
        #[arg(long = "path", default_value = MetricsGateway::DEFAULT_PATH)]
        path: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KESTREL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KESTREL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KESTREL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Transport, config and the registry shared by every command.
struct Session {
    client: TransportClient,
    config: SyncConfig,
    registry: StoreRegistry,
    demo: Option<Arc<MemoryTransport>>,
}

impl Session {
    async fn connect(demo: bool) -> Result<Self> {
        let config = SyncConfig::from_env();
        let demo = demo.then(demo::transport);
        let transport: Arc<dyn Transport> = match &demo {
            Some(mem) => {
                info!("using in-memory demo cluster");
                mem.clone()
            }
            None => Arc::new(KubeTransport::try_default().await.context("connecting to the cluster")?),
        };
        Ok(Self { client: TransportClient::new(transport, config.retry.clone()), config, registry: StoreRegistry::new(), demo })
    }

    fn store(&self, arg: &KindArg) -> Result<ResourceStore<ResourceObject>> {
        let spec = resolve_kind(arg)?;
        let identity = spec.identity.clone();
        let (client, config) = (self.client.clone(), self.config.clone());
        Ok(self.registry.get_or_create(&identity, move || spec.build(client, config))?)
    }
}

fn resolve_kind(arg: &KindArg) -> Result<KindSpec<ResourceObject>> {
    if let Some(spec) = kinds::builtin(&arg.kind) {
        return Ok(spec);
    }
    let id = KindIdentity::parse(&arg.kind)
        .with_context(|| format!("unknown kind {:?}; use one of {} or apiVersion/Kind", arg.kind, BUILTIN_ALIASES.join(", ")))?;
    let plural = arg.plural.clone().unwrap_or_else(|| format!("{}s", id.kind.to_ascii_lowercase()));
    Ok(KindSpec::single(ResourceDescriptor::dynamic(&id.api_version, &id.kind, &plural, !arg.cluster_scoped)))
}

fn item_params(name: &str, namespaces: &[String]) -> Result<ItemParams> {
    match namespaces {
        [] => Ok(ItemParams::cluster(name)),
        [ns] => Ok(ItemParams::namespaced(ns.as_str(), name)),
        _ => bail!("--ns may be given at most once for single-object commands"),
    }
}

fn print_structured<T: Serialize + ?Sized>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let session = Session::connect(cli.demo).await?;
    let params = LoadParams { namespaces: cli.namespaces.clone(), label_selector: cli.selector.clone() };

    match &cli.command {
        Commands::Ls { kind } => {
            info!(kind = %kind.kind, namespaces = ?params.namespaces, "ls invoked");
            let store = session.store(kind)?;
            let report = store.load(params).await.with_context(|| format!("loading {}", store.identity()))?;
            for d in &report.degraded {
                eprintln!("warning: {} unavailable: {}", d.source, d.error);
            }
            let items = store.items();
            match cli.output {
                Output::Human => print_table(&store, &items),
                _ => print_structured(cli.output, &items.iter().map(|o| o.raw()).collect::<Vec<_>>())?,
            }
        }
        Commands::Watch { kind } => {
            info!(kind = %kind.kind, namespaces = ?params.namespaces, "watch invoked");
            let store = session.store(kind)?;
            let mut sub = store.subscribe();
            let report = store.load(params).await.with_context(|| format!("loading {}", store.identity()))?;
            eprintln!("{} objects; watching for changes (Ctrl-C to stop)", report.items);
            let driver = session.demo.clone().map(|mem| tokio::spawn(demo::drive(mem)));
            loop {
                tokio::select! {
                    change = sub.next_change() => match change {
                        Some(StoreChange::Applied { change, object }) => print_change(cli.output, change, &object)?,
                        Some(StoreChange::StateChanged(state)) => info!(?state, "store state changed"),
                        Some(StoreChange::Reloaded { items, .. }) => info!(items, "store reloaded"),
                        Some(StoreChange::Reset) => break,
                        None => {
                            warn!("store closed; exiting watch loop");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            sub.unsubscribe();
            if let Some(handle) = driver {
                handle.abort();
            }
        }
        Commands::Get { kind, name } => {
            let store = session.store(kind)?;
            let params = item_params(name, &cli.namespaces)?;
            let Some(obj) = store.load_item(&params).await? else {
                bail!("{} {:?} not found", store.identity(), name);
            };
            match cli.output {
                Output::Human => print_table(&store, std::slice::from_ref(&obj)),
                _ => print_structured(cli.output, obj.raw())?,
            }
        }
        Commands::Delete { kind, name } => {
            let store = session.store(kind)?;
            let params = item_params(name, &cli.namespaces)?;
            store.remove_item(&params).await.with_context(|| format!("deleting {name}"))?;
            println!("{} \"{}\" deleted", store.identity().kind.to_ascii_lowercase(), name);
        }
        Commands::NodeMetrics { window_mins, step_secs, path } => {
            let gateway = MetricsGateway::with_path(session.client.clone(), path.clone());
            let range = MetricsRange::last(Duration::from_secs(*window_mins * 60), Duration::from_secs(*step_secs));
            let out = gateway.query(&node_metrics_queries(), Some(&range)).await.context("querying node metrics")?;
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:>16}", "METRIC", "LAST");
                    for (name, series) in &out {
                        let last = match series.last_value() {
                            Some(v) if name.starts_with("cpu") => format!("{v:.2}"),
                            Some(v) => human_bytes(v),
                            None => "-".to_string(),
                        };
                        println!("{name:<16} {last:>16}");
                    }
                }
                _ => print_structured(cli.output, &out)?,
            }
        }
    }

    Ok(())
}

fn print_table(store: &ResourceStore<ResourceObject>, items: &[Arc<ResourceObject>]) {
    if store.identity().kind == "Node" {
        println!("{:<20} {:<16} {:<10} {:>5} {:>10}  CONDITIONS", "NAME", "ROLES", "VERSION", "CPU", "MEMORY");
        for obj in items {
            match NodeView::new(obj) {
                Ok(node) => {
                    let roles = node.roles().join(",");
                    println!(
                        "{:<20} {:<16} {:<10} {:>5} {:>10}  {}",
                        node.name(),
                        if roles.is_empty() { "<none>" } else { roles.as_str() },
                        node.kubelet_version().unwrap_or("-"),
                        node.cpu_capacity(),
                        human_bytes(node.memory_capacity()),
                        node.condition_text()
                    );
                }
                Err(e) => warn!(name = %obj.name(), error = %e, "node view unavailable"),
            }
        }
        return;
    }
    if store.identity() == &roles::identity() {
        println!("{:<12} {:<16} {:<32} {:>5} {:>8}", "KIND", "NAMESPACE", "NAME", "RULES", "AGE");
        for obj in items {
            let rules = roles::rules(obj).map(|r| r.len().to_string()).unwrap_or_else(|_| "?".into());
            println!(
                "{:<12} {:<16} {:<32} {:>5} {:>8}",
                obj.kind(),
                obj.namespace().unwrap_or("-"),
                obj.name(),
                rules,
                render_age(obj.meta().creation_ts())
            );
        }
        return;
    }
    println!("{:<16} {:<40} {:>8}", "NAMESPACE", "NAME", "AGE");
    for obj in items {
        println!("{:<16} {:<40} {:>8}", obj.namespace().unwrap_or("-"), obj.name(), render_age(obj.meta().creation_ts()));
    }
}

fn print_change(output: Output, change: ChangeType, obj: &ResourceObject) -> Result<()> {
    let key = match obj.namespace() {
        Some(ns) => format!("{ns}/{}", obj.name()),
        None => obj.name().to_string(),
    };
    match output {
        Output::Human => {
            let mark = match change {
                ChangeType::Added => '+',
                ChangeType::Modified => '~',
                ChangeType::Deleted => '-',
            };
            println!("{mark} {key}");
        }
        _ => {
            #[derive(Serialize)]
            struct Line<'a> {
                change: &'a str,
                key: &'a str,
                #[serde(rename = "resourceVersion")]
                resource_version: &'a str,
            }
            let change = match change {
                ChangeType::Added => "ADDED",
                ChangeType::Modified => "MODIFIED",
                ChangeType::Deleted => "DELETED",
            };
            let line = Line { change, key: &key, resource_version: obj.resource_version().as_str() };
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

fn human_bytes(v: f64) -> String {
    const UNITS: [&str; 5] = ["B", "Ki", "Mi", "Gi", "Ti"];
    let mut v = v;
    let mut unit = 0;
    while v >= 1024.0 && unit + 1 < UNITS.len() {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{v:.0}{}", UNITS[0]) } else { format!("{v:.1}{}", UNITS[unit]) }
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let mut secs = (chrono::Utc::now().timestamp() - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{days}d{hours}h") }
    else if hours > 0 { format!("{hours}h{mins}m") }
    else if mins > 0 { format!("{mins}m") }
    else { format!("{secs}s") }
}
