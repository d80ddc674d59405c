use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gatesync_apply::Reconciler;
use gatesync_client::{FileResourceClient, KindRegistry};
use gatesync_core::prelude::*;
use gatesync_core::Selector;
use gatesync_eventloop::{EventLoop, Syncer};
use gatesync_report::{ResourceReports, StatusReporter};
use gatesync_store::SnapshotEmitter;
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gatesyncctl", version, about = "gatesync resource sync CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace(s) to operate on; repeat for several. Empty means all.
    #[arg(long = "ns", global = true)]
    namespaces: Vec<String>,

    /// Use the flat-file backend rooted here (one subdirectory per kind)
    #[arg(long = "dir", global = true, env = "GATESYNC_DIR")]
    dir: Option<PathBuf>,

    /// Kubernetes backend mapping, e.g. "Upstream=gloo.solo.io/v1/Upstream"
    #[arg(long = "crd", global = true, value_parser = parse_crd)]
    crds: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List resources of a kind
    Ls {
        #[arg(long = "kind")]
        kind: String,
    },
    /// Watch kinds and print every distinct snapshot
    Watch {
        /// Kinds to watch; defaults to every configured kind
        #[arg(long = "kind")]
        kinds: Vec<String>,
        /// Re-emit the current snapshot this often even without changes
        #[arg(long = "resync-secs")]
        resync_secs: Option<u64>,
    },
    /// Converge one namespace of a kind to the resources in a YAML file
    Reconcile {
        #[arg(long = "kind")]
        kind: String,
        /// Multi-document YAML of resources
        #[arg(long = "file")]
        file: PathBuf,
        /// Only resources carrying these labels are considered owned (k=v)
        #[arg(long = "selector", value_parser = parse_label)]
        selector: Vec<(String, String)>,
    },
    /// Write a status for one resource on behalf of a reporter
    Report {
        #[arg(long = "kind")]
        kind: String,
        name: String,
        #[arg(long = "reporter", default_value = "gatesyncctl")]
        reporter: String,
        #[arg(long = "error")]
        errors: Vec<String>,
        #[arg(long = "warning")]
        warnings: Vec<String>,
        #[arg(long = "pending")]
        pending: Option<String>,
    },
}

fn parse_crd(s: &str) -> Result<(String, String), String> {
    let (kind, gvk) = s.split_once('=').ok_or_else(|| format!("expected KIND=group/version/Kind, got {:?}", s))?;
    if kind.is_empty() || gvk.is_empty() {
        return Err(format!("expected KIND=group/version/Kind, got {:?}", s));
    }
    Ok((kind.to_string(), gvk.to_string()))
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

fn init_tracing() {
    let env = std::env::var("GATESYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GATESYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid GATESYNC_METRICS_ADDR; expected host:port");
        }
    }
}

/// Clients for `kinds`, from the file backend when `--dir` is set and
/// from `--crd` mappings otherwise. An empty `kinds` means every configured kind.
async fn build_registry(cli: &Cli, kinds: &[Kind]) -> Result<KindRegistry> {
    if let Some(dir) = &cli.dir {
        if kinds.is_empty() {
            bail!("--dir needs at least one --kind");
        }
        let mut registry = KindRegistry::new();
        for k in kinds {
            registry.register(Arc::new(FileResourceClient::new(k.clone(), dir.join(k.as_str()))));
        }
        return Ok(registry);
    }
    let crds: Vec<(Kind, String)> = cli
        .crds
        .iter()
        .map(|(k, gvk)| (Kind::new(k.clone()), gvk.clone()))
        .filter(|(k, _)| kinds.is_empty() || kinds.contains(k))
        .collect();
    if let Some(missing) = kinds.iter().find(|k| !crds.iter().any(|(c, _)| c == *k)) {
        bail!("no backend for kind {}: pass --dir or --crd {}=group/version/Kind", missing, missing);
    }
    if crds.is_empty() {
        bail!("no kinds configured: pass --dir with --kind, or --crd");
    }
    let client = kube::Client::try_default().await.context("connecting to Kubernetes")?;
    gatesync_kubehub::registry_from_crds(client, &crds).await
}

fn read_resources(path: &Path) -> Result<ResourceList> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(&text).enumerate() {
        let r = Resource::deserialize(doc).with_context(|| format!("{}: document {}", path.display(), i + 1))?;
        out.push(r);
    }
    Ok(out)
}

/// Cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
        }
        token.cancel();
    });
    cancel
}

fn print_resources(output: Output, list: &[&Resource]) -> Result<()> {
    match output {
        Output::Human => {
            for r in list {
                let state = r.status.as_ref().map(|s| format!("{:?}", s.state)).unwrap_or_else(|| "-".into());
                println!("{} {}/{} rv={} {}", r.kind, r.namespace(), r.name(), r.metadata.resource_version, state);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(list)?),
    }
    Ok(())
}

struct PrintSyncer {
    output: Output,
}

#[async_trait::async_trait]
impl Syncer for PrintSyncer {
    async fn sync(&mut self, _cancel: &CancellationToken, snapshot: &Snapshot) -> Result<()> {
        match self.output {
            Output::Human => {
                println!("snapshot {:016x}: {} resources", snapshot.hash(), snapshot.len());
                for r in snapshot.iter() {
                    println!("  {} {}/{}", r.kind, r.namespace(), r.name());
                }
            }
            Output::Json => {
                let items: Vec<&Resource> = snapshot.iter().collect();
                let line = serde_json::json!({ "hash": format!("{:016x}", snapshot.hash()), "items": items });
                println!("{}", serde_json::to_string(&line)?);
            }
        }
        Ok(())
    }
}

fn single_namespace(cli: &Cli) -> Result<String> {
    match cli.namespaces.as_slice() {
        [] => Ok(gatesync_core::DEFAULT_NAMESPACE.to_string()),
        [ns] => Ok(ns.clone()),
        _ => Err(anyhow!("this command takes a single --ns")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Ls { kind } => {
            let kind = Kind::new(kind.clone());
            let registry = build_registry(&cli, std::slice::from_ref(&kind)).await?;
            let client = registry.get(&kind)?;
            let mut all = Vec::new();
            let namespaces = if cli.namespaces.is_empty() { vec![String::new()] } else { cli.namespaces.clone() };
            for ns in &namespaces {
                all.extend(client.list(ns, ListOpts::default()).await?);
            }
            print_resources(cli.output, &all.iter().collect::<Vec<_>>())?;
        }
        Commands::Watch { kinds, resync_secs } => {
            let kinds: Vec<Kind> = kinds.iter().cloned().map(Kind::new).collect();
            let registry = build_registry(&cli, &kinds).await?;
            let mut emitter = SnapshotEmitter::new(&registry);
            if let Some(secs) = resync_secs {
                emitter = emitter.with_resync_period(Duration::from_secs(*secs));
            }
            info!(kinds = ?emitter.kinds().map(|k| k.to_string()).collect::<Vec<_>>(), namespaces = ?cli.namespaces, "watch invoked");
            let cancel = interrupt_token();
            let mut handle = EventLoop::new(emitter, PrintSyncer { output: cli.output })
                .run(&cli.namespaces, WatchOpts::new(cancel.clone()))
                .await?;
            while let Some(e) = handle.errors.recv().await {
                warn!(error = %e, "watch error");
            }
            handle.join().await?;
            info!("watch ended");
        }
        Commands::Reconcile { kind, file, selector } => {
            let kind = Kind::new(kind.clone());
            let ns = single_namespace(&cli)?;
            let desired = read_resources(file)?;
            let registry = build_registry(&cli, std::slice::from_ref(&kind)).await?;
            let selector = Selector(selector.iter().cloned().collect());
            let reconciler = Reconciler::new(registry.get(&kind)?);
            info!(kind = %kind, ns = %ns, desired = desired.len(), "reconcile invoked");
            let summary = reconciler.reconcile(&ns, desired, ListOpts { selector }).await?;
            match cli.output {
                Output::Human => println!("{}", summary),
                Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            }
        }
        Commands::Report { kind, name, reporter, errors, warnings, pending } => {
            let kind = Kind::new(kind.clone());
            let ns = single_namespace(&cli)?;
            let registry = build_registry(&cli, std::slice::from_ref(&kind)).await?;
            let target = registry.get(&kind)?.read(&ns, name, ReadOpts::default()).await?;

            let mut reports = ResourceReports::new();
            reports.accept(&target);
            for e in errors {
                reports.add_error(&target, e);
            }
            for w in warnings {
                reports.add_warning(&target, w);
            }
            if let Some(p) = pending {
                reports.mark_pending(&target, p);
            }
            let summary = StatusReporter::new(reporter.clone(), registry.clone()).write_reports(&reports).await?;
            let stored = registry.get(&kind)?.read(&ns, name, ReadOpts::default()).await?;
            match cli.output {
                Output::Human => {
                    let status = stored.status.unwrap_or_default();
                    let verb = if summary.written > 0 { "written" } else { "unchanged" };
                    println!("{} {}/{}: {:?} ({}) {}", kind, ns, name, status.state, status.reason, verb);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stored.status)?),
            }
        }
    }
    Ok(())
}
