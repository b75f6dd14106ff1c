use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use steward_client::{ApiClient, EnvSecretResolver, RestClient, SecretRef};
use steward_core::{DeletionPolicy, ManagedResource};
use steward_reconcile::kinds::{
    GroupController, GroupSpec, PermissionController, PermissionSpec, ProjectController,
    ProjectSpec, QueueController, QueueSpec, RepositoryController, RepositorySpec,
};
use steward_reconcile::{
    ExternalClient, LogRecorder, Reconciler, Scheduler, SchedulerOptions,
};
use steward_store::{MemoryStore, Store};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stewardctl", version, about = "Steward: declarative reconciliation against a project-management organization")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load records and reconcile them continuously until interrupted
    Run {
        /// Organization base URL, e.g. https://dev.example.com/acme/
        #[arg(long = "org-url", env = "STEWARD_ORG_URL")]
        org_url: String,
        /// Record file(s), YAML, multi-document
        #[arg(short = 'f', long = "from-file", required = true)]
        files: Vec<PathBuf>,
    },
    /// Parse record files and print what would be reconciled
    Ls {
        /// Record file(s), YAML, multi-document
        #[arg(short = 'f', long = "from-file", required = true)]
        files: Vec<PathBuf>,
        /// Restrict to one kind
        #[arg(long = "kind")]
        kind: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

/// One declarative record as written in a file, before kind dispatch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    kind: String,
    metadata: RawMeta,
    #[serde(default)]
    deletion_policy: Option<DeletionPolicy>,
    spec: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMeta {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

fn load_records(files: &[PathBuf]) -> Result<Vec<RawRecord>> {
    let mut out = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(doc)
                .with_context(|| format!("parsing {}", path.display()))?;
            if value.is_null() {
                continue;
            }
            let record: RawRecord = serde_yaml::from_value(value)
                .with_context(|| format!("invalid record in {}", path.display()))?;
            out.push(record);
        }
    }
    Ok(out)
}

/// In-process stores, one per kind; cross-kind references resolve through
/// these.
struct Stores {
    projects: Arc<MemoryStore<ProjectSpec>>,
    repositories: Arc<MemoryStore<RepositorySpec>>,
    queues: Arc<MemoryStore<QueueSpec>>,
    groups: Arc<MemoryStore<GroupSpec>>,
    permissions: Arc<MemoryStore<PermissionSpec>>,
}

impl Stores {
    fn new() -> Self {
        Self {
            projects: MemoryStore::new(),
            repositories: MemoryStore::new(),
            queues: MemoryStore::new(),
            groups: MemoryStore::new(),
            permissions: MemoryStore::new(),
        }
    }

    async fn seed(&self, records: Vec<RawRecord>) -> Result<()> {
        for record in records {
            match record.kind.to_ascii_lowercase().as_str() {
                "project" => self.apply(&self.projects, record).await?,
                "repository" => self.apply(&self.repositories, record).await?,
                "queue" => self.apply(&self.queues, record).await?,
                "group" => self.apply(&self.groups, record).await?,
                "permission" => self.apply(&self.permissions, record).await?,
                other => bail!("unknown kind {other:?} for record {}", record.metadata.name),
            }
        }
        Ok(())
    }

    async fn apply<S>(&self, store: &MemoryStore<S>, record: RawRecord) -> Result<()>
    where
        S: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let spec: S = serde_json::from_value(record.spec).with_context(|| {
            format!("invalid {} spec for {}", record.kind, record.metadata.name)
        })?;
        let mut cr = ManagedResource::new(
            record.metadata.namespace.as_deref(),
            &record.metadata.name,
            spec,
        );
        if let Some(policy) = record.deletion_policy {
            cr.deletion_policy = policy;
        }
        store.apply(cr).await;
        Ok(())
    }
}

fn spawn_kind<S: Clone + Send + Sync + 'static>(
    kind: &'static str,
    store: Arc<MemoryStore<S>>,
    controller: Arc<dyn ExternalClient<S>>,
    opts: SchedulerOptions,
    shutdown: &watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let rec = Reconciler::new(kind, store as Arc<dyn Store<S>>, controller, Arc::new(LogRecorder));
    let sched = Scheduler::new(rec, opts);
    let rx = shutdown.clone();
    tokio::spawn(async move { sched.run(rx).await })
}

async fn run(org_url: &str, files: &[PathBuf]) -> Result<()> {
    let records = load_records(files)?;
    info!(records = records.len(), org = %org_url, "starting reconciliation");
    let stores = Stores::new();
    stores.seed(records).await?;

    let client: Arc<dyn ApiClient> = Arc::new(
        RestClient::connect(
            org_url,
            Arc::new(EnvSecretResolver),
            SecretRef { name: "STEWARD_TOKEN".into() },
        )
        .await
        .context("connecting to the organization (is STEWARD_TOKEN set?)")?,
    );

    let opts = SchedulerOptions::from_env();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = vec![
        spawn_kind(
            "project",
            stores.projects.clone(),
            Arc::new(ProjectController::new(client.clone())),
            opts,
            &shutdown_rx,
        ),
        spawn_kind(
            "repository",
            stores.repositories.clone(),
            Arc::new(RepositoryController::new(
                client.clone(),
                stores.projects.clone() as Arc<dyn Store<ProjectSpec>>,
            )),
            opts,
            &shutdown_rx,
        ),
        spawn_kind(
            "queue",
            stores.queues.clone(),
            Arc::new(QueueController::new(
                client.clone(),
                stores.projects.clone() as Arc<dyn Store<ProjectSpec>>,
            )),
            opts,
            &shutdown_rx,
        ),
        spawn_kind(
            "group",
            stores.groups.clone(),
            Arc::new(GroupController::new(
                client.clone(),
                stores.groups.clone() as Arc<dyn Store<GroupSpec>>,
            )),
            opts,
            &shutdown_rx,
        ),
        spawn_kind(
            "permission",
            stores.permissions.clone(),
            Arc::new(PermissionController::new(
                client.clone(),
                stores.projects.clone() as Arc<dyn Store<ProjectSpec>>,
                stores.groups.clone() as Arc<dyn Store<GroupSpec>>,
            )),
            opts,
            &shutdown_rx,
        ),
    ];

    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("interrupt received; shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn ls(output: Output, files: &[PathBuf], kind: Option<&str>) -> Result<()> {
    let records = load_records(files)?;
    let records: Vec<_> = records
        .into_iter()
        .filter(|r| kind.map_or(true, |k| r.kind.eq_ignore_ascii_case(k)))
        .collect();
    match output {
        Output::Human => {
            for r in &records {
                let ns = r.metadata.namespace.as_deref().unwrap_or("-");
                println!("{}\t{}\t{}", r.kind, ns, r.metadata.name);
            }
        }
        Output::Json => {
            let rows: Vec<_> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "kind": r.kind,
                        "namespace": r.metadata.namespace,
                        "name": r.metadata.name,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { org_url, files } => run(&org_url, &files).await,
        Commands::Ls { files, kind } => ls(cli.output, &files, kind.as_deref()),
    }
}
