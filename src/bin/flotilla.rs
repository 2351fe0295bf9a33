//! # Flotilla CLI
//!
//! `apply` submits a job file to a node, `describe` prints a job's full
//! YAML description, `serve` runs the long-lived node daemon until
//! signalled.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use flotilla::api::{serve_api, serve_livez, ApiClient, ApiState};
use flotilla::capacity::CapacityManagerConfig;
use flotilla::config::{ApiConfig, ComputeNodeConfig, NodeConfig, RequesterNodeConfig};
use flotilla::executor::{ExecutorRegistry, NoopExecutor, NoopExecutorConfig};
use flotilla::job::ResourceUsageConfig;
use flotilla::jobfile::{construct_job, parse_job_file};
use flotilla::selection::{JobSelectionDataLocality, JobSelectionPolicy};
use flotilla::shutdown::{shutdown_signal, ShutdownHandle};
use flotilla::storage::{BlobStorageProvider, LocalBlobStore, StorageRegistry, UrlDownloadProvider};
use flotilla::store::InMemoryJobStore;
use flotilla::transport::{Libp2pTransport, Libp2pTransportConfig};
use flotilla::verifier::{BlobVerifier, NoopVerifier, VerifierRegistry};
use flotilla::{
    ComputeNode, Controller, EngineKind, FlotillaError, FlotillaResult, RequesterNode,
    StorageSourceKind, VerifierKind,
};

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Decentralized compute network client and node daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job.json or job.yaml file and run it on the network
    Apply {
        /// Path to the job file
        #[arg(short = 'f', long)]
        filename: PathBuf,
        /// How many nodes should run each shard in parallel
        #[arg(short = 'c', long, default_value_t = 1)]
        concurrency: u32,
        /// Labels for the job, in the format 'a,b,c,1'
        #[arg(short = 'l', long, value_delimiter = ',')]
        labels: Vec<String>,
        /// Node API endpoint
        #[arg(long, default_value = "http://127.0.0.1:1234")]
        api: String,
    },
    /// Describe a job on the network, in yaml format
    Describe {
        /// Job id (short form accepted)
        id: String,
        /// Node API endpoint
        #[arg(long, default_value = "http://127.0.0.1:1234")]
        api: String,
    },
    /// Start a flotilla node and run it until signalled
    Serve {
        /// Multiaddress of a peer to connect to
        #[arg(long)]
        peer: Option<String>,
        /// Root directory of the shared content-addressed blob store
        #[arg(long)]
        ipfs_connect: Option<PathBuf>,
        /// Host to listen on for api connections
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on for swarm connections
        #[arg(long, default_value_t = 1235)]
        port: u16,
        /// Port to listen on for api connections
        #[arg(long, default_value_t = 1234)]
        api_port: u16,
        /// Port to serve the liveness endpoint on
        #[arg(long)]
        metrics_port: Option<u16>,
        /// Only accept jobs referencing data we have ("local") or any job ("anywhere")
        #[arg(long, default_value = "anywhere")]
        job_selection_data_locality: String,
        /// Reject jobs that don't specify any data
        #[arg(long)]
        job_selection_reject_stateless: bool,
        /// Use a HTTP POST to decide whether to take on a job
        #[arg(long)]
        job_selection_probe_http: Option<String>,
        /// Run an external program to decide whether to take on a job
        #[arg(long)]
        job_selection_probe_exec: Option<String>,
        /// Total CPU core limit across all jobs (e.g. 500m, 2, 8)
        #[arg(long, default_value = "")]
        limit_total_cpu: String,
        /// Total memory limit across all jobs (e.g. 500Mb, 2Gb)
        #[arg(long, default_value = "")]
        limit_total_memory: String,
        /// Total GPU limit across all jobs (e.g. 1, 2)
        #[arg(long, default_value = "")]
        limit_total_gpu: String,
        /// CPU core limit for a single job
        #[arg(long, default_value = "")]
        limit_job_cpu: String,
        /// Memory limit for a single job
        #[arg(long, default_value = "")]
        limit_job_memory: String,
        /// GPU limit for a single job
        #[arg(long, default_value = "")]
        limit_job_gpu: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> FlotillaResult<()> {
    match cli.command {
        Commands::Apply {
            filename,
            concurrency,
            labels,
            api,
        } => apply(&filename, concurrency, &labels, &api).await,
        Commands::Describe { id, api } => describe(&id, &api).await,
        Commands::Serve {
            peer,
            ipfs_connect,
            host,
            port,
            api_port,
            metrics_port,
            job_selection_data_locality,
            job_selection_reject_stateless,
            job_selection_probe_http,
            job_selection_probe_exec,
            limit_total_cpu,
            limit_total_memory,
            limit_total_gpu,
            limit_job_cpu,
            limit_job_memory,
            limit_job_gpu,
        } => {
            let locality = JobSelectionDataLocality::parse(&job_selection_data_locality)
                .ok_or_else(|| {
                    FlotillaError::BadSpec(
                        "job-selection-data-locality must be either 'local' or 'anywhere'".into(),
                    )
                })?;
            let peers = match peer {
                Some(addr) => vec![addr.parse().map_err(|e| {
                    FlotillaError::BadSpec(format!("invalid peer multiaddress: {}", e))
                })?],
                None => vec![],
            };
            let config = NodeConfig {
                transport: Libp2pTransportConfig {
                    port,
                    peers,
                    keypair: None,
                },
                api: ApiConfig {
                    host,
                    port: api_port,
                },
                metrics_port,
                compute: ComputeNodeConfig {
                    job_selection_policy: JobSelectionPolicy {
                        locality,
                        reject_stateless_jobs: job_selection_reject_stateless,
                        probe_http: job_selection_probe_http,
                        probe_exec: job_selection_probe_exec,
                    },
                    capacity: CapacityManagerConfig {
                        resource_limit_total: ResourceUsageConfig {
                            cpu: limit_total_cpu,
                            memory: limit_total_memory,
                            gpu: limit_total_gpu,
                        },
                        resource_limit_job: ResourceUsageConfig {
                            cpu: limit_job_cpu,
                            memory: limit_job_memory,
                            gpu: limit_job_gpu,
                        },
                    },
                },
                requester: RequesterNodeConfig::default(),
            };
            serve(config, ipfs_connect).await
        }
    }
}

async fn apply(
    filename: &std::path::Path,
    concurrency: u32,
    labels: &[String],
    api: &str,
) -> FlotillaResult<()> {
    let file = parse_job_file(filename)?;
    let (spec, deal) = construct_job(&file, concurrency, labels)?;
    let client = ApiClient::new(api);
    let job = client.submit(spec, deal, whoami()).await?;
    println!("{}", job.id);
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

// --- describe output shapes -------------------------------------------------

#[derive(Serialize)]
struct EventDescription {
    #[serde(rename = "Event")]
    event: String,
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "SourceNode")]
    source_node: String,
    #[serde(rename = "TargetNode")]
    target_node: String,
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Serialize)]
struct LocalEventDescription {
    #[serde(rename = "Event")]
    event: String,
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Serialize)]
struct ShardNodeStateDescription {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ResultID")]
    result_id: String,
}

#[derive(Serialize)]
struct ShardStateDescription {
    #[serde(rename = "ShardIndex")]
    shard_index: u32,
    #[serde(rename = "Nodes")]
    nodes: Vec<ShardNodeStateDescription>,
}

#[derive(Serialize)]
struct JobDescription {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "ClientID")]
    client_id: String,
    #[serde(rename = "RequesterNodeId")]
    requester_node_id: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Spec")]
    spec: flotilla::JobSpec,
    #[serde(rename = "Deal")]
    deal: flotilla::JobDeal,
    #[serde(rename = "Shards")]
    shards: Vec<ShardStateDescription>,
    #[serde(rename = "Start Time")]
    created_at: String,
    #[serde(rename = "Events")]
    events: Vec<EventDescription>,
    #[serde(rename = "LocalEvents")]
    local_events: Vec<LocalEventDescription>,
}

async fn describe(id: &str, api: &str) -> FlotillaResult<()> {
    let client = ApiClient::new(api);
    let job = client.get(id).await.map_err(|e| match e {
        FlotillaError::NotFound(_) => {
            FlotillaError::NotFound(format!("no job ID found matching ID: {}", id))
        }
        other => other,
    })?;
    let state = client.get_job_state(&job.id.to_string()).await?;
    let events = client.get_events(&job.id.to_string()).await?;
    let local_events = client.get_local_events(&job.id.to_string()).await?;

    let mut shards: Vec<ShardStateDescription> = Vec::new();
    for slot in state.flatten() {
        if shards.last().map(|s| s.shard_index) != Some(slot.shard_index) {
            shards.push(ShardStateDescription {
                shard_index: slot.shard_index,
                nodes: Vec::new(),
            });
        }
        if let Some(shard) = shards.last_mut() {
            shard.nodes.push(ShardNodeStateDescription {
                node: slot.node_id.to_string(),
                state: slot.state.to_string(),
                status: slot.status.clone(),
                result_id: slot.results_id.clone(),
            });
        }
    }

    let description = JobDescription {
        id: job.id.to_string(),
        client_id: job.client_id.to_string(),
        requester_node_id: job.requester_node_id.to_string(),
        state: state.kind.to_string(),
        spec: job.spec.clone(),
        deal: job.deal.clone(),
        shards,
        created_at: job.created_at.to_rfc3339(),
        events: events
            .iter()
            .map(|e| EventDescription {
                event: e.kind.to_string(),
                time: e.event_time.to_rfc3339(),
                source_node: e.source_node_id.to_string(),
                target_node: e
                    .target_node_id
                    .as_ref()
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                status: e.status.clone(),
            })
            .collect(),
        local_events: local_events
            .iter()
            .map(|e| LocalEventDescription {
                event: e.kind.to_string(),
                status: e.status.clone(),
            })
            .collect(),
    };

    let rendered = serde_yaml::to_string(&description)
        .map_err(|e| FlotillaError::Fatal(format!("failed to render description: {}", e)))?;
    print!("{}", rendered);
    Ok(())
}

async fn serve(config: NodeConfig, blob_root: Option<PathBuf>) -> FlotillaResult<()> {
    let shutdown = ShutdownHandle::new();

    let transport = Libp2pTransport::new(config.transport.clone(), shutdown.token())?;
    let store = Arc::new(InMemoryJobStore::new());
    let controller = Controller::new(store, transport);

    let blob_root =
        blob_root.unwrap_or_else(|| std::env::temp_dir().join("flotilla-blobs"));
    let blob_store = Arc::new(LocalBlobStore::new(blob_root)?);

    let storage = StorageRegistry::new()
        .register(
            StorageSourceKind::Ipfs,
            Arc::new(BlobStorageProvider::new(blob_store.clone())?),
        )
        .register(
            StorageSourceKind::UrlDownload,
            Arc::new(UrlDownloadProvider::new()?),
        );
    // The container runtime is an external collaborator; the engines
    // registered here are what this build can actually run.
    let executors = ExecutorRegistry::new().register(
        EngineKind::Noop,
        Arc::new(NoopExecutor::new(NoopExecutorConfig::default())?),
    );
    let verifiers = VerifierRegistry::new()
        .register(VerifierKind::Noop, Arc::new(NoopVerifier::new()))
        .register(
            VerifierKind::Blob,
            Arc::new(BlobVerifier::new(blob_store.clone())),
        );

    controller.start(shutdown.token());
    let compute = ComputeNode::new(
        controller.clone(),
        config.compute.clone(),
        executors,
        verifiers.clone(),
        storage,
    )?;
    compute.start(shutdown.token());
    let requester = RequesterNode::new(
        controller.clone(),
        verifiers,
        config.requester.clone(),
    );
    requester.start(shutdown.token());

    serve_api(
        &config.api,
        ApiState {
            controller: controller.clone(),
        },
        shutdown.token(),
    )
    .await?;
    if let Some(port) = config.metrics_port {
        serve_livez(port, shutdown.token()).await?;
    }

    info!("flotilla node started - peer id is: {}", controller.host_id());

    shutdown_signal().await;
    info!("shutting down");
    shutdown.trigger();
    // Give cleanup callbacks a moment to publish their goodbyes.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(())
}
