//! swarmlog-e2e: end-to-end test harness binary.
//!
//! `create`, `seed` and `download` each drive one role, configured through
//! `SWARMLOG_E2E_*` environment variables and wired to the in-process
//! backend; deployments embedding the harness against a production
//! backend use the library crate directly. `local` runs the whole
//! creator/seeder/downloader constellation inside one process and exits
//! once the downloader holds the full log.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swarmlog_api::{LogStore, MetricsClient, MetricsConfig};
use swarmlog_e2e::{
    run_creator, run_downloader, run_seeder, Backend, CreatorConfig, DownloaderBackend,
    DownloaderConfig, ExpectedShape, HarnessError, SeederConfig,
};
use swarmlog_memory::{LoopbackMetricsClient, MemoryLogStore, MemoryNetwork, MemorySwarm};

const LOCAL_RUN_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "swarmlog-e2e", about = "End-to-end test harness for swarmlog replication")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Originate, grow and serve the test log
    Create,
    /// Fully mirror the test log and re-serve it to peers
    Seed,
    /// Fetch the test log into ephemeral storage and verify it
    Download,
    /// Run creator, seeder and downloader together over the in-process backend
    Local {
        /// Target entry count
        #[arg(long, default_value_t = 100)]
        length: u64,
        /// Block size in bytes
        #[arg(long, default_value_t = 4096)]
        block_size: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Create => create().await,
        Command::Seed => seed().await,
        Command::Download => download().await,
        Command::Local { length, block_size } => local(length, block_size).await,
    };
    std::process::exit(code);
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn store_seed(location: &Path) -> [u8; 32] {
    *blake3::hash(location.to_string_lossy().as_bytes()).as_bytes()
}

fn metrics_client(config: Option<MetricsConfig>) -> Option<Arc<dyn MetricsClient>> {
    config.map(|config| Arc::new(LoopbackMetricsClient::new(config)) as Arc<dyn MetricsClient>)
}

fn report(result: Result<(), HarnessError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(error) => {
            error!(%error, "harness run failed");
            1
        }
    }
}

async fn create() -> i32 {
    let config = match CreatorConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return 1;
        }
    };
    init_tracing(&config.log_level);
    let backend = Backend {
        store: Arc::new(MemoryLogStore::new(store_seed(&config.store_loc))),
        swarm: Arc::new(MemorySwarm::new(MemoryNetwork::new())),
        metrics: metrics_client(config.metrics.clone()),
    };
    report(run_creator(config, backend, CancellationToken::new()).await)
}

async fn seed() -> i32 {
    let config = match SeederConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return 1;
        }
    };
    init_tracing(&config.log_level);
    let backend = Backend {
        store: Arc::new(MemoryLogStore::new(store_seed(&config.store_loc))),
        swarm: Arc::new(MemorySwarm::new(MemoryNetwork::new())),
        metrics: metrics_client(config.metrics.clone()),
    };
    report(run_seeder(config, backend, CancellationToken::new()).await)
}

async fn download() -> i32 {
    let config = match DownloaderConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return 1;
        }
    };
    init_tracing(&config.log_level);
    let backend = DownloaderBackend {
        make_store: Box::new(|path| {
            Arc::new(MemoryLogStore::new(store_seed(path))) as Arc<dyn LogStore>
        }),
        swarm: Arc::new(MemorySwarm::new(MemoryNetwork::new())),
        metrics: metrics_client(config.metrics.clone()),
    };
    report(run_downloader(config, backend, CancellationToken::new()).await)
}

async fn local(length: u64, block_size: u64) -> i32 {
    init_tracing("info");
    match run_local(length, block_size).await {
        Ok(()) => 0,
        Err(error) => {
            error!(error = %format!("{error:#}"), "local run failed");
            1
        }
    }
}

async fn run_local(length: u64, block_size: u64) -> anyhow::Result<()> {
    let shape = ExpectedShape::new(length, block_size)?;
    let network = MemoryNetwork::new();
    let root = CancellationToken::new();

    let creator_store = MemoryLogStore::new(rand::random());
    let creator_config = CreatorConfig {
        shape,
        store_loc: "local-creator".into(),
        log_level: "info".into(),
        timeout: None,
        console: false,
        metrics: None,
    };
    let key = creator_store.name_key(&creator_config.log_name());
    info!(%key, blocks = length, "starting local constellation");

    let creator = tokio::spawn(run_creator(
        creator_config,
        Backend {
            store: Arc::new(creator_store),
            swarm: Arc::new(MemorySwarm::new(network.clone())),
            metrics: None,
        },
        root.child_token(),
    ));

    let seeder = tokio::spawn(run_seeder(
        SeederConfig {
            key,
            shape,
            store_loc: "local-seeder".into(),
            log_level: "info".into(),
            timeout: None,
            metrics: None,
        },
        Backend {
            store: Arc::new(MemoryLogStore::new(rand::random())),
            swarm: Arc::new(MemorySwarm::new(network.clone())),
            metrics: None,
        },
        root.child_token(),
    ));

    let downloader_store = MemoryLogStore::new(rand::random());
    let observed = downloader_store.clone();
    let downloader = tokio::spawn(run_downloader(
        DownloaderConfig {
            key,
            shape,
            log_level: "info".into(),
            timeout: None,
            console: false,
            metrics: None,
        },
        DownloaderBackend {
            make_store: Box::new(move |_| Arc::new(downloader_store) as Arc<dyn LogStore>),
            swarm: Arc::new(MemorySwarm::new(network)),
            metrics: None,
        },
        root.child_token(),
    ));

    let target = observed.open_by_key(key).await?;
    let filled = async {
        while target.contiguous_length() < length {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(LOCAL_RUN_DEADLINE, filled).await.is_err() {
        root.cancel();
        bail!("local run did not complete within {}s", LOCAL_RUN_DEADLINE.as_secs());
    }
    info!(blocks = target.contiguous_length(), "local download complete; shutting down");
    root.cancel();

    for (name, task) in [("creator", creator), ("seeder", seeder), ("downloader", downloader)] {
        task.await.with_context(|| format!("{name} task panicked"))??;
    }
    Ok(())
}
