//! Distributor service entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use distributor::api::HttpApi;
use distributor::config::{
    ClusterConfig, DistributorSection, ExecutorConfig, HttpConfig, LogConfig, MaintenanceConfig,
};
use distributor::{Distributor, DistributorConfig, LoggingOperationHandler};

/// Distributor - bucket maintenance scheduler
#[derive(Parser, Debug)]
#[command(name = "distributor")]
#[command(about = "Bucket maintenance scheduling for a replicated document store")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Distributor index
    #[arg(short, long)]
    index: Option<u16>,

    /// Number of storage nodes
    #[arg(long)]
    nodes: Option<u16>,

    /// Redundancy target
    #[arg(long)]
    redundancy: Option<u32>,

    /// Executor lanes
    #[arg(long)]
    lanes: Option<usize>,

    /// Maintenance pass interval (milliseconds)
    #[arg(long)]
    pass_interval_ms: Option<u64>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Command line values as a config overlay; zero means "not given"
    fn overrides(&self) -> DistributorConfig {
        DistributorConfig {
            distributor: DistributorSection {
                index: self.index.unwrap_or(0),
                region: None,
            },
            cluster: ClusterConfig {
                node_count: self.nodes.unwrap_or(0),
                disks_per_node: 0,
                redundancy: self.redundancy.unwrap_or(0),
            },
            maintenance: MaintenanceConfig {
                split_document_count: 0,
                split_total_size: 0,
                join_document_count: 0,
                join_total_size: 0,
                gc_meta_ratio: 0.0,
                merge_backpressure_ceiling: 0,
                min_used_bits: 0,
                pass_interval_ms: self.pass_interval_ms.unwrap_or(0),
                drain_after_pass: false,
            },
            executor: ExecutorConfig {
                lanes: self.lanes.unwrap_or(0),
            },
            http: self
                .http_addr
                .clone()
                .map(|listen_addr| HttpConfig { listen_addr }),
            log: LogConfig {
                level: self.log_level.clone().unwrap_or_default(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DistributorConfig::from_file(path)?,
        None => DistributorConfig::default(),
    };
    config.merge(args.overrides());

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting distributor {}...", config.distributor.index);
    info!("  Nodes: {}", config.cluster.node_count);
    info!("  Redundancy: {}", config.cluster.redundancy);
    info!("  Lanes: {}", config.executor.lanes);
    info!("  Pass interval: {:?}", config.maintenance.pass_interval());

    let http = config.http.clone();
    let distributor = Arc::new(Distributor::new(config, Arc::new(LoggingOperationHandler))?);
    let _handles = distributor.start();

    match http {
        Some(http) => {
            let api = HttpApi::new(distributor.clone());
            tokio::select! {
                result = api.serve(&http.listen_addr) => {
                    if let Err(e) = result {
                        warn!("HTTP API stopped: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
        }
    }

    distributor.shutdown().await;
    Ok(())
}
