//! CLI for cluster setup and inspection

use clap::{Parser, Subcommand};
use clustermgr::common::Config;
use clustermgr::coordinator::{paths, state_model, ClusterAdmin, RocksStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clustermgr")]
#[command(about = "clustermgr cluster setup CLI")]
#[command(version)]
struct Cli {
    /// Database directory (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster
    AddCluster {
        cluster: String,

        /// Replace an existing cluster of the same name
        #[arg(long)]
        overwrite: bool,
    },

    /// Add nodes, given as "host:port" or "host1:port1;host2:port2"
    AddNode { cluster: String, addresses: String },

    /// Add a resource group
    AddResourceGroup {
        cluster: String,
        resource: String,
        partitions: usize,

        #[arg(default_value = state_model::MASTER_SLAVE)]
        state_model: String,
    },

    /// Recompute the placement of a resource group
    Rebalance {
        cluster: String,
        resource: String,
        replicas: usize,
    },

    /// Enable or disable a node
    EnableNode {
        cluster: String,
        node: String,

        #[arg(action = clap::ArgAction::Set, default_value = "true")]
        enabled: bool,
    },

    /// Remove a resource group
    DropResourceGroup { cluster: String, resource: String },

    /// List clusters
    ListClusters,

    /// List nodes of a cluster
    ListNodes { cluster: String },

    /// List resource groups of a cluster
    ListResourceGroups { cluster: String },

    /// Show where each partition's master and slaves are placed
    ResourceInfo { cluster: String, resource: String },

    /// Report a partition replica's current state through group commit
    ReportState {
        cluster: String,
        node: String,
        resource: String,
        partition: String,
        state: String,

        /// Print group commit metrics (Prometheus text) afterwards
        #[arg(long)]
        metrics: bool,
    },

    /// Print the record stored at a path
    Show { path: String },

    /// Create a test cluster: 6 nodes, TestDB with 10 partitions, 3 replicas
    SetupTestCluster {
        #[arg(default_value = "storage-integration-cluster")]
        cluster: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // An explicit config file must load; the default location is optional
    let mut config = match &cli.config {
        Some(path) => Config::from_sources(Some(path))?,
        None => Config::load(),
    };
    if let Some(db) = cli.db {
        config.store.db_path = db;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::debug!("Opening store at {:?}", config.store.db_path);
    let store = Arc::new(RocksStore::open(&config.store.db_path)?);
    let admin = ClusterAdmin::new(store.clone(), &config)?;

    match cli.command {
        Commands::AddCluster { cluster, overwrite } => {
            admin.add_cluster(&cluster, overwrite).await?;
            println!("Added cluster {}", cluster);
        }

        Commands::AddNode { cluster, addresses } => {
            for node in admin.add_nodes(&cluster, &addresses).await? {
                println!("Added node {}", node);
            }
        }

        Commands::AddResourceGroup {
            cluster,
            resource,
            partitions,
            state_model,
        } => {
            admin
                .add_resource_group(&cluster, &resource, partitions, &state_model)
                .await?;
            println!("Added resource group {}", resource);
        }

        Commands::Rebalance {
            cluster,
            resource,
            replicas,
        } => {
            let ideal_state = admin.rebalance(&cluster, &resource, replicas).await?;
            println!("{}", serde_json::to_string_pretty(&ideal_state)?);
        }

        Commands::EnableNode {
            cluster,
            node,
            enabled,
        } => {
            admin.enable_node(&cluster, &node, enabled).await?;
            println!("Node {} enabled={}", node, enabled);
        }

        Commands::DropResourceGroup { cluster, resource } => {
            admin.drop_resource_group(&cluster, &resource).await?;
            println!("Dropped resource group {}", resource);
        }

        Commands::ListClusters => {
            println!("Existing clusters:");
            for cluster in admin.list_clusters().await? {
                println!("  {}", cluster);
            }
        }

        Commands::ListNodes { cluster } => {
            println!("Nodes in cluster {}:", cluster);
            for node in admin.list_nodes(&cluster).await? {
                println!("  {}", node);
            }
        }

        Commands::ListResourceGroups { cluster } => {
            println!("Existing resources in cluster {}:", cluster);
            for resource in admin.list_resource_groups(&cluster).await? {
                println!("  {}", resource);
            }
        }

        Commands::ResourceInfo { cluster, resource } => {
            for (partition, roles) in admin.partition_roles(&cluster, &resource).await? {
                let placed: Vec<String> = roles
                    .iter()
                    .map(|(node, state)| format!("{}={}", node, state))
                    .collect();
                println!("{}: {}", partition, placed.join(", "));
            }
        }

        Commands::ReportState {
            cluster,
            node,
            resource,
            partition,
            state,
            metrics,
        } => {
            admin.report_current_state(&cluster, &node, &resource, &partition, &state);
            let path = paths::current_state(&cluster, &node, &resource);
            while !admin.group_commit().is_idle(&path) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            println!("Reported {} {} on {}", partition, state, node);
            if metrics {
                print!("{}", admin.group_commit().metrics().to_prometheus());
            }
        }

        Commands::Show { path } => match admin.read(&path).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("No record at {}", path),
        },

        Commands::SetupTestCluster { cluster } => {
            admin.setup_test_cluster(&cluster).await?;
            println!("Set up test cluster {}", cluster);
        }
    }

    store.flush()?;
    Ok(())
}
