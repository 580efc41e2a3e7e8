//! # clustermgr
//!
//! Cluster metadata management for partitioned, replicated resources:
//! - Versioned records with compare-and-swap writes (RocksDB or in-memory)
//! - Group commit that coalesces concurrent partial updates per path
//! - Balanced placement of partition replicas across nodes
//! - Cluster setup: clusters, nodes, resource groups, rebalancing
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │            ClusterAdmin / CLI             │
//! │  add-cluster, add-node, rebalance, ...    │
//! └──────┬──────────────────────────┬─────────┘
//!        │ conditional writes       │ partial updates
//!        │                    ┌─────▼──────────┐
//!        │                    │  GroupCommit   │
//!        │                    │ (one committer │
//!        │                    │   per path)    │
//!        │                    └─────┬──────────┘
//! ┌──────▼──────────────────────────▼─────────┐
//! │   VersionedStore (RocksStore / MemStore)  │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Set up a cluster
//! ```bash
//! clustermgr --db ./cluster-data add-cluster storage-cluster
//! clustermgr add-node storage-cluster "localhost:8900;localhost:8901;localhost:8902"
//! clustermgr add-resource-group storage-cluster MyDB 16 MasterSlave
//! clustermgr rebalance storage-cluster MyDB 2
//! ```
//!
//! ### Inspect
//! ```bash
//! clustermgr list-nodes storage-cluster
//! clustermgr show /storage-cluster/IDEALSTATES/MyDB
//! ```
//!
//! ### Embedded
//! ```no_run
//! # async fn run() -> clustermgr::Result<()> {
//! use clustermgr::{ClusterAdmin, Config, MemStore};
//! use std::sync::Arc;
//!
//! let admin = ClusterAdmin::new(Arc::new(MemStore::new()), &Config::default())?;
//! admin.setup_test_cluster("test-cluster").await?;
//! admin.report_current_state("test-cluster", "localhost_8900", "TestDB", "TestDB_0", "MASTER");
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Config, Error, MemStore, Record, Result, Version, VersionedStore};
pub use coordinator::{ClusterAdmin, GroupCommit, RocksStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
