//! Cluster coordination
//!
//! The coordinator is responsible for:
//! - Cluster metadata layout (clusters, nodes, resource groups)
//! - Placement decisions (balanced preference lists per partition)
//! - Group commit of high-frequency participant reports
//! - Durable metadata storage (RocksDB)

pub mod admin;
pub mod group_commit;
pub mod metadata;
pub mod paths;
pub mod placement;
pub mod state_model;

pub use admin::ClusterAdmin;
pub use group_commit::{CommitObserver, GroupCommit, LoggingObserver};
pub use metadata::RocksStore;
pub use placement::compute_placement;
