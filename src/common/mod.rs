//! Common utilities and types shared across clustermgr

pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod record;
pub mod storage;
pub mod utils;

pub use audit::{AuditEventType, AuditLogger};
pub use config::{Config, GroupCommitConfig, StoreConfig};
pub use error::{Error, Result};
pub use metrics::MetricsRegistry;
pub use record::{coalesce, Record, Version, VersionedRecord};
pub use storage::{MemStore, VersionedStore};
pub use utils::{new_session_id, timestamp_now_millis, Backoff, NodeAddress};
