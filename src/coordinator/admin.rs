//! Cluster administration over a versioned store
//!
//! Administrative changes (clusters, nodes, resource groups, rebalancing) are
//! infrequent and go straight to the store with conditional writes.
//! High-frequency participant reports go through group commit.

use crate::common::{
    new_session_id, timestamp_now_millis, AuditEventType, AuditLogger, Config, Error, NodeAddress,
    Record, Result, VersionedStore,
};
use crate::coordinator::group_commit::{CommitObserver, GroupCommit};
use crate::coordinator::placement::{compute_placement, preference_lists};
use crate::coordinator::{paths, state_model};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const HOST_FIELD: &str = "HOST";
pub const PORT_FIELD: &str = "PORT";
pub const ENABLED_FIELD: &str = "ENABLED";
pub const PARTITIONS_FIELD: &str = "partitions";
pub const STATE_MODEL_FIELD: &str = "stateModel";
pub const CURRENT_STATE_FIELD: &str = "CURRENT_STATE";
pub const SESSION_ID_FIELD: &str = "SESSION_ID";
pub const LIVE_SINCE_FIELD: &str = "LIVE_SINCE";

/// Conflicting writers a read-modify-write tolerates before giving up
const MAX_UPDATE_ATTEMPTS: usize = 16;

/// Transient store failures a single admin call retries
const STORE_RETRIES: usize = 3;

/// Administrative operations on clusters held in a [`VersionedStore`]
pub struct ClusterAdmin<S> {
    store: Arc<S>,
    group_commit: GroupCommit<S>,
    audit: Arc<AuditLogger>,
    store_retry_delay: Duration,
}

impl<S: VersionedStore> ClusterAdmin<S> {
    /// Build an admin and its group commit. Must run inside a tokio runtime.
    pub fn new(store: Arc<S>, config: &Config) -> Result<Self> {
        let audit = match &config.audit_log {
            Some(path) => AuditLogger::with_file(path)?,
            None => AuditLogger::new(),
        };
        let group_commit = GroupCommit::new(store.clone(), config.group_commit.clone())?;
        Ok(Self {
            store,
            group_commit,
            audit: Arc::new(audit),
            store_retry_delay: config.group_commit.initial_backoff(),
        })
    }

    /// Route group commit store failures to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn CommitObserver>) -> Self {
        self.group_commit = self.group_commit.with_observer(observer);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn group_commit(&self) -> &GroupCommit<S> {
        &self.group_commit
    }

    // === Clusters ===

    /// Create a cluster and its MasterSlave state model. With `overwrite`, an
    /// existing cluster of the same name is removed first.
    pub async fn add_cluster(&self, cluster: &str, overwrite: bool) -> Result<()> {
        paths::validate_name("cluster", cluster)?;
        let root = paths::cluster(cluster);

        if self.read(&root).await?.is_some() {
            if !overwrite {
                return Err(Error::ClusterExists(cluster.to_string()));
            }
            let removed = self.delete_tree(&root).await?;
            tracing::info!("Removed {} record(s) of existing cluster {}", removed, cluster);
        }

        let mut record = Record::new(cluster);
        record.set_simple_field("CREATED_AT", timestamp_now_millis().to_string());
        self.store.create(&root, record).await?;
        tracing::info!("Added cluster {}", cluster);
        self.audit
            .log_event(AuditEventType::ClusterAdded, cluster, None, "cluster added", None);

        self.add_state_model_def(cluster, state_model::MASTER_SLAVE, state_model::master_slave())
            .await
    }

    pub async fn list_clusters(&self) -> Result<Vec<String>> {
        self.store.children("").await
    }

    // === Nodes ===

    /// Register a node given as `host:port`. Returns the node id (`host_port`).
    pub async fn add_node(&self, cluster: &str, address: &str) -> Result<String> {
        let address = NodeAddress::parse(address).inspect_err(|e| {
            tracing::warn!("{}", e);
        })?;
        self.require_cluster(cluster).await?;

        let node_id = address.node_id();
        paths::validate_name("node", &node_id)?;
        let mut config = Record::new(node_id.clone());
        config.set_simple_field(HOST_FIELD, address.host.clone());
        config.set_simple_field(PORT_FIELD, address.port.to_string());
        config.set_simple_field(ENABLED_FIELD, "true");

        self.store
            .create(&paths::instance_config(cluster, &node_id), config)
            .await?;
        tracing::info!("Added node {} to cluster {}", node_id, cluster);
        self.audit.log_event(
            AuditEventType::NodeAdded,
            cluster,
            Some(&node_id),
            "node added",
            Some(serde_json::json!({ "host": address.host, "port": address.port })),
        );
        Ok(node_id)
    }

    /// Register every non-empty `host:port` entry of a `;`-separated list.
    pub async fn add_nodes(&self, cluster: &str, addresses: &str) -> Result<Vec<String>> {
        let mut added = Vec::new();
        for address in addresses.split(';').map(str::trim).filter(|a| !a.is_empty()) {
            added.push(self.add_node(cluster, address).await?);
        }
        Ok(added)
    }

    pub async fn list_nodes(&self, cluster: &str) -> Result<Vec<String>> {
        self.require_cluster(cluster).await?;
        self.store.children(&paths::configs(cluster)).await
    }

    pub async fn enable_node(&self, cluster: &str, node: &str, enabled: bool) -> Result<()> {
        let path = paths::instance_config(cluster, node);
        self.update_record(&path, |config| {
            config.set_simple_field(ENABLED_FIELD, enabled.to_string());
            Ok(())
        })
        .await?;

        let event = if enabled {
            AuditEventType::NodeEnabled
        } else {
            AuditEventType::NodeDisabled
        };
        tracing::info!("Set {}={} on node {} in {}", ENABLED_FIELD, enabled, node, cluster);
        self.audit
            .log_event(event, cluster, Some(node), format!("enabled={}", enabled), None);
        Ok(())
    }

    // === State models ===

    pub async fn add_state_model_def(&self, cluster: &str, name: &str, def: Record) -> Result<()> {
        paths::validate_name("state model", name)?;
        state_model::validate(&def)?;
        self.require_cluster(cluster).await?;
        self.store
            .create(&paths::state_model_def(cluster, name), def)
            .await?;
        self.audit.log_event(
            AuditEventType::StateModelAdded,
            cluster,
            Some(name),
            "state model added",
            None,
        );
        Ok(())
    }

    // === Resource groups ===

    pub async fn add_resource_group(
        &self,
        cluster: &str,
        resource: &str,
        partitions: usize,
        state_model: &str,
    ) -> Result<()> {
        paths::validate_name("resource", resource)?;
        if partitions < 1 {
            return Err(Error::InvalidPartitionCount(partitions));
        }
        self.require_cluster(cluster).await?;

        let mut ideal_state = Record::new(resource);
        ideal_state.set_simple_field(PARTITIONS_FIELD, partitions.to_string());
        ideal_state.set_simple_field(STATE_MODEL_FIELD, state_model);
        self.store
            .create(&paths::ideal_state(cluster, resource), ideal_state)
            .await?;

        tracing::info!(
            "Added resource group {} ({} partitions, {}) to {}",
            resource,
            partitions,
            state_model,
            cluster
        );
        self.audit.log_event(
            AuditEventType::ResourceGroupAdded,
            cluster,
            Some(resource),
            "resource group added",
            Some(serde_json::json!({ "partitions": partitions, "stateModel": state_model })),
        );
        Ok(())
    }

    pub async fn drop_resource_group(&self, cluster: &str, resource: &str) -> Result<()> {
        let path = paths::ideal_state(cluster, resource);
        if !self.store.delete(&path).await? {
            return Err(Error::NotFound(path));
        }
        self.audit.log_event(
            AuditEventType::ResourceGroupDropped,
            cluster,
            Some(resource),
            "resource group dropped",
            None,
        );
        Ok(())
    }

    pub async fn list_resource_groups(&self, cluster: &str) -> Result<Vec<String>> {
        self.require_cluster(cluster).await?;
        self.store.children(&paths::ideal_states(cluster)).await
    }

    /// Recompute the placement of `resource` over the cluster's nodes and
    /// merge it into the stored ideal state. Fields unrelated to placement
    /// (`partitions`, `stateModel`, ...) are preserved. Returns the record
    /// as written.
    pub async fn rebalance(&self, cluster: &str, resource: &str, replicas: usize) -> Result<Record> {
        let nodes = self.list_nodes(cluster).await?;
        let path = paths::ideal_state(cluster, resource);

        let written = self
            .update_record(&path, |ideal_state| {
                let partitions = partition_count(ideal_state)?;
                let placement = compute_placement(&nodes, partitions, replicas, resource)?;
                ideal_state.merge(placement);
                Ok(())
            })
            .await?;

        tracing::info!(
            "Rebalanced {} in {} across {} node(s) with {} replica(s)",
            resource,
            cluster,
            nodes.len(),
            replicas
        );
        self.audit.log_event(
            AuditEventType::Rebalanced,
            cluster,
            Some(resource),
            "resource rebalanced",
            Some(serde_json::json!({ "replicas": replicas, "nodes": nodes.len() })),
        );
        Ok(written)
    }

    /// Role each node is expected to play per partition, from the stored
    /// ideal state: partition → (node → state).
    pub async fn partition_roles(
        &self,
        cluster: &str,
        resource: &str,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let path = paths::ideal_state(cluster, resource);
        let ideal_state = self.read(&path).await?.ok_or(Error::NotFound(path))?;
        let partitions = partition_count(&ideal_state)?;

        Ok(preference_lists(&ideal_state, resource, partitions)
            .into_iter()
            .map(|(partition, nodes)| {
                let roles = nodes
                    .iter()
                    .enumerate()
                    .map(|(pos, node)| (node.clone(), state_model::target_state(pos).to_string()))
                    .collect();
                (partition, roles)
            })
            .collect())
    }

    /// Six nodes `localhost:8900..8905` and resource group `TestDB`
    /// (10 partitions, MasterSlave) rebalanced with 3 replicas.
    pub async fn setup_test_cluster(&self, cluster: &str) -> Result<()> {
        self.add_cluster(cluster, true).await?;
        let addresses: Vec<String> = (0..6).map(|i| format!("localhost:{}", 8900 + i)).collect();
        self.add_nodes(cluster, &addresses.join(";")).await?;
        self.add_resource_group(cluster, "TestDB", 10, state_model::MASTER_SLAVE)
            .await?;
        self.rebalance(cluster, "TestDB", 3).await?;
        Ok(())
    }

    // === Participant reports (group committed) ===

    /// Report the current state of one partition replica. Fire-and-forget.
    pub fn report_current_state(
        &self,
        cluster: &str,
        node: &str,
        resource: &str,
        partition: &str,
        state: &str,
    ) {
        let mut partial = Record::new(resource);
        partial.set_map_entry(partition, CURRENT_STATE_FIELD, state);
        self.group_commit
            .commit(&paths::current_state(cluster, node, resource), partial);
    }

    /// Announce a participant session. Generates a session id when none is
    /// given and returns the one used. Fire-and-forget.
    pub fn report_live(&self, cluster: &str, node: &str, session: Option<&str>) -> String {
        let session = session.map(str::to_string).unwrap_or_else(new_session_id);
        let mut partial = Record::new(node);
        partial.set_simple_field(SESSION_ID_FIELD, session.clone());
        partial.set_simple_field(LIVE_SINCE_FIELD, timestamp_now_millis().to_string());
        self.group_commit
            .commit(&paths::live_instance(cluster, node), partial);
        session
    }

    // === Store helpers ===

    pub async fn read(&self, path: &str) -> Result<Option<Record>> {
        let store = &self.store;
        let read = crate::common::utils::retry_with_backoff(
            || store.read(path),
            STORE_RETRIES,
            self.store_retry_delay,
        )
        .await?;
        Ok(read.map(|versioned| versioned.record))
    }

    async fn require_cluster(&self, cluster: &str) -> Result<()> {
        match self.read(&paths::cluster(cluster)).await? {
            Some(_) => Ok(()),
            None => Err(Error::ClusterNotFound(cluster.to_string())),
        }
    }

    /// Read-modify-write `path` with a conditional write, re-reading on
    /// conflict. `modify` may run several times.
    async fn update_record<F>(&self, path: &str, mut modify: F) -> Result<Record>
    where
        F: FnMut(&mut Record) -> Result<()>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self
                .store
                .read(path)
                .await?
                .ok_or_else(|| Error::NotFound(path.to_string()))?;

            let mut record = current.record;
            modify(&mut record)?;

            match self
                .store
                .conditional_write(path, record.clone(), current.version)
                .await
            {
                Ok(version) => {
                    tracing::debug!(path, %version, attempt, "record updated");
                    return Ok(record);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(path, attempt, "conflicting update; re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Internal(format!(
            "gave up updating {} after {} conflicting writes",
            path, MAX_UPDATE_ATTEMPTS
        )))
    }

    /// Delete `path` and everything below it. Returns the number of records
    /// removed.
    async fn delete_tree(&self, path: &str) -> Result<usize> {
        let mut stack = vec![path.to_string()];
        let mut order = Vec::new();
        while let Some(current) = stack.pop() {
            for child in self.store.children(&current).await? {
                stack.push(format!("{}/{}", current, child));
            }
            order.push(current);
        }

        let mut removed = 0;
        for p in order.iter().rev() {
            if self.store.delete(p).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn partition_count(ideal_state: &Record) -> Result<usize> {
    ideal_state
        .simple_field(PARTITIONS_FIELD)
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "ideal state {} has no {} field",
                ideal_state.id(),
                PARTITIONS_FIELD
            ))
        })?
        .parse()
        .map_err(|_| {
            Error::InvalidConfig(format!(
                "ideal state {} has a non-numeric {} field",
                ideal_state.id(),
                PARTITIONS_FIELD
            ))
        })
}
