//! Ideal state calculation for partitioned, replicated resources
//!
//! With `n` nodes and `P` partitions, role `j` of partition `i` goes to node
//! `(i + shift[j]) mod n`. Role 0 has shift 0, so partition `i` is led by
//! node `i mod n`. The remaining shifts are chosen from `q = P mod n`:
//! consecutive roles step by `q` so the nodes that pick up an extra
//! partition in one role are followed by the next `q` nodes in the next
//! role, and whenever stepping by `q` would revisit a shift already used the
//! sequence restarts one position further on.
//!
//! For any node list this gives:
//! - leader counts that differ by at most one across nodes,
//! - total replica counts that differ by at most one across nodes,
//! - no node twice in a preference list (shifts are pairwise distinct),
//! - positional determinism: the node list is never sorted or hashed, and the
//!   shifts do not depend on the replica count, so changing only the replica
//!   count extends or truncates each list without moving leaders.

use crate::common::{Error, Record, Result};
use std::collections::BTreeMap;

/// Simple field recording the replica count a placement was computed with
pub const REPLICAS_FIELD: &str = "replicas";

/// Name of partition `index` of `resource`
pub fn partition_name(resource: &str, index: usize) -> String {
    format!("{}_{}", resource, index)
}

/// Compute the placement record for `resource`.
///
/// Returns a record whose id is `resource`, with one list field per
/// partition (`{resource}_{i}` → preference list, leader first) and the
/// simple field [`REPLICAS_FIELD`].
pub fn compute_placement(
    nodes: &[String],
    partition_count: usize,
    replica_count: usize,
    resource: &str,
) -> Result<Record> {
    if nodes.is_empty() {
        return Err(Error::EmptyNodePool);
    }
    if partition_count < 1 {
        return Err(Error::InvalidPartitionCount(partition_count));
    }
    if replica_count < 1 || replica_count > nodes.len() {
        return Err(Error::InvalidReplicationFactor {
            replicas: replica_count,
            nodes: nodes.len(),
        });
    }

    let n = nodes.len();
    let shifts = role_shifts(n, partition_count, replica_count);
    let mut placement = Record::new(resource);
    placement.set_simple_field(REPLICAS_FIELD, replica_count.to_string());

    for partition in 0..partition_count {
        let preference: Vec<String> = shifts
            .iter()
            .map(|shift| nodes[(partition + shift) % n].clone())
            .collect();
        placement.set_list_field(partition_name(resource, partition), preference);
    }

    Ok(placement)
}

/// Offset of each role from the partition index.
///
/// Stepping by `q` visits `n / gcd(q, n)` distinct offsets before repeating;
/// each such run covers every node the same number of times. Run `m` starts
/// at offset `m`, which keeps offsets distinct across runs because every
/// offset in run `m` is congruent to `m` modulo `gcd(q, n)`.
fn role_shifts(nodes: usize, partitions: usize, replicas: usize) -> Vec<usize> {
    let q = partitions % nodes;
    let per_run = nodes / gcd(q, nodes);
    (0..replicas)
        .map(|role| (role / per_run + (role % per_run) * q) % nodes)
        .collect()
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Preference lists of a placement (or stored ideal state), in partition order.
pub fn preference_lists<'a>(
    record: &'a Record,
    resource: &str,
    partition_count: usize,
) -> Vec<(String, &'a [String])> {
    (0..partition_count)
        .filter_map(|i| {
            let name = partition_name(resource, i);
            record.list_field(&name).map(|list| (name, list))
        })
        .collect()
}

/// How many partitions each node leads
pub fn leader_counts(record: &Record) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for list in record.list_fields().values() {
        if let Some(leader) = list.first() {
            *counts.entry(leader.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// How many preference lists each node appears in (any role)
pub fn replica_counts(record: &Record) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for list in record.list_fields().values() {
        for node in list {
            *counts.entry(node.clone()).or_insert(0) += 1;
        }
    }
    counts
}
