//! Decay & consolidation engine
//!
//! A sweep is an explicit call that takes the time elapsed since the previous
//! sweep. It runs four phases in a fixed order: decay node strength, decay
//! edges, merge near-duplicates, then evict. Only one sweep may run per store
//! at a time.

use std::collections::HashSet;
use std::sync::{Mutex, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::secs_between;
use crate::error::{Error, Result};
use crate::events::PersistenceEvent;
use crate::graph::{Edge, EdgeKey, EdgeKind, EdgeTable};
use crate::node::{clamp_unit, cosine_similarity, NodeId, NodeStatus};
use crate::store::{evict_locked, NodeStore, NodeTable, Shared};

/// Which node was merged into which survivor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub merged: NodeId,
    pub survivor: NodeId,
    /// Cosine similarity of the two embeddings at merge time
    pub similarity: f32,
    pub merged_at: DateTime<Utc>,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub elapsed: Duration,
    /// Nodes whose strength was decayed
    pub decayed: usize,
    pub edges_pruned: usize,
    pub merges: Vec<MergeRecord>,
    /// Evicted by threshold or by the capacity ceiling, in eviction order
    pub evicted: Vec<NodeId>,
    /// Live nodes remaining after the sweep
    pub live_after: usize,
}

/// Runs decay sweeps over a [`NodeStore`] and its graph
pub struct ConsolidationEngine {
    store: NodeStore,
    sweep_lock: Mutex<()>,
    merges: Mutex<Vec<MergeRecord>>,
}

impl ConsolidationEngine {
    pub fn new(store: NodeStore) -> Self {
        Self {
            store,
            sweep_lock: Mutex::new(()),
            merges: Mutex::new(Vec::new()),
        }
    }

    /// Run one sweep covering `elapsed` time.
    ///
    /// Fails with [`Error::SweepInProgress`] if another sweep is running.
    pub fn sweep(&self, elapsed: Duration) -> Result<SweepReport> {
        let _guard = match self.sweep_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(Error::SweepInProgress),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let shared = self.store.shared();
        let config = &shared.config;
        let mut report = SweepReport {
            elapsed,
            ..Default::default()
        };

        // 1. node strength
        report.decayed = self.decay_nodes(shared, elapsed)?;

        // 2. edge weights
        report.edges_pruned = self.store.graph().decay_edges(elapsed, config.edge_decay_rate)?;

        // 3 - 5 run in one critical section so no reader sees a half-merged pair
        {
            let mut nodes = shared.write_nodes()?;
            let mut edges = shared.write_edges()?;
            let now = shared.clock.now();

            report.merges = consolidate(shared, &mut nodes, &mut edges, now);
            report.evicted = evict_weak(shared, &mut nodes, &mut edges, now)?;
            report.live_after = nodes.len();
        }

        if !report.merges.is_empty() {
            let mut merges = self.merges.lock().unwrap_or_else(|e| e.into_inner());
            merges.extend(report.merges.iter().cloned());
        }

        info!(
            elapsed_secs = elapsed.as_secs_f64(),
            decayed = report.decayed,
            edges_pruned = report.edges_pruned,
            merged = report.merges.len(),
            evicted = report.evicted.len(),
            live = report.live_after,
            "Decay sweep complete"
        );
        Ok(report)
    }

    fn decay_nodes(&self, shared: &Shared, elapsed: Duration) -> Result<usize> {
        let factor = (-shared.config.node_decay_rate * elapsed.as_secs_f64()).exp() as f32;
        if factor >= 1.0 {
            return Ok(0);
        }
        let grace = shared.config.grace_window.as_secs_f64();

        let mut nodes = shared.write_nodes()?;
        let now = shared.clock.now();
        let mut decayed = 0;

        for node in nodes.values_mut() {
            if node.status != NodeStatus::Active {
                continue;
            }
            if secs_between(node.last_accessed_at, now) < grace {
                continue;
            }
            node.strength = clamp_unit(node.strength * factor);
            shared.outbox.push(PersistenceEvent::NodeUpdated(node.clone()));
            decayed += 1;
        }
        Ok(decayed)
    }

    /// Every merge recorded by this engine, oldest first
    pub fn merges(&self) -> Vec<MergeRecord> {
        self.merges.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Follow merge links from `id` to the node that now stands for it
    pub fn resolve(&self, id: NodeId) -> Result<NodeId> {
        let nodes = self.store.shared().read_nodes()?;
        let mut current = id;
        // a chain can never be longer than the table
        for _ in 0..=nodes.len() {
            match nodes.get(&current).and_then(|n| n.merged_into) {
                Some(next) if nodes.is_live(next) => current = next,
                _ => return Ok(current),
            }
        }
        Err(Error::invariant(format!("merge chain starting at {} does not terminate", id)))
    }

    /// Reload merge history, e.g. from a persisted snapshot
    pub fn restore_merges(&self, records: Vec<MergeRecord>) {
        let mut merges = self.merges.lock().unwrap_or_else(|e| e.into_inner());
        *merges = records;
    }
}

/// Merge qualifying pairs. Each node takes part in at most one merge per sweep.
fn consolidate(shared: &Shared, nodes: &mut NodeTable, edges: &mut EdgeTable, now: DateTime<Utc>) -> Vec<MergeRecord> {
    let config = &shared.config;

    let mut candidates: Vec<(f32, EdgeKey, f32)> = edges
        .iter()
        .filter(|e| e.kind == EdgeKind::SemanticSimilarity && e.weight >= config.merge_edge_threshold)
        .filter_map(|e| {
            let a = nodes.get(&e.source)?;
            let b = nodes.get(&e.target)?;
            if a.status != NodeStatus::Active || b.status != NodeStatus::Active {
                return None;
            }
            let similarity = cosine_similarity(&a.embedding, &b.embedding);
            (similarity >= config.merge_similarity_threshold).then_some((e.weight, e.key(), similarity))
        })
        .collect();

    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut involved = HashSet::new();
    let mut records = Vec::new();

    for (_, key, similarity) in candidates {
        if involved.contains(&key.source) || involved.contains(&key.target) {
            continue;
        }
        let (Some(a), Some(b)) = (nodes.get(&key.source), nodes.get(&key.target)) else {
            continue;
        };

        // stronger survives; on equal strength the older one does
        let a_survives = match a.strength.total_cmp(&b.strength) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => a.age_key() <= b.age_key(),
        };
        let (survivor, merged) = if a_survives {
            (key.source, key.target)
        } else {
            (key.target, key.source)
        };

        merge_pair(shared, nodes, edges, survivor, merged);
        involved.insert(survivor);
        involved.insert(merged);

        let record = MergeRecord {
            merged,
            survivor,
            similarity,
            merged_at: now,
        };
        shared.outbox.push(PersistenceEvent::NodeMerged(record.clone()));
        debug!(merged = %merged, survivor = %survivor, similarity, "Consolidated node");
        records.push(record);
    }
    records
}

fn merge_pair(
    shared: &Shared,
    nodes: &mut NodeTable,
    edges: &mut EdgeTable,
    survivor: NodeId,
    merged: NodeId,
) {
    // redirect edges onto the survivor; collisions keep the heavier edge
    for key in edges.keys_of(merged) {
        let Some(edge) = edges.remove(&key) else {
            continue;
        };
        shared.outbox.push(PersistenceEvent::EdgeRemoved(key));

        let moved = key.rekey(merged, survivor);
        if moved.source == moved.target {
            continue;
        }
        let combined = edges.merge_in(Edge {
            source: moved.source,
            target: moved.target,
            ..edge
        });
        shared.outbox.push(PersistenceEvent::EdgeUpdated(combined));
    }

    let (access_count, last_accessed_at) = match nodes.get_mut(&merged) {
        Some(node) => {
            node.status = NodeStatus::Consolidated;
            node.merged_into = Some(survivor);
            let snapshot = node.clone();
            shared.outbox.push(PersistenceEvent::NodeUpdated(snapshot));
            (node.access_count, node.last_accessed_at)
        }
        None => return,
    };

    if let Some(node) = nodes.get_mut(&survivor) {
        node.access_count = node.access_count.saturating_add(access_count);
        if last_accessed_at > node.last_accessed_at {
            node.last_accessed_at = last_accessed_at;
        }
        let snapshot = node.clone();
        shared.outbox.push(PersistenceEvent::NodeUpdated(snapshot));
    }
}

/// Threshold eviction followed by capacity enforcement
fn evict_weak(
    shared: &Shared,
    nodes: &mut NodeTable,
    edges: &mut EdgeTable,
    now: DateTime<Utc>,
) -> Result<Vec<NodeId>> {
    let config = &shared.config;
    let mut evicted = Vec::new();

    let mut by_weakness: Vec<(f32, (DateTime<Utc>, u64), NodeId)> = nodes
        .values()
        .filter(|n| n.is_live())
        .map(|n| (n.strength, n.age_key(), n.id))
        .collect();
    by_weakness.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut remaining = by_weakness.into_iter().peekable();

    // below the retention threshold, but never past the floor
    while let Some((strength, _, id)) = remaining.peek().copied() {
        if strength >= config.eviction_threshold || nodes.len() <= config.capacity_floor {
            break;
        }
        remaining.next();
        if evict_locked(nodes, edges, &shared.outbox, id, now)? {
            evicted.push(id);
        }
    }

    // weakest-first until within the ceiling
    for (_, _, id) in remaining {
        if nodes.len() <= config.capacity_ceiling {
            break;
        }
        if evict_locked(nodes, edges, &shared.outbox, id, now)? {
            evicted.push(id);
        }
    }

    Ok(evicted)
}
