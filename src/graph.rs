//! Associative graph between memory nodes
//!
//! Edges live in an index-based adjacency table (node id → edge keys), never
//! as pointers between nodes, so cycles such as A↔B cost nothing. The table is
//! guarded by its own lock, always taken *after* the node table lock; see
//! [`crate::store`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::PersistenceEvent;
use crate::node::{clamp_unit, NodeId};
use crate::store::Shared;

/// Category of an association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// `source` happened before `target`
    TemporalSequence,
    SemanticSimilarity,
    /// `source` caused `target`
    Causal,
    CoOccurrence,
}

impl EdgeKind {
    pub fn is_directed(&self) -> bool {
        matches!(self, EdgeKind::TemporalSequence | EdgeKind::Causal)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::TemporalSequence => write!(f, "temporal_sequence"),
            EdgeKind::SemanticSimilarity => write!(f, "semantic_similarity"),
            EdgeKind::Causal => write!(f, "causal"),
            EdgeKind::CoOccurrence => write!(f, "co_occurrence"),
        }
    }
}

impl std::str::FromStr for EdgeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "temporal_sequence" => Ok(EdgeKind::TemporalSequence),
            "semantic_similarity" => Ok(EdgeKind::SemanticSimilarity),
            "causal" => Ok(EdgeKind::Causal),
            "co_occurrence" => Ok(EdgeKind::CoOccurrence),
            other => Err(Error::validation(format!("Unknown edge kind: {}", other))),
        }
    }
}

/// Identity of an edge. Undirected kinds are stored with the smaller id first,
/// so A–B and B–A are the same edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
}

impl EdgeKey {
    pub fn new(source: NodeId, target: NodeId, kind: EdgeKind) -> Self {
        if !kind.is_directed() && target < source {
            Self {
                source: target,
                target: source,
                kind,
            }
        } else {
            Self {
                source,
                target,
                kind,
            }
        }
    }

    pub fn touches(&self, id: NodeId) -> bool {
        self.source == id || self.target == id
    }

    /// The endpoint opposite `id`
    pub fn other(&self, id: NodeId) -> Option<NodeId> {
        if self.source == id {
            Some(self.target)
        } else if self.target == id {
            Some(self.source)
        } else {
            None
        }
    }

    /// Whether traversing from `from` along this edge is allowed
    pub fn leads_from(&self, from: NodeId) -> bool {
        if self.kind.is_directed() {
            self.source == from
        } else {
            self.touches(from)
        }
    }

    /// Whether this edge points into `to`
    pub fn leads_into(&self, to: NodeId) -> bool {
        if self.kind.is_directed() {
            self.target == to
        } else {
            self.touches(to)
        }
    }

    /// Same edge with `from` replaced by `to`, keeping direction
    pub fn rekey(&self, from: NodeId, to: NodeId) -> Self {
        let source = if self.source == from { to } else { self.source };
        let target = if self.target == from { to } else { self.target };
        Self::new(source, target, self.kind)
    }
}

/// A weighted association between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    /// Association strength in [0, 1]
    pub weight: f32,
    pub created_at: DateTime<Utc>,
    pub last_strengthened_at: DateTime<Utc>,
    /// Monotonic counter value at the last strengthening; higher is more recent
    pub strengthened_seq: u64,
}

impl Edge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: self.source,
            target: self.target,
            kind: self.kind,
        }
    }
}

/// Edge storage guarded by the graph lock
#[derive(Debug, Default)]
pub(crate) struct EdgeTable {
    edges: HashMap<EdgeKey, Edge>,
    adjacency: HashMap<NodeId, BTreeSet<EdgeKey>>,
    next_seq: u64,
}

impl EdgeTable {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn len(&self) -> usize {
        self.edges.len()
    }

    pub(crate) fn get(&self, key: &EdgeKey) -> Option<&Edge> {
        self.edges.get(key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Create the edge or add `increment` to it
    pub(crate) fn strengthen(&mut self, key: EdgeKey, increment: f32, now: DateTime<Utc>) -> Edge {
        let seq = self.bump_seq();
        let edge = self.edges.entry(key).or_insert_with(|| Edge {
            source: key.source,
            target: key.target,
            kind: key.kind,
            weight: 0.0,
            created_at: now,
            last_strengthened_at: now,
            strengthened_seq: seq,
        });
        edge.weight = clamp_unit(edge.weight + increment);
        edge.last_strengthened_at = now;
        edge.strengthened_seq = seq;
        let edge = edge.clone();

        self.adjacency.entry(key.source).or_default().insert(key);
        self.adjacency.entry(key.target).or_default().insert(key);
        edge
    }

    /// Insert an edge as-is, e.g. when restoring. Keeps the higher weight on collision.
    pub(crate) fn merge_in(&mut self, mut edge: Edge) -> Edge {
        let key = edge.key();
        self.next_seq = self.next_seq.max(edge.strengthened_seq);
        edge.weight = clamp_unit(edge.weight);

        let merged = match self.edges.get_mut(&key) {
            Some(existing) => {
                if edge.weight > existing.weight {
                    existing.weight = edge.weight;
                    existing.last_strengthened_at = edge.last_strengthened_at;
                    existing.strengthened_seq = edge.strengthened_seq;
                }
                existing.clone()
            }
            None => {
                self.edges.insert(key, edge.clone());
                edge
            }
        };

        self.adjacency.entry(key.source).or_default().insert(key);
        self.adjacency.entry(key.target).or_default().insert(key);
        merged
    }

    pub(crate) fn remove(&mut self, key: &EdgeKey) -> Option<Edge> {
        let edge = self.edges.remove(key)?;
        for endpoint in [key.source, key.target] {
            if let Some(set) = self.adjacency.get_mut(&endpoint) {
                set.remove(key);
                if set.is_empty() {
                    self.adjacency.remove(&endpoint);
                }
            }
        }
        Some(edge)
    }

    pub(crate) fn keys_of(&self, id: NodeId) -> Vec<EdgeKey> {
        self.adjacency
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove every edge touching `id`
    pub(crate) fn remove_touching(&mut self, id: NodeId) -> Vec<EdgeKey> {
        let keys = self.keys_of(id);
        for key in &keys {
            self.remove(key);
        }
        keys
    }

    pub(crate) fn neighbors(&self, id: NodeId, kind: Option<EdgeKind>, min_weight: f32) -> Vec<(NodeId, f32)> {
        let Some(keys) = self.adjacency.get(&id) else {
            return Vec::new();
        };

        let mut found: Vec<(NodeId, f32, u64)> = keys
            .iter()
            .filter(|k| kind.map_or(true, |want| k.kind == want))
            .filter(|k| k.leads_from(id))
            .filter_map(|k| {
                let edge = self.edges.get(k)?;
                let other = k.other(id)?;
                (edge.weight >= min_weight).then_some((other, edge.weight, edge.strengthened_seq))
            })
            .collect();

        found.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.cmp(&b.0))
        });

        // The same neighbor may be reachable through several kinds; keep its strongest edge
        let mut seen = HashSet::new();
        found
            .into_iter()
            .filter(|(other, _, _)| seen.insert(*other))
            .map(|(other, weight, _)| (other, weight))
            .collect()
    }

    /// Sum of weights of edges into `target` whose other endpoint is in `from`
    pub(crate) fn incoming_weight(&self, target: NodeId, from: &HashSet<NodeId>) -> f32 {
        let Some(keys) = self.adjacency.get(&target) else {
            return 0.0;
        };
        keys.iter()
            .filter(|k| k.leads_into(target))
            .filter(|k| k.other(target).map_or(false, |o| o != target && from.contains(&o)))
            .filter_map(|k| self.edges.get(k))
            .map(|e| e.weight)
            .sum()
    }

    /// Multiply every weight by `factor`, dropping edges that fall below `threshold`.
    /// Returns the surviving (decayed) edges and the removed keys.
    pub(crate) fn decay(&mut self, factor: f32, threshold: f32) -> (Vec<Edge>, Vec<EdgeKey>) {
        let mut decayed = Vec::new();
        let mut doomed = Vec::new();

        for (key, edge) in self.edges.iter_mut() {
            edge.weight = clamp_unit(edge.weight * factor);
            if edge.weight < threshold {
                doomed.push(*key);
            } else {
                decayed.push(edge.clone());
            }
        }
        doomed.sort();
        for key in &doomed {
            self.remove(key);
        }
        decayed.sort_by_key(|e| e.key());
        (decayed, doomed)
    }

    pub(crate) fn total_weight(&self) -> f64 {
        self.edges.values().map(|e| e.weight as f64).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.edges.clear();
        self.adjacency.clear();
        self.next_seq = 0;
    }
}

/// Handle to the associative graph of a store
#[derive(Clone)]
pub struct AssociativeGraph {
    shared: Arc<Shared>,
}

impl AssociativeGraph {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Create or strengthen the edge `source → target` of `kind`.
    ///
    /// Both endpoints must be live nodes.
    pub fn link(&self, source: NodeId, target: NodeId, kind: EdgeKind, weight_increment: f32) -> Result<Edge> {
        if source == target {
            return Err(Error::validation(format!("Self-loop on node {} is not allowed", source)));
        }
        if !weight_increment.is_finite() || weight_increment < 0.0 {
            return Err(Error::validation(format!(
                "Weight increment must be finite and non-negative, got {}",
                weight_increment
            )));
        }

        let nodes = self.shared.read_nodes()?;
        for id in [source, target] {
            if !nodes.is_live(id) {
                return Err(Error::not_found(format!("Node {} is missing or evicted", id)));
            }
        }

        let mut edges = self.shared.write_edges()?;
        let now = self.shared.clock.now();
        let edge = edges.strengthen(EdgeKey::new(source, target, kind), weight_increment, now);
        self.shared.outbox.push(PersistenceEvent::EdgeUpdated(edge.clone()));

        debug!(
            source = %edge.source,
            target = %edge.target,
            kind = %kind,
            weight = edge.weight,
            "Linked nodes"
        );
        Ok(edge)
    }

    /// Neighbors of `id` sorted by weight (descending), most recently
    /// strengthened first on ties. Unknown ids have no neighbors.
    pub fn neighbors(&self, id: NodeId, kind: Option<EdgeKind>, min_weight: f32) -> Result<Vec<(NodeId, f32)>> {
        let edges = self.shared.read_edges()?;
        Ok(edges.neighbors(id, kind, min_weight))
    }

    /// Exponentially decay every edge by `exp(-decay_rate * elapsed)` and
    /// remove edges below the configured prune threshold.
    ///
    /// Returns the number of pruned edges.
    pub fn decay_edges(&self, elapsed: Duration, decay_rate: f64) -> Result<usize> {
        if !decay_rate.is_finite() || decay_rate < 0.0 {
            return Err(Error::validation(format!("Invalid edge decay rate: {}", decay_rate)));
        }
        let factor = (-decay_rate * elapsed.as_secs_f64()).exp() as f32;
        let threshold = self.shared.config.edge_prune_threshold;

        let mut edges = self.shared.write_edges()?;
        let (decayed, pruned) = edges.decay(factor, threshold);

        if factor < 1.0 {
            for edge in decayed {
                self.shared.outbox.push(PersistenceEvent::EdgeUpdated(edge));
            }
        }
        for key in &pruned {
            self.shared.outbox.push(PersistenceEvent::EdgeRemoved(*key));
        }

        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), factor, "Pruned decayed edges");
        }
        Ok(pruned.len())
    }

    /// Remove every edge touching `node_id`. Returns the number removed.
    pub fn prune(&self, node_id: NodeId) -> Result<usize> {
        let mut edges = self.shared.write_edges()?;
        let removed = edges.remove_touching(node_id);
        for key in &removed {
            self.shared.outbox.push(PersistenceEvent::EdgeRemoved(*key));
        }
        Ok(removed.len())
    }

    /// Look up a single edge
    pub fn edge(&self, source: NodeId, target: NodeId, kind: EdgeKind) -> Result<Option<Edge>> {
        let edges = self.shared.read_edges()?;
        Ok(edges.get(&EdgeKey::new(source, target, kind)).cloned())
    }

    /// Every edge touching `id`, in key order
    pub fn edges_of(&self, id: NodeId) -> Result<Vec<Edge>> {
        let edges = self.shared.read_edges()?;
        Ok(edges
            .keys_of(id)
            .iter()
            .filter_map(|k| edges.get(k).cloned())
            .collect())
    }

    /// Snapshot of all edges, in key order
    pub fn all_edges(&self) -> Result<Vec<Edge>> {
        let edges = self.shared.read_edges()?;
        let mut all: Vec<Edge> = edges.iter().cloned().collect();
        all.sort_by_key(|e| e.key());
        Ok(all)
    }

    pub fn edge_count(&self) -> Result<usize> {
        Ok(self.shared.read_edges()?.len())
    }

    pub fn total_weight(&self) -> Result<f64> {
        Ok(self.shared.read_edges()?.total_weight())
    }

    /// Sum of weights of edges into `target` from nodes in `from`
    pub fn incoming_weight(&self, target: NodeId, from: &HashSet<NodeId>) -> Result<f32> {
        Ok(self.shared.read_edges()?.incoming_weight(target, from))
    }
}
