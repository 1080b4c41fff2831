//! Node store: the authoritative table of memory nodes
//!
//! The node table and the edge table each sit behind their own `RwLock`.
//! Whenever both are needed the node table is locked first, which is what
//! lets eviction prune edges and remove the node inside one critical section
//! without risking a deadlock against [`AssociativeGraph::link`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventOutbox, PersistenceEvent, Snapshot};
use crate::graph::{AssociativeGraph, EdgeTable};
use crate::node::{clamp_unit, validate_embedding, Content, MemoryNode, NewNode, NodeId, NodeStatus};

/// Live nodes plus the ids of every node ever evicted
#[derive(Debug, Default)]
pub(crate) struct NodeTable {
    nodes: HashMap<NodeId, MemoryNode>,
    tombstones: HashMap<NodeId, DateTime<Utc>>,
    next_sequence: u64,
}

impl NodeTable {
    pub(crate) fn get(&self, id: &NodeId) -> Option<&MemoryNode> {
        self.nodes.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Option<&mut MemoryNode> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn is_live(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map_or(false, |n| n.is_live())
    }

    pub(crate) fn is_evicted(&self, id: NodeId) -> bool {
        self.tombstones.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &MemoryNode> {
        self.nodes.values()
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut MemoryNode> {
        self.nodes.values_mut()
    }

    fn fresh_id(&self) -> NodeId {
        loop {
            let id = NodeId::new();
            if !self.nodes.contains_key(&id) && !self.tombstones.contains_key(&id) {
                return id;
            }
        }
    }

    fn not_found(&self, id: NodeId) -> Error {
        if self.is_evicted(id) {
            Error::not_found(format!("Node {} has been evicted", id))
        } else {
            Error::not_found(format!("Node {} does not exist", id))
        }
    }

    /// Live node snapshot in creation order
    pub(crate) fn snapshot(&self) -> Vec<MemoryNode> {
        let mut nodes: Vec<MemoryNode> = self.nodes.values().filter(|n| n.is_live()).cloned().collect();
        nodes.sort_by_key(|n| n.age_key());
        nodes
    }
}

/// State shared by the node store, the graph and the engines built on them
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) outbox: EventOutbox,
    nodes: RwLock<NodeTable>,
    edges: RwLock<EdgeTable>,
}

impl Shared {
    pub(crate) fn read_nodes(&self) -> Result<RwLockReadGuard<'_, NodeTable>> {
        self.nodes
            .read()
            .map_err(|e| Error::invariant(format!("node table lock poisoned: {}", e)))
    }

    pub(crate) fn write_nodes(&self) -> Result<RwLockWriteGuard<'_, NodeTable>> {
        self.nodes
            .write()
            .map_err(|e| Error::invariant(format!("node table lock poisoned: {}", e)))
    }

    pub(crate) fn read_edges(&self) -> Result<RwLockReadGuard<'_, EdgeTable>> {
        self.edges
            .read()
            .map_err(|e| Error::invariant(format!("edge table lock poisoned: {}", e)))
    }

    pub(crate) fn write_edges(&self) -> Result<RwLockWriteGuard<'_, EdgeTable>> {
        self.edges
            .write()
            .map_err(|e| Error::invariant(format!("edge table lock poisoned: {}", e)))
    }
}

/// Evict `id` while the caller holds both table locks.
///
/// Edges go first so no edge can ever name an evicted node. Returns false if
/// the id was already evicted.
pub(crate) fn evict_locked(
    nodes: &mut NodeTable,
    edges: &mut EdgeTable,
    outbox: &EventOutbox,
    id: NodeId,
    now: DateTime<Utc>,
) -> Result<bool> {
    if nodes.is_evicted(id) {
        return Ok(false);
    }
    if !nodes.nodes.contains_key(&id) {
        return Err(nodes.not_found(id));
    }

    for key in edges.remove_touching(id) {
        outbox.push(PersistenceEvent::EdgeRemoved(key));
    }

    if let Some(mut node) = nodes.nodes.remove(&id) {
        node.status = NodeStatus::Evicted;
        debug!(node_id = %id, strength = node.strength, "Evicted node");
    }
    nodes.tombstones.insert(id, now);
    outbox.push(PersistenceEvent::NodeEvicted { id, evicted_at: now });
    Ok(true)
}

/// The authoritative in-memory node table
#[derive(Clone)]
pub struct NodeStore {
    shared: Arc<Shared>,
}

impl NodeStore {
    /// Create an empty store using the system clock
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                clock,
                outbox: EventOutbox::new(),
                nodes: RwLock::new(NodeTable::default()),
                edges: RwLock::new(EdgeTable::default()),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    /// The associative graph over this store's nodes
    pub fn graph(&self) -> AssociativeGraph {
        AssociativeGraph::new(self.shared.clone())
    }

    /// Mutation events for a persistence adapter. A fresh store numbers its
    /// events but only queues them once recording is switched on.
    pub fn outbox(&self) -> &EventOutbox {
        &self.shared.outbox
    }

    /// Create a new active node
    pub fn create(&self, content: Content, embedding: Vec<f32>, tags: Vec<String>) -> Result<NodeId> {
        self.create_with(NewNode::new(content, embedding).with_tags(tags))
    }

    /// Create a new active node from full parameters
    pub fn create_with(&self, new: NewNode) -> Result<NodeId> {
        validate_embedding(&new.embedding, self.shared.config.embedding_dimensions)?;

        let mut nodes = self.shared.write_nodes()?;
        let now = self.shared.clock.now();
        let id = nodes.fresh_id();
        nodes.next_sequence += 1;

        let node = MemoryNode {
            id,
            content: new.content,
            embedding: new.embedding,
            created_at: now,
            last_accessed_at: now,
            strength: clamp_unit(self.shared.config.default_strength),
            access_count: 0,
            tags: new.tags,
            modality: new.modality,
            status: NodeStatus::Active,
            merged_into: None,
            sequence: nodes.next_sequence,
        };
        self.shared.outbox.push(PersistenceEvent::NodeCreated(node.clone()));
        nodes.nodes.insert(id, node);

        debug!(node_id = %id, "Created node");
        Ok(id)
    }

    /// Get a live node
    pub fn get(&self, id: NodeId) -> Result<MemoryNode> {
        let nodes = self.shared.read_nodes()?;
        match nodes.get(&id) {
            Some(node) if node.is_live() => Ok(node.clone()),
            _ => Err(nodes.not_found(id)),
        }
    }

    /// Lifecycle status of `id`; `None` if the id was never issued by this store
    pub fn status(&self, id: NodeId) -> Result<Option<NodeStatus>> {
        let nodes = self.shared.read_nodes()?;
        if nodes.is_evicted(id) {
            return Ok(Some(NodeStatus::Evicted));
        }
        Ok(nodes.get(&id).map(|n| n.status))
    }

    /// Record an access: bump `last_accessed_at` and `access_count`, reinforce strength
    pub fn touch(&self, id: NodeId) -> Result<MemoryNode> {
        let mut nodes = self.shared.write_nodes()?;
        let now = self.shared.clock.now();
        let reinforcement = self.shared.config.reinforcement;

        if !nodes.is_live(id) {
            return Err(nodes.not_found(id));
        }
        let node = nodes
            .get_mut(&id)
            .ok_or_else(|| Error::invariant(format!("live node {} vanished under write lock", id)))?;

        if now > node.last_accessed_at {
            node.last_accessed_at = now;
        }
        node.access_count = node.access_count.saturating_add(1);
        node.strength = clamp_unit(node.strength + reinforcement);

        let node = node.clone();
        self.shared.outbox.push(PersistenceEvent::NodeUpdated(node.clone()));
        Ok(node)
    }

    /// Add `delta` to a node's strength, clamped to [0, 1]. Returns the new strength.
    pub fn update_strength(&self, id: NodeId, delta: f32) -> Result<f32> {
        if !delta.is_finite() {
            return Err(Error::validation(format!("Strength delta must be finite, got {}", delta)));
        }

        let mut nodes = self.shared.write_nodes()?;
        if !nodes.is_live(id) {
            return Err(nodes.not_found(id));
        }
        let node = nodes
            .get_mut(&id)
            .ok_or_else(|| Error::invariant(format!("live node {} vanished under write lock", id)))?;

        node.strength = clamp_unit(node.strength + delta);
        let node = node.clone();
        self.shared.outbox.push(PersistenceEvent::NodeUpdated(node.clone()));
        Ok(node.strength)
    }

    /// Evict a node, pruning its edges first.
    ///
    /// Returns true if the node was evicted by this call, false if it had
    /// already been evicted.
    pub fn evict(&self, id: NodeId) -> Result<bool> {
        let mut nodes = self.shared.write_nodes()?;
        let mut edges = self.shared.write_edges()?;
        let now = self.shared.clock.now();
        evict_locked(&mut nodes, &mut edges, &self.shared.outbox, id, now)
    }

    /// Snapshot of every live (active or consolidated) node, oldest first
    pub fn list_active(&self) -> Result<Vec<MemoryNode>> {
        Ok(self.shared.read_nodes()?.snapshot())
    }

    /// Number of live nodes
    pub fn live_count(&self) -> Result<usize> {
        Ok(self.shared.read_nodes()?.len())
    }

    /// Number of ids ever evicted
    pub fn evicted_count(&self) -> Result<usize> {
        Ok(self.shared.read_nodes()?.tombstones.len())
    }

    /// When `id` was evicted, if it has been
    pub fn evicted_at(&self, id: NodeId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.shared.read_nodes()?.tombstones.get(&id).copied())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.live_count()? == 0)
    }

    /// Verify that every edge joins two live nodes and no edge is a self-loop
    pub fn check_consistency(&self) -> Result<()> {
        let nodes = self.shared.read_nodes()?;
        let edges = self.shared.read_edges()?;

        for edge in edges.iter() {
            let problem = if edge.source == edge.target {
                Some("is a self-loop")
            } else if !nodes.is_live(edge.source) || !nodes.is_live(edge.target) {
                Some("references a missing or evicted node")
            } else if !(0.0..=1.0).contains(&edge.weight) {
                Some("has a weight outside [0, 1]")
            } else {
                None
            };

            if let Some(problem) = problem {
                error!(
                    source = %edge.source,
                    target = %edge.target,
                    kind = %edge.kind,
                    "Edge {}", problem
                );
                return Err(Error::invariant(format!(
                    "edge {} -> {} ({}) {}",
                    edge.source, edge.target, edge.kind, problem
                )));
            }
        }

        for node in nodes.values() {
            if !(0.0..=1.0).contains(&node.strength) {
                error!(node_id = %node.id, strength = node.strength, "Node strength out of range");
                return Err(Error::invariant(format!("node {} has strength {}", node.id, node.strength)));
            }
        }
        Ok(())
    }

    /// Replace the store's contents with a reloaded snapshot.
    ///
    /// The snapshot is validated in full before anything is touched; an
    /// inconsistent snapshot is rejected without mutating the store.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let dims = self.shared.config.embedding_dimensions;
        let evicted: HashSet<NodeId> = snapshot.evicted.iter().map(|(id, _)| *id).collect();
        let mut seen = HashSet::new();

        for node in &snapshot.nodes {
            validate_embedding(&node.embedding, dims)
                .map_err(|e| Error::invariant(format!("restored node {}: {}", node.id, e)))?;
            if !seen.insert(node.id) {
                return Err(Error::invariant(format!("restored snapshot repeats node {}", node.id)));
            }
            if evicted.contains(&node.id) || !node.is_live() {
                return Err(Error::invariant(format!("restored node {} is marked evicted", node.id)));
            }
        }
        for edge in &snapshot.edges {
            if edge.source == edge.target || !seen.contains(&edge.source) || !seen.contains(&edge.target) {
                error!(source = %edge.source, target = %edge.target, "Restored edge has invalid endpoints");
                return Err(Error::invariant(format!(
                    "restored edge {} -> {} has invalid endpoints",
                    edge.source, edge.target
                )));
            }
        }

        let mut nodes = self.shared.write_nodes()?;
        let mut edges = self.shared.write_edges()?;

        let mut table = NodeTable::default();
        for node in &snapshot.nodes {
            let mut node = node.clone();
            node.strength = clamp_unit(node.strength);
            table.next_sequence = table.next_sequence.max(node.sequence);
            table.nodes.insert(node.id, node);
        }
        for (id, evicted_at) in &snapshot.evicted {
            table.tombstones.insert(*id, *evicted_at);
        }
        *nodes = table;

        edges.clear();
        for edge in &snapshot.edges {
            edges.merge_in(edge.clone());
        }

        self.shared.outbox.resume_after(snapshot.last_sequence);
        info!(
            nodes = nodes.len(),
            edges = edges.len(),
            evicted = snapshot.evicted.len(),
            "Restored memory store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::graph::EdgeKind;
    use std::time::Duration;

    fn store() -> NodeStore {
        NodeStore::new(Config::default().dimensions(2)).unwrap()
    }

    fn text(s: &str) -> Content {
        Content::text(s)
    }

    // ── create / get ─────────────────────────────────────────────────────────

    #[test]
    fn create_initialises_active_node() {
        let store = store();
        let id = store.create(text("hello"), vec![1.0, 0.0], vec!["greeting".into()]).unwrap();

        let node = store.get(id).unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.access_count, 0);
        assert!((node.strength - 0.5).abs() < 1e-6);
        assert_eq!(node.tags, vec!["greeting".to_string()]);
        assert_eq!(node.content, text("hello"));
    }

    #[test]
    fn create_rejects_dimension_mismatch() {
        let store = store();
        let err = store.create(text("bad"), vec![1.0, 0.0, 0.0], vec![]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.live_count().unwrap(), 0);
        assert_eq!(store.outbox().pending_len(), 0);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let store = store();
        assert!(matches!(store.get(NodeId::new()), Err(Error::NotFound(_))));
    }

    #[test]
    fn sequences_follow_creation_order() {
        let store = store();
        let a = store.create(text("a"), vec![1.0, 0.0], vec![]).unwrap();
        let b = store.create(text("b"), vec![0.0, 1.0], vec![]).unwrap();
        let listed: Vec<NodeId> = store.list_active().unwrap().iter().map(|n| n.id).collect();
        assert_eq!(listed, vec![a, b]);
    }

    // ── touch / update_strength ──────────────────────────────────────────────

    #[test]
    fn touch_reinforces_and_counts() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = NodeStore::with_clock(Config::default().dimensions(2), clock.clone()).unwrap();
        let id = store.create(text("x"), vec![1.0, 0.0], vec![]).unwrap();
        let created = store.get(id).unwrap().last_accessed_at;

        clock.advance(Duration::from_secs(5));
        let touched = store.touch(id).unwrap();
        assert_eq!(touched.access_count, 1);
        assert!((touched.strength - 0.6).abs() < 1e-6);
        assert!(touched.last_accessed_at > created);
    }

    #[test]
    fn touch_never_moves_time_backwards() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = NodeStore::with_clock(Config::default().dimensions(2), clock.clone()).unwrap();
        let id = store.create(text("x"), vec![1.0, 0.0], vec![]).unwrap();
        let first = store.touch(id).unwrap().last_accessed_at;

        clock.set(first - chrono::Duration::seconds(30));
        let second = store.touch(id).unwrap();
        assert_eq!(second.last_accessed_at, first);
        assert_eq!(second.access_count, 2);
    }

    #[test]
    fn strength_is_clamped() {
        let store = store();
        let id = store.create(text("x"), vec![1.0, 0.0], vec![]).unwrap();
        assert_eq!(store.update_strength(id, 5.0).unwrap(), 1.0);
        assert_eq!(store.update_strength(id, -7.0).unwrap(), 0.0);
        assert!(store.update_strength(id, f32::NAN).is_err());
    }

    // ── evict ────────────────────────────────────────────────────────────────

    #[test]
    fn evict_prunes_edges_and_is_idempotent() {
        let store = store();
        let graph = store.graph();
        let a = store.create(text("a"), vec![1.0, 0.0], vec![]).unwrap();
        let b = store.create(text("b"), vec![0.0, 1.0], vec![]).unwrap();
        graph.link(a, b, EdgeKind::CoOccurrence, 0.6).unwrap();

        assert!(store.evict(b).unwrap());
        assert!(!store.evict(b).unwrap());

        assert!(graph.neighbors(a, None, 0.0).unwrap().is_empty());
        assert_eq!(graph.edge_count().unwrap(), 0);
        assert_eq!(store.status(b).unwrap(), Some(NodeStatus::Evicted));
        assert!(matches!(store.get(b), Err(Error::NotFound(_))));
        store.check_consistency().unwrap();
    }

    #[test]
    fn evicted_nodes_reject_mutation() {
        let store = store();
        let a = store.create(text("a"), vec![1.0, 0.0], vec![]).unwrap();
        store.evict(a).unwrap();

        assert!(matches!(store.touch(a), Err(Error::NotFound(_))));
        assert!(matches!(store.update_strength(a, 0.1), Err(Error::NotFound(_))));
        assert_eq!(store.status(a).unwrap(), Some(NodeStatus::Evicted));
    }

    #[test]
    fn evict_unknown_is_not_found() {
        let store = store();
        assert!(matches!(store.evict(NodeId::new()), Err(Error::NotFound(_))));
    }

    #[test]
    fn link_to_evicted_node_fails() {
        let store = store();
        let graph = store.graph();
        let a = store.create(text("a"), vec![1.0, 0.0], vec![]).unwrap();
        let b = store.create(text("b"), vec![0.0, 1.0], vec![]).unwrap();
        store.evict(b).unwrap();
        assert!(matches!(
            graph.link(a, b, EdgeKind::Causal, 0.3),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            graph.link(a, a, EdgeKind::Causal, 0.3),
            Err(Error::Validation(_))
        ));
    }

    // ── events ───────────────────────────────────────────────────────────────

    #[test]
    fn mutations_are_recorded_in_order() {
        let store = store();
        store.outbox().set_recording(true);
        let graph = store.graph();
        let a = store.create(text("a"), vec![1.0, 0.0], vec![]).unwrap();
        let b = store.create(text("b"), vec![0.0, 1.0], vec![]).unwrap();
        graph.link(a, b, EdgeKind::Causal, 0.4).unwrap();
        store.touch(a).unwrap();
        store.evict(b).unwrap();

        let names: Vec<&str> = store.outbox().pending().iter().map(|e| e.event.name()).collect();
        assert_eq!(
            names,
            vec![
                "node_created",
                "node_created",
                "edge_updated",
                "node_updated",
                "edge_removed",
                "node_evicted"
            ]
        );
    }

    #[test]
    fn store_without_recording_keeps_no_backlog() {
        let store = store();
        let id = store.create(text("a"), vec![1.0, 0.0], vec![]).unwrap();
        for _ in 0..10_000 {
            store.touch(id).unwrap();
        }
        assert_eq!(store.outbox().pending_len(), 0);
        assert_eq!(store.outbox().last_sequence(), 10_001);
        assert_eq!(store.get(id).unwrap().access_count, 10_000);
    }

    // ── restore ──────────────────────────────────────────────────────────────

    #[test]
    fn restore_rejects_dangling_edges_without_mutation() {
        let source = store();
        let a = source.create(text("a"), vec![1.0, 0.0], vec![]).unwrap();
        let b = source.create(text("b"), vec![0.0, 1.0], vec![]).unwrap();
        source.graph().link(a, b, EdgeKind::Causal, 0.4).unwrap();

        let mut snapshot = Snapshot {
            nodes: vec![source.get(a).unwrap()],
            edges: source.graph().all_edges().unwrap(),
            ..Default::default()
        };

        let target = store();
        let existing = target.create(text("keep"), vec![1.0, 1.0], vec![]).unwrap();
        assert!(matches!(target.restore(&snapshot), Err(Error::InvariantViolation(_))));
        assert!(target.get(existing).is_ok());

        snapshot.nodes.push(source.get(b).unwrap());
        target.restore(&snapshot).unwrap();
        assert_eq!(target.live_count().unwrap(), 2);
        assert!(target.get(existing).is_err());
        assert_eq!(target.graph().neighbors(a, None, 0.0).unwrap(), vec![(b, 0.4)]);
    }

    #[test]
    fn restore_keeps_eviction_times() {
        let clock = Arc::new(ManualClock::starting_now());
        let source = NodeStore::with_clock(Config::default().dimensions(2), clock.clone()).unwrap();
        let gone = source.create(text("gone"), vec![1.0, 0.0], vec![]).unwrap();
        source.evict(gone).unwrap();
        let evicted_at = source.evicted_at(gone).unwrap().unwrap();

        clock.advance(Duration::from_secs(3_600));
        let target = NodeStore::with_clock(Config::default().dimensions(2), clock).unwrap();
        target
            .restore(&Snapshot {
                evicted: vec![(gone, evicted_at)],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(target.evicted_at(gone).unwrap(), Some(evicted_at));
        assert_eq!(target.status(gone).unwrap(), Some(NodeStatus::Evicted));
    }
}
