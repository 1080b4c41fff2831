//! Mutation events bound for the persistence adapter
//!
//! Every mutation the core performs is numbered by an [`EventOutbox`] while the
//! mutating critical section is still held, so the sequence numbers follow the
//! real order of mutations. Events are only queued while the outbox is
//! recording, which is the case when a persistence adapter is attached.
//! Flushing hands the pending batch to a
//! [`PersistenceAdapter`](crate::storage::PersistenceAdapter) and drops it only
//! once the adapter has accepted it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consolidation::MergeRecord;
use crate::graph::{Edge, EdgeKey};
use crate::node::{MemoryNode, NodeId};

/// A single mutation of the node store or graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PersistenceEvent {
    NodeCreated(MemoryNode),
    NodeUpdated(MemoryNode),
    EdgeUpdated(Edge),
    EdgeRemoved(EdgeKey),
    NodeMerged(MergeRecord),
    NodeEvicted { id: NodeId, evicted_at: DateTime<Utc> },
}

impl PersistenceEvent {
    /// The node this event is about, if it concerns a single node
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            PersistenceEvent::NodeCreated(n) | PersistenceEvent::NodeUpdated(n) => Some(n.id),
            PersistenceEvent::NodeMerged(m) => Some(m.merged),
            PersistenceEvent::NodeEvicted { id, .. } => Some(*id),
            PersistenceEvent::EdgeUpdated(_) | PersistenceEvent::EdgeRemoved(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PersistenceEvent::NodeCreated(_) => "node_created",
            PersistenceEvent::NodeUpdated(_) => "node_updated",
            PersistenceEvent::EdgeUpdated(_) => "edge_updated",
            PersistenceEvent::EdgeRemoved(_) => "edge_removed",
            PersistenceEvent::NodeMerged(_) => "node_merged",
            PersistenceEvent::NodeEvicted { .. } => "node_evicted",
        }
    }
}

/// An event stamped with its position in the store's mutation order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub event: PersistenceEvent,
}

/// Ordered queue of events not yet accepted by the adapter
#[derive(Debug, Default)]
pub struct EventOutbox {
    inner: Mutex<OutboxState>,
}

#[derive(Debug, Default)]
struct OutboxState {
    last_sequence: u64,
    recording: bool,
    pending: VecDeque<SequencedEvent>,
}

impl EventOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number an event and queue it if recording. Returns its sequence number.
    pub fn push(&self, event: PersistenceEvent) -> u64 {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        if state.recording {
            state.pending.push_back(SequencedEvent { sequence, event });
        }
        sequence
    }

    /// Start or stop queueing events. Stopping drops anything pending.
    pub fn set_recording(&self, recording: bool) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.recording = recording;
        if !recording {
            state.pending.clear();
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).recording
    }

    /// Copy of every pending event, oldest first
    pub fn pending(&self) -> Vec<SequencedEvent> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }

    /// Drop every pending event up to and including `sequence`
    pub fn acknowledge(&self, sequence: u64) -> usize {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.pending.len();
        while state.pending.front().map_or(false, |e| e.sequence <= sequence) {
            state.pending.pop_front();
        }
        before - state.pending.len()
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).last_sequence
    }

    /// Continue numbering after `sequence`, discarding anything pending.
    /// Used after a reload so new events sort after persisted ones.
    pub(crate) fn resume_after(&self, sequence: u64) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.clear();
        state.last_sequence = state.last_sequence.max(sequence);
    }

    /// Renumber pending events so they sort after `sequence`, the highest
    /// number an adapter already holds. Relative order is kept. Returns how
    /// far the numbering moved.
    pub(crate) fn rebase_after(&self, sequence: u64) -> u64 {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let first = state
            .pending
            .front()
            .map_or(state.last_sequence + 1, |e| e.sequence);
        if first > sequence {
            return 0;
        }
        let shift = sequence + 1 - first;
        for event in state.pending.iter_mut() {
            event.sequence += shift;
        }
        state.last_sequence += shift;
        shift
    }
}

/// Full state reloaded from a persistence adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<MemoryNode>,
    pub edges: Vec<Edge>,
    pub merges: Vec<MergeRecord>,
    /// Ids evicted in the past with their eviction time; never reused
    pub evicted: Vec<(NodeId, DateTime<Utc>)>,
    /// Highest event sequence reflected in this snapshot
    pub last_sequence: u64,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.evicted.is_empty()
    }
}

/// Folds an event stream into a [`Snapshot`].
///
/// Events at or below the highest sequence already applied are skipped, so
/// replaying a log that contains a re-delivered batch is harmless.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    nodes: HashMap<NodeId, MemoryNode>,
    edges: BTreeMap<EdgeKey, Edge>,
    merges: Vec<MergeRecord>,
    evicted: BTreeMap<NodeId, DateTime<Utc>>,
    last_sequence: u64,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the event was skipped as already applied
    pub fn apply(&mut self, event: &SequencedEvent) -> bool {
        if event.sequence <= self.last_sequence {
            return false;
        }
        self.last_sequence = event.sequence;

        match &event.event {
            PersistenceEvent::NodeCreated(node) | PersistenceEvent::NodeUpdated(node) => {
                if !self.evicted.contains_key(&node.id) {
                    self.nodes.insert(node.id, node.clone());
                }
            }
            PersistenceEvent::EdgeUpdated(edge) => {
                self.edges.insert(edge.key(), edge.clone());
            }
            PersistenceEvent::EdgeRemoved(key) => {
                self.edges.remove(key);
            }
            PersistenceEvent::NodeMerged(record) => {
                self.merges.push(record.clone());
            }
            PersistenceEvent::NodeEvicted { id, evicted_at } => {
                self.nodes.remove(id);
                self.edges.retain(|k, _| !k.touches(*id));
                self.evicted.insert(*id, *evicted_at);
            }
        }
        true
    }

    pub fn build(self) -> Snapshot {
        let mut nodes: Vec<MemoryNode> = self.nodes.into_values().collect();
        nodes.sort_by_key(|n| n.sequence);
        Snapshot {
            nodes,
            edges: self.edges.into_values().collect(),
            merges: self.merges,
            evicted: self.evicted.into_iter().collect(),
            last_sequence: self.last_sequence,
        }
    }
}
