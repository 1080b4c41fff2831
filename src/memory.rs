//! Episodic memory: the store, graph, engines and external collaborators wired together

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::consolidation::{ConsolidationEngine, MergeRecord, SweepReport};
use crate::embedding::EmbeddingGateway;
use crate::error::{Error, Result};
use crate::graph::{AssociativeGraph, Edge, EdgeKind};
use crate::index::{FlatIndex, SimilarityIndex};
use crate::node::{Content, MemoryNode, Modality, NewNode, NodeId, NodeStatus};
use crate::retrieval::{QueryFilters, RetrievalPlanner, ScoredNode};
use crate::storage::PersistenceAdapter;
use crate::store::NodeStore;

/// Weight given to the link from the previously ingested node to a new one
const TEMPORAL_LINK_WEIGHT: f32 = 0.5;

/// Point-in-time summary of a memory store
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub live: usize,
    pub active: usize,
    pub consolidated: usize,
    pub evicted: usize,
    pub edges: usize,
    pub total_edge_weight: f64,
    pub mean_strength: f32,
    /// Events not yet accepted by the persistence adapter
    pub pending_events: usize,
}

/// Builder for [`EpisodicMemory`]
pub struct EpisodicMemoryBuilder {
    config: Config,
    embedder: Arc<dyn EmbeddingGateway>,
    index: Option<Arc<dyn SimilarityIndex>>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    clock: Arc<dyn Clock>,
}

impl EpisodicMemoryBuilder {
    /// Use a specific similarity index instead of the in-memory [`FlatIndex`]
    pub fn index(mut self, index: Arc<dyn SimilarityIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn persistence(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(adapter);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<EpisodicMemory> {
        if self.embedder.dimensions() != self.config.embedding_dimensions {
            return Err(Error::config(format!(
                "embedding gateway produces {} dimensions, store expects {}",
                self.embedder.dimensions(),
                self.config.embedding_dimensions
            )));
        }

        let store = NodeStore::with_clock(self.config, self.clock)?;
        // without an adapter nothing would ever drain the queue
        store.outbox().set_recording(self.persistence.is_some());
        let index = self.index.unwrap_or_else(|| Arc::new(FlatIndex::new()));

        Ok(EpisodicMemory {
            engine: ConsolidationEngine::new(store.clone()),
            planner: RetrievalPlanner::new(store.clone(), index.clone()),
            store,
            embedder: self.embedder,
            index,
            persistence: self.persistence,
            last_ingested: Mutex::new(None),
            adapter_sequence: tokio::sync::Mutex::new(None),
        })
    }
}

/// One agent's episodic memory
pub struct EpisodicMemory {
    store: NodeStore,
    engine: ConsolidationEngine,
    planner: RetrievalPlanner,
    embedder: Arc<dyn EmbeddingGateway>,
    index: Arc<dyn SimilarityIndex>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    last_ingested: Mutex<Option<NodeId>>,
    /// Highest sequence the adapter is known to hold; also serialises flushes
    adapter_sequence: tokio::sync::Mutex<Option<u64>>,
}

impl EpisodicMemory {
    pub fn builder(config: Config, embedder: Arc<dyn EmbeddingGateway>) -> EpisodicMemoryBuilder {
        EpisodicMemoryBuilder {
            config,
            embedder,
            index: None,
            persistence: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        self.store.config()
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn graph(&self) -> AssociativeGraph {
        self.store.graph()
    }

    pub fn engine(&self) -> &ConsolidationEngine {
        &self.engine
    }

    pub fn planner(&self) -> &RetrievalPlanner {
        &self.planner
    }

    /// Reload nodes, edges and merge history from the persistence adapter and
    /// rebuild the similarity index. Returns the number of nodes restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(adapter) = &self.persistence else {
            return Ok(0);
        };
        let mut adapter_sequence = self.adapter_sequence.lock().await;
        let snapshot = adapter.load().await.map_err(|e| as_persistence("load", e))?;

        self.store.restore(&snapshot)?;
        *adapter_sequence = Some(snapshot.last_sequence);
        drop(adapter_sequence);
        self.engine.restore_merges(snapshot.merges.clone());

        for node in &snapshot.nodes {
            self.index.upsert(node.id, node.embedding.clone()).await?;
        }
        for (id, _) in &snapshot.evicted {
            self.index.remove(*id).await?;
        }

        let newest = snapshot.nodes.iter().max_by_key(|n| n.age_key()).map(|n| n.id);
        *self.last_ingested.lock().unwrap_or_else(|e| e.into_inner()) = newest;

        info!(nodes = snapshot.nodes.len(), edges = snapshot.edges.len(), "Restored episodic memory");
        Ok(snapshot.nodes.len())
    }

    /// Encode a new experience
    pub async fn remember(&self, content: Content, tags: Vec<String>) -> Result<NodeId> {
        self.ingest(NewNode::new(content, Vec::new()).with_tags(tags)).await
    }

    /// Encode a new experience observed through `modality`
    pub async fn remember_as(&self, content: Content, tags: Vec<String>, modality: Modality) -> Result<NodeId> {
        self.ingest(NewNode::new(content, Vec::new()).with_tags(tags).with_modality(modality))
            .await
    }

    async fn ingest(&self, mut new: NewNode) -> Result<NodeId> {
        // nothing is created unless embedding succeeds
        new.embedding = self.embed(&new.content, "remember").await?;
        let embedding = new.embedding.clone();

        let id = self.store.create_with(new)?;

        if let Err(e) = self.index.upsert(id, embedding.clone()).await {
            warn!(node_id = %id, error = %e, "Index rejected new node, rolling back");
            self.store.evict(id)?;
            return Err(e);
        }

        self.link_ingested(id, &embedding).await;
        debug!(node_id = %id, "Remembered experience");
        Ok(id)
    }

    async fn link_ingested(&self, id: NodeId, embedding: &[f32]) {
        let config = self.store.config();
        let graph = self.store.graph();

        let previous = self
            .last_ingested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(id);
        if config.auto_link_temporal {
            if let Some(previous) = previous {
                match graph.link(previous, id, EdgeKind::TemporalSequence, TEMPORAL_LINK_WEIGHT) {
                    Ok(_) | Err(Error::NotFound(_)) => {}
                    Err(e) => warn!(node_id = %id, error = %e, "Temporal link failed"),
                }
            }
        }

        if config.auto_link_max == 0 {
            return;
        }
        let hits = match self.index.nearest(embedding, config.auto_link_max + 1).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(node_id = %id, error = %e, "Skipping semantic links");
                return;
            }
        };
        let mut linked = 0;
        for (other, similarity) in hits
            .into_iter()
            .filter(|(other, similarity)| *other != id && *similarity >= config.auto_link_similarity_threshold)
            .take(config.auto_link_max)
        {
            // ids of evicted nodes may linger in the index
            match graph.link(id, other, EdgeKind::SemanticSimilarity, similarity.min(1.0)) {
                Ok(_) => linked += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => warn!(node_id = %id, other = %other, error = %e, "Semantic link failed"),
            }
        }
        if linked > 0 {
            debug!(node_id = %id, linked, "Linked to similar nodes");
        }
    }

    async fn embed(&self, content: &Content, operation: &str) -> Result<Vec<f32>> {
        self.embedder.embed(content).await.map_err(|e| match e {
            Error::EmbeddingUnavailable { .. } | Error::Validation(_) => e,
            other => Error::embedding(operation, other),
        })
    }

    /// Retrieve the `k` memories most relevant to `cue`
    pub async fn recall(&self, cue: &Content, k: usize, filters: &QueryFilters) -> Result<Vec<ScoredNode>> {
        let vector = self.embed(cue, "recall").await?;
        self.planner.query(&vector, k, filters).await
    }

    /// Retrieve by an already-computed query vector
    pub async fn recall_vector(&self, vector: &[f32], k: usize, filters: &QueryFilters) -> Result<Vec<ScoredNode>> {
        self.planner.query(vector, k, filters).await
    }

    /// Record an association between two memories
    pub fn associate(&self, source: NodeId, target: NodeId, kind: EdgeKind, weight_increment: f32) -> Result<Edge> {
        self.store.graph().link(source, target, kind, weight_increment)
    }

    pub fn get(&self, id: NodeId) -> Result<MemoryNode> {
        self.store.get(id)
    }

    pub fn touch(&self, id: NodeId) -> Result<MemoryNode> {
        self.store.touch(id)
    }

    /// Forget a memory. Returns false if it was already evicted.
    pub async fn evict(&self, id: NodeId) -> Result<bool> {
        let evicted = self.store.evict(id)?;
        self.index.remove(id).await?;
        Ok(evicted)
    }

    /// Run one decay & consolidation sweep and drop evicted nodes from the index
    pub async fn sweep(&self, elapsed: Duration) -> Result<SweepReport> {
        let report = self.engine.sweep(elapsed)?;
        for id in &report.evicted {
            self.index.remove(*id).await?;
        }
        Ok(report)
    }

    /// Node that now stands for `id`, following merges
    pub fn resolve(&self, id: NodeId) -> Result<NodeId> {
        self.engine.resolve(id)
    }

    pub fn merges(&self) -> Vec<MergeRecord> {
        self.engine.merges()
    }

    /// Hand pending events to the persistence adapter. Events stay queued if
    /// the adapter fails. Returns the number of events flushed.
    ///
    /// Pending events are renumbered above whatever the adapter already
    /// holds, so a memory opened over existing storage without
    /// [`restore`](Self::restore) never writes events the adapter would skip.
    pub async fn flush(&self) -> Result<usize> {
        let mut adapter_sequence = self.adapter_sequence.lock().await;
        let outbox = self.store.outbox();
        if outbox.pending_len() == 0 {
            return Ok(0);
        }

        let Some(adapter) = &self.persistence else {
            let pending = outbox.pending();
            let last = pending.last().map_or(0, |e| e.sequence);
            return Ok(outbox.acknowledge(last));
        };

        let stored = match *adapter_sequence {
            Some(stored) => stored,
            None => adapter
                .last_sequence()
                .await
                .map_err(|e| as_persistence("read stored sequence", e))?,
        };
        *adapter_sequence = Some(stored);
        let shift = outbox.rebase_after(stored);
        if shift > 0 {
            warn!(stored, shift, "Renumbered pending events after the adapter's stored sequence");
        }

        let pending = outbox.pending();
        let Some(last) = pending.last().map(|e| e.sequence) else {
            return Ok(0);
        };
        adapter
            .apply(&pending)
            .await
            .map_err(|e| as_persistence("flush", e))?;
        *adapter_sequence = Some(last);

        let flushed = outbox.acknowledge(last);
        debug!(flushed, last_sequence = last, "Flushed events");
        Ok(flushed)
    }

    /// Flush and release the store
    pub async fn shutdown(self) -> Result<()> {
        let flushed = self.flush().await?;
        info!(flushed, "Episodic memory shut down");
        Ok(())
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let nodes = self.store.list_active()?;
        let graph = self.store.graph();

        let active = nodes.iter().filter(|n| n.status == NodeStatus::Active).count();
        let mean_strength = if nodes.is_empty() {
            0.0
        } else {
            nodes.iter().map(|n| n.strength).sum::<f32>() / nodes.len() as f32
        };

        Ok(MemoryStats {
            live: nodes.len(),
            active,
            consolidated: nodes.len() - active,
            evicted: self.store.evicted_count()?,
            edges: graph.edge_count()?,
            total_edge_weight: graph.total_weight()?,
            mean_strength,
            pending_events: self.store.outbox().pending_len(),
        })
    }
}

fn as_persistence(operation: &str, e: Error) -> Error {
    match e {
        Error::PersistenceUnavailable { .. } => e,
        other => Error::persistence(operation, other),
    }
}
