//! Retrieval planner: similarity search, one-hop graph expansion, composite ranking

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::clock::secs_between;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::SimilarityIndex;
use crate::node::{validate_embedding, MemoryNode, Modality, NodeId, NodeStatus};
use crate::store::NodeStore;

/// Restrictions applied to every candidate, direct or expanded
#[derive(Debug, Clone)]
pub struct QueryFilters {
    /// Keep nodes carrying at least one of these tags; empty means no restriction
    pub tags: Vec<String>,
    pub modality: Option<Modality>,
    pub min_strength: f32,
    /// Consolidated (merged) nodes are retrievable unless this is false
    pub include_consolidated: bool,
}

impl Default for QueryFilters {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            modality: None,
            min_strength: 0.0,
            include_consolidated: true,
        }
    }
}

impl QueryFilters {
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = Some(modality);
        self
    }

    pub fn active_only(mut self) -> Self {
        self.include_consolidated = false;
        self
    }

    fn admits(&self, node: &MemoryNode) -> bool {
        match node.status {
            NodeStatus::Active => {}
            NodeStatus::Consolidated if self.include_consolidated => {}
            _ => return false,
        }
        if node.strength < self.min_strength {
            return false;
        }
        if let Some(modality) = self.modality {
            if node.modality != Some(modality) {
                return false;
            }
        }
        self.tags.is_empty() || node.has_any_tag(&self.tags)
    }
}

/// How a candidate entered the result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Returned by the similarity index
    Direct,
    /// Reached by one hop through the graph
    Associative,
}

/// The four components of a composite score, before weighting
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub similarity: f32,
    pub strength: f32,
    pub recency: f32,
    pub associative: f32,
}

/// A ranked retrieval result
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: MemoryNode,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
    pub origin: Origin,
}

/// Answers queries against a store and a similarity index
#[derive(Clone)]
pub struct RetrievalPlanner {
    store: NodeStore,
    index: Arc<dyn SimilarityIndex>,
}

impl RetrievalPlanner {
    pub fn new(store: NodeStore, index: Arc<dyn SimilarityIndex>) -> Self {
        Self { store, index }
    }

    /// Top `k` nodes for `vector`. Every returned node is touched, so its
    /// access count and strength reflect this retrieval.
    pub async fn query(&self, vector: &[f32], k: usize, filters: &QueryFilters) -> Result<Vec<ScoredNode>> {
        let ranked = self.rank(vector, k, filters).await?;

        let mut results = Vec::with_capacity(ranked.len());
        for mut scored in ranked {
            match self.store.touch(scored.node.id) {
                Ok(node) => {
                    scored.node = node;
                    results.push(scored);
                }
                // evicted between ranking and touching
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Rank without touching anything
    pub async fn rank(&self, vector: &[f32], k: usize, filters: &QueryFilters) -> Result<Vec<ScoredNode>> {
        if k == 0 {
            return Err(Error::validation("k must be at least 1"));
        }
        let config = self.store.config();
        validate_embedding(vector, config.embedding_dimensions)?;

        if self.store.is_empty()? {
            return Ok(Vec::new());
        }

        let fetch = k.saturating_mul(config.candidate_multiplier).max(k);
        let hits = self.index.nearest(vector, fetch).await?;
        self.score_hits(hits, k, filters)
    }

    fn score_hits(&self, hits: Vec<(NodeId, f32)>, k: usize, filters: &QueryFilters) -> Result<Vec<ScoredNode>> {
        let shared = self.store.shared();
        let config = &shared.config;

        // both tables are read together so no merge or eviction is seen half-done
        let nodes = shared.read_nodes()?;
        let edges = shared.read_edges()?;
        let now = shared.clock.now();

        // BTreeMap keeps iteration order independent of hashing
        let mut candidates: BTreeMap<NodeId, (f32, Origin)> = BTreeMap::new();
        for (id, similarity) in hits {
            let Some(node) = nodes.get(&id) else {
                continue;
            };
            if !filters.admits(node) {
                continue;
            }
            let similarity = if similarity.is_nan() { 0.0 } else { similarity.clamp(0.0, 1.0) };
            let entry = candidates.entry(id).or_insert((similarity, Origin::Direct));
            entry.0 = entry.0.max(similarity);
        }

        let direct: Vec<(NodeId, f32)> = candidates.iter().map(|(id, (s, _))| (*id, *s)).collect();
        for (parent, parent_similarity) in direct {
            for (neighbor, weight) in edges.neighbors(parent, None, config.expansion_min_weight) {
                if candidates.get(&neighbor).map_or(false, |(_, o)| *o == Origin::Direct) {
                    continue;
                }
                let Some(node) = nodes.get(&neighbor) else {
                    continue;
                };
                if !filters.admits(node) {
                    continue;
                }
                let base = parent_similarity * weight * config.secondary_discount;
                let entry = candidates.entry(neighbor).or_insert((base, Origin::Associative));
                entry.0 = entry.0.max(base);
            }
        }

        let members: HashSet<NodeId> = candidates.keys().copied().collect();
        let mut scored: Vec<ScoredNode> = candidates
            .into_iter()
            .filter_map(|(id, (similarity, origin))| {
                let node = nodes.get(&id)?;
                let breakdown = ScoreBreakdown {
                    similarity,
                    strength: node.strength,
                    recency: recency(node.last_accessed_at, now, config),
                    associative: edges.incoming_weight(id, &members).min(1.0),
                };
                Some(ScoredNode {
                    node: node.clone(),
                    score: composite(&breakdown, config),
                    breakdown,
                    origin,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.node.last_accessed_at.cmp(&a.node.last_accessed_at))
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        let considered = scored.len();
        scored.truncate(k);

        debug!(considered, returned = scored.len(), k, "Ranked retrieval candidates");
        Ok(scored)
    }
}

/// Halves every `recency_half_life` since the last access
fn recency(last_accessed_at: DateTime<Utc>, now: DateTime<Utc>, config: &Config) -> f32 {
    let age = secs_between(last_accessed_at, now);
    let half_life = config.recency_half_life.as_secs_f64();
    0.5f64.powf(age / half_life) as f32
}

fn composite(b: &ScoreBreakdown, config: &Config) -> f32 {
    let w = config.score_weights;
    w.similarity * b.similarity + w.strength * b.strength + w.recency * b.recency + w.associative * b.associative
}
