//! Configuration for mne-memory

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Weights of the composite retrieval score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub similarity: f32,
    pub strength: f32,
    pub recency: f32,
    pub associative: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            similarity: 0.55,
            strength: 0.2,
            recency: 0.15,
            associative: 0.1,
        }
    }
}

/// Configuration for a memory store instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory used by the file-backed persistence adapters
    pub data_dir: PathBuf,

    /// Embedding dimensions every node and query must match (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Strength assigned to freshly created nodes (0.0 - 1.0)
    pub default_strength: f32,

    /// Strength added on every touch
    pub reinforcement: f32,

    /// Node decay rate per second (`strength *= exp(-rate * secs)`)
    pub node_decay_rate: f64,

    /// Nodes accessed within this window are exempt from decay
    pub grace_window: Duration,

    /// Edge decay rate per second
    pub edge_decay_rate: f64,

    /// Edges weaker than this after decay are removed
    pub edge_prune_threshold: f32,

    /// Minimum cosine similarity for two nodes to be merged
    pub merge_similarity_threshold: f32,

    /// Minimum semantic-similarity edge weight for two nodes to be merged
    pub merge_edge_threshold: f32,

    /// Nodes weaker than this are evicted during a sweep
    pub eviction_threshold: f32,

    /// Sweeps never evict below this many live nodes
    pub capacity_floor: usize,

    /// Sweeps evict the weakest nodes until at most this many remain
    pub capacity_ceiling: usize,

    /// The similarity index is asked for `k * candidate_multiplier` candidates
    pub candidate_multiplier: usize,

    /// Minimum edge weight followed during one-hop expansion
    pub expansion_min_weight: f32,

    /// Discount applied to the base similarity of expanded candidates
    pub secondary_discount: f32,

    /// Time since last access after which the recency score halves
    pub recency_half_life: Duration,

    pub score_weights: ScoreWeights,

    /// Link every ingested node to the previously ingested one
    pub auto_link_temporal: bool,

    /// Minimum similarity for automatic semantic links on ingestion
    pub auto_link_similarity_threshold: f32,

    /// Maximum automatic semantic links per ingested node
    pub auto_link_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mne-memory");

        Self {
            data_dir,
            embedding_dimensions: 384,
            default_strength: 0.5,
            reinforcement: 0.1,
            node_decay_rate: 1e-5,
            grace_window: Duration::from_secs(60),
            edge_decay_rate: 5e-6,
            edge_prune_threshold: 0.01,
            merge_similarity_threshold: 0.95,
            merge_edge_threshold: 0.5,
            eviction_threshold: 0.05,
            capacity_floor: 0,
            capacity_ceiling: 10_000,
            candidate_multiplier: 3,
            expansion_min_weight: 0.1,
            secondary_discount: 0.5,
            recency_half_life: Duration::from_secs(86_400),
            score_weights: ScoreWeights::default(),
            auto_link_temporal: true,
            auto_link_similarity_threshold: 0.8,
            auto_link_max: 3,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn dimensions(mut self, dimensions: usize) -> Self {
        self.embedding_dimensions = dimensions;
        self
    }

    pub fn decay_rates(mut self, node_rate: f64, edge_rate: f64) -> Self {
        self.node_decay_rate = node_rate;
        self.edge_decay_rate = edge_rate;
        self
    }

    pub fn grace_window(mut self, window: Duration) -> Self {
        self.grace_window = window;
        self
    }

    pub fn merge_thresholds(mut self, similarity: f32, edge_weight: f32) -> Self {
        self.merge_similarity_threshold = similarity;
        self.merge_edge_threshold = edge_weight;
        self
    }

    pub fn eviction_threshold(mut self, threshold: f32) -> Self {
        self.eviction_threshold = threshold;
        self
    }

    pub fn capacity(mut self, floor: usize, ceiling: usize) -> Self {
        self.capacity_floor = floor;
        self.capacity_ceiling = ceiling;
        self
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Get the path to the append-only event log
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Ensure the data directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    /// Reject parameter combinations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimensions == 0 {
            return Err(Error::config("embedding_dimensions must be positive"));
        }

        let unit = [
            ("default_strength", self.default_strength),
            ("reinforcement", self.reinforcement),
            ("edge_prune_threshold", self.edge_prune_threshold),
            ("merge_similarity_threshold", self.merge_similarity_threshold),
            ("merge_edge_threshold", self.merge_edge_threshold),
            ("eviction_threshold", self.eviction_threshold),
            ("expansion_min_weight", self.expansion_min_weight),
            ("secondary_discount", self.secondary_discount),
            ("auto_link_similarity_threshold", self.auto_link_similarity_threshold),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }

        if self.node_decay_rate < 0.0 || self.edge_decay_rate < 0.0 {
            return Err(Error::config("decay rates must not be negative"));
        }
        if self.capacity_ceiling < self.capacity_floor {
            return Err(Error::config(format!(
                "capacity_ceiling ({}) is below capacity_floor ({})",
                self.capacity_ceiling, self.capacity_floor
            )));
        }
        if self.candidate_multiplier == 0 {
            return Err(Error::config("candidate_multiplier must be at least 1"));
        }
        if self.recency_half_life.is_zero() {
            return Err(Error::config("recency_half_life must be positive"));
        }

        let w = self.score_weights;
        if [w.similarity, w.strength, w.recency, w.associative]
            .iter()
            .any(|x| !x.is_finite() || *x < 0.0)
        {
            return Err(Error::config("score weights must be finite and non-negative"));
        }

        Ok(())
    }
}
