//! # MNE Memory
//!
//! Memory-Node Encapsulation: an episodic memory engine for cognitive agents.
//!
//! ## Architecture
//!
//! - **Node Store** - the authoritative table of memory nodes and their lifecycle
//! - **Associative Graph** - weighted edges between nodes, kept as an adjacency index
//! - **Consolidation Engine** - explicit sweeps that decay, merge and evict
//! - **Retrieval Planner** - similarity search plus one-hop expansion and composite ranking
//!
//! Embedding, similarity search and durable storage sit behind the
//! [`EmbeddingGateway`], [`SimilarityIndex`] and [`PersistenceAdapter`] traits.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mne_memory::{Config, Content, EpisodicMemory, JsonlEventLog, QueryFilters};
//!
//! let config = Config::default();
//! let log = Arc::new(JsonlEventLog::new(&config)?);
//! let memory = EpisodicMemory::builder(config, embedder).persistence(log).build()?;
//! memory.restore().await?;
//!
//! let id = memory.remember(Content::text("the kettle whistled"), vec!["kitchen".into()]).await?;
//! let hits = memory.recall(&Content::text("kettle"), 5, &QueryFilters::default()).await?;
//!
//! memory.sweep(Duration::from_secs(3600)).await?;
//! memory.shutdown().await?;
//! ```

pub mod clock;
pub mod config;
pub mod consolidation;
pub mod embedding;
pub mod error;
pub mod events;
pub mod graph;
pub mod index;
pub mod memory;
pub mod node;
mod properties;
pub mod retrieval;
pub mod storage;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ScoreWeights};
pub use consolidation::{ConsolidationEngine, MergeRecord, SweepReport};
pub use embedding::EmbeddingGateway;
#[cfg(feature = "fastembed")]
pub use embedding::FastEmbedGateway;
pub use error::{Error, Result};
pub use events::{EventOutbox, PersistenceEvent, SequencedEvent, Snapshot, SnapshotBuilder};
pub use graph::{AssociativeGraph, Edge, EdgeKey, EdgeKind};
#[cfg(feature = "lancedb")]
pub use index::LanceIndex;
pub use index::{FlatIndex, SimilarityIndex};
pub use memory::{EpisodicMemory, EpisodicMemoryBuilder, MemoryStats};
pub use node::{Content, MemoryNode, Modality, NewNode, NodeId, NodeStatus};
pub use retrieval::{Origin, QueryFilters, RetrievalPlanner, ScoreBreakdown, ScoredNode};
pub use storage::{JsonlEventLog, PersistenceAdapter, SqliteStore};
pub use store::NodeStore;
