//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use mne_memory::{
    Content, EmbeddingGateway, Error, NodeId, PersistenceAdapter, Result, SequencedEvent, SimilarityIndex, Snapshot,
    SnapshotBuilder,
};

static TRACING: Once = Once::new();

/// Route engine logs to the test harness; honours `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mne_memory=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Embeds by table lookup; unknown text fails
pub struct TableEmbedder {
    dimensions: usize,
    table: Mutex<HashMap<String, Vec<f32>>>,
}

impl TableEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn with(self, text: &str, vector: &[f32]) -> Self {
        self.table.lock().unwrap().insert(text.to_string(), vector.to_vec());
        self
    }
}

#[async_trait]
impl EmbeddingGateway for TableEmbedder {
    async fn embed(&self, content: &Content) -> Result<Vec<f32>> {
        let text = content.embedding_text();
        self.table
            .lock()
            .unwrap()
            .get(&text)
            .cloned()
            .ok_or_else(|| Error::embedding("embed", format!("no vector for {:?}", text)))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Similarity index that always answers with a fixed list
pub struct FixedIndex {
    hits: Mutex<Vec<(NodeId, f32)>>,
}

impl FixedIndex {
    pub fn new() -> Self {
        Self {
            hits: Mutex::new(Vec::new()),
        }
    }

    pub fn answer(&self, hits: Vec<(NodeId, f32)>) {
        *self.hits.lock().unwrap() = hits;
    }
}

#[async_trait]
impl SimilarityIndex for FixedIndex {
    async fn nearest(&self, _vector: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        Ok(self.hits.lock().unwrap().iter().take(k).copied().collect())
    }

    async fn upsert(&self, _id: NodeId, _vector: Vec<f32>) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _id: NodeId) -> Result<()> {
        Ok(())
    }
}

/// In-memory adapter that can be switched into a failing state
#[derive(Default)]
pub struct FlakyAdapter {
    failing: AtomicBool,
    batches: Mutex<Vec<Vec<SequencedEvent>>>,
}

impl FlakyAdapter {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<SequencedEvent>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<SequencedEvent> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl PersistenceAdapter for FlakyAdapter {
    async fn apply(&self, events: &[SequencedEvent]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::persistence("apply", "adapter offline"));
        }
        self.batches.lock().unwrap().push(events.to_vec());
        Ok(())
    }

    async fn load(&self) -> Result<Snapshot> {
        let mut builder = SnapshotBuilder::new();
        for event in self.events() {
            builder.apply(&event);
        }
        Ok(builder.build())
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
