//! Similarity indexes
//!
//! The retrieval planner only needs nearest-neighbour lookups; how those are
//! answered is up to the index. [`FlatIndex`] does an exact scan and is the
//! default. With the `lancedb` feature, [`LanceIndex`] keeps vectors on disk.

#[cfg(feature = "lancedb")]
mod lance;

#[cfg(feature = "lancedb")]
pub use lance::LanceIndex;

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::node::{cosine_similarity, NodeId};

/// Nearest-neighbour lookup over node embeddings
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Up to `k` ids nearest to `vector`, most similar first
    async fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>>;

    /// Insert or replace the vector stored for `id`
    async fn upsert(&self, id: NodeId, vector: Vec<f32>) -> Result<()>;

    /// Forget `id`. Removing an unknown id is not an error.
    async fn remove(&self, id: NodeId) -> Result<()>;
}

/// Exact in-memory cosine index
#[derive(Debug, Default)]
pub struct FlatIndex {
    vectors: RwLock<BTreeMap<NodeId, Vec<f32>>>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SimilarityIndex for FlatIndex {
    async fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        let vectors = self
            .vectors
            .read()
            .map_err(|e| Error::index("nearest", e))?;

        let mut scored: Vec<(NodeId, f32)> = vectors
            .iter()
            .map(|(id, v)| (*id, cosine_similarity(vector, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn upsert(&self, id: NodeId, vector: Vec<f32>) -> Result<()> {
        let mut vectors = self
            .vectors
            .write()
            .map_err(|e| Error::index("upsert", e))?;
        vectors.insert(id, vector);
        Ok(())
    }

    async fn remove(&self, id: NodeId) -> Result<()> {
        let mut vectors = self
            .vectors
            .write()
            .map_err(|e| Error::index("remove", e))?;
        vectors.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flat_index_ranks_by_cosine() {
        let index = FlatIndex::new();
        let near = NodeId::new();
        let far = NodeId::new();
        index.upsert(near, vec![1.0, 0.1]).await.unwrap();
        index.upsert(far, vec![0.0, 1.0]).await.unwrap();

        let hits = index.nearest(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, near);
        assert!(hits[0].1 > hits[1].1);

        let top = index.nearest(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top, vec![hits[0]]);
    }

    #[tokio::test]
    async fn flat_index_remove_is_idempotent() {
        let index = FlatIndex::new();
        let id = NodeId::new();
        index.upsert(id, vec![1.0, 0.0]).await.unwrap();
        index.remove(id).await.unwrap();
        index.remove(id).await.unwrap();
        assert!(index.is_empty());
        assert!(index.nearest(&[1.0, 0.0], 3).await.unwrap().is_empty());
    }

    #[test]
    fn flat_index_ties_break_by_id() {
        let index = FlatIndex::new();
        let mut ids = vec![NodeId::new(), NodeId::new(), NodeId::new()];
        tokio_test::block_on(async {
            for id in &ids {
                index.upsert(*id, vec![0.0, 1.0]).await.unwrap();
            }
        });
        ids.sort();

        let hits = tokio_test::block_on(index.nearest(&[0.0, 1.0], 3)).unwrap();
        let order: Vec<NodeId> = hits.into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, ids);
    }
}
