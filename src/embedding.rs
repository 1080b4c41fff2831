//! Embedding gateway
//!
//! Content is turned into a vector exactly once, when a node is created.
//! Failures surface as [`Error::EmbeddingUnavailable`] and abort the ingestion.

use async_trait::async_trait;

#[cfg(feature = "fastembed")]
pub use local::FastEmbedGateway;

use crate::error::Result;
use crate::node::Content;

/// Converts episodic content into a fixed-length vector
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, content: &Content) -> Result<Vec<f32>>;

    /// Dimension of every vector this gateway returns
    fn dimensions(&self) -> usize;
}

#[cfg(feature = "fastembed")]
mod local {
    use std::sync::Arc;

    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use tokio::sync::Mutex;

    use super::EmbeddingGateway;
    use crate::config::Config;
    use crate::error::{Error, Result};
    use crate::node::Content;

    /// Local embedding model via fastembed (no API keys)
    pub struct FastEmbedGateway {
        model: Arc<Mutex<TextEmbedding>>,
        dimensions: usize,
    }

    impl FastEmbedGateway {
        /// Load all-MiniLM-L6-v2 (384 dimensions). The model downloads on first use.
        pub fn new(config: &Config) -> Result<Self> {
            let model = TextEmbedding::try_new(
                InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(true),
            )
            .map_err(|e| Error::embedding("load model", e))?;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
                dimensions: config.embedding_dimensions,
            })
        }

        /// Embed several pieces of content in one model call
        pub async fn embed_batch(&self, contents: &[Content]) -> Result<Vec<Vec<f32>>> {
            if contents.is_empty() {
                return Ok(Vec::new());
            }
            let texts: Vec<String> = contents.iter().map(Content::embedding_text).collect();

            let mut guard = self.model.lock().await;
            guard
                .embed(texts, None)
                .map_err(|e| Error::embedding("embed batch", e))
        }
    }

    #[async_trait]
    impl EmbeddingGateway for FastEmbedGateway {
        async fn embed(&self, content: &Content) -> Result<Vec<f32>> {
            let text = content.embedding_text();

            let mut guard = self.model.lock().await;
            let embeddings = guard
                .embed(vec![text], None)
                .map_err(|e| Error::embedding("embed", e))?;

            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| Error::embedding("embed", "model returned no embedding"))
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }
    }
}
