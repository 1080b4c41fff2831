//! Similarity index backed by LanceDB

use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

use super::SimilarityIndex;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::NodeId;

const TABLE_NAME: &str = "node_vectors";

/// Node embeddings stored in a LanceDB table
pub struct LanceIndex {
    db: lancedb::Connection,
    dimensions: usize,
}

impl LanceIndex {
    /// Open (or create) the index under the configured vector path
    pub async fn open(config: &Config) -> Result<Self> {
        let path = config.vector_db_path();
        let uri = path
            .to_str()
            .ok_or_else(|| Error::config(format!("vector path is not valid UTF-8: {}", path.display())))?;

        let db = connect(uri)
            .execute()
            .await
            .map_err(|e| Error::index("open", e))?;

        let index = Self {
            db,
            dimensions: config.embedding_dimensions,
        };
        index.ensure_table().await?;
        Ok(index)
    }

    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    async fn ensure_table(&self) -> Result<()> {
        let tables = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::index("list tables", e))?;

        if !tables.iter().any(|t| t == TABLE_NAME) {
            let schema = Arc::new(self.schema());
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![empty_batch].into_iter().map(Ok), schema);

            self.db
                .create_table(TABLE_NAME, Box::new(reader))
                .execute()
                .await
                .map_err(|e| Error::index("create table", e))?;
        }
        Ok(())
    }

    async fn table(&self, operation: &str) -> Result<lancedb::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| Error::index(operation, e))
    }
}

#[async_trait]
impl SimilarityIndex for LanceIndex {
    async fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        let table = self.table("nearest").await?;

        let stream = table
            .vector_search(vector.to_vec())
            .map_err(|e| Error::index("nearest", e))?
            .limit(k)
            .execute()
            .await
            .map_err(|e| Error::index("nearest", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(|e: lancedb::Error| Error::index("nearest", e))?;

        let mut hits = Vec::new();
        for batch in batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| Error::index("nearest", "missing id column"))?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| Error::index("nearest", "missing _distance column"))?;

            for i in 0..batch.num_rows() {
                // L2 distance to a similarity in (0, 1]
                let score = 1.0 / (1.0 + distances.value(i));
                hits.push((NodeId::parse(ids.value(i))?, score));
            }
        }

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(hits)
    }

    async fn upsert(&self, id: NodeId, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::validation(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }

        self.remove(id).await?;

        let id_array = StringArray::from(vec![id.to_string()]);
        let values = Float32Array::from(vector);
        let vector_array = FixedSizeListArray::try_new_from_values(values, self.dimensions as i32)
            .map_err(|e: arrow_schema::ArrowError| Error::index("upsert", e))?;

        let schema = Arc::new(self.schema());
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(id_array) as Arc<dyn Array>, Arc::new(vector_array)],
        )
        .map_err(|e| Error::index("upsert", e))?;
        let reader = RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema);

        self.table("upsert")
            .await?
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| Error::index("upsert", e))?;
        Ok(())
    }

    async fn remove(&self, id: NodeId) -> Result<()> {
        self.table("remove")
            .await?
            .delete(&format!("id = '{}'", id))
            .await
            .map_err(|e| Error::index("remove", e))?;
        Ok(())
    }
}
