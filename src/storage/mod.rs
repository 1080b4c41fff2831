//! Persistence adapters
//!
//! The core never writes to disk itself. It hands ordered batches of
//! [`SequencedEvent`]s to a [`PersistenceAdapter`] and, on startup, asks the
//! adapter for a [`Snapshot`] to restore from. Adapters must tolerate a batch
//! being delivered twice (events at or below the last stored sequence are
//! ignored).

mod jsonl;
mod sqlite;

pub use jsonl::JsonlEventLog;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::events::{SequencedEvent, Snapshot};

/// Durable storage boundary for nodes, edges and merge history
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Persist a batch of events, in order. Either the whole batch is
    /// accepted or an error is returned.
    async fn apply(&self, events: &[SequencedEvent]) -> Result<()>;

    /// Rebuild the full persisted state
    async fn load(&self) -> Result<Snapshot>;

    /// Highest event sequence already stored. Events numbered at or below it
    /// would be ignored, so writers must number new events above it.
    async fn last_sequence(&self) -> Result<u64> {
        Ok(self.load().await?.last_sequence)
    }
}
