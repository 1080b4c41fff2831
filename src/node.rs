//! Memory node types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique, never-reused identifier of a memory node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its string form
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::validation(format!("invalid node id {:?}: {}", s, e)))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for NodeId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The captured payload of an experience
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    /// Free text, e.g. an utterance or an observation summary
    Text { text: String },

    /// A structured record
    Structured { record: serde_json::Value },

    /// A pointer to content held elsewhere
    Reference {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn structured(record: serde_json::Value) -> Self {
        Self::Structured { record }
    }

    pub fn reference(uri: impl Into<String>, media_type: Option<String>) -> Self {
        Self::Reference {
            uri: uri.into(),
            media_type,
        }
    }

    /// Text handed to an embedding model for this content
    pub fn embedding_text(&self) -> String {
        match self {
            Content::Text { text } => text.clone(),
            Content::Structured { record } => record.to_string(),
            Content::Reference { uri, media_type } => match media_type {
                Some(mt) => format!("{} ({})", uri, mt),
                None => uri.clone(),
            },
        }
    }
}

/// Sensory or representational channel of an experience
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Visual,
    Auditory,
    Action,
    Multimodal,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Text => write!(f, "text"),
            Modality::Visual => write!(f, "visual"),
            Modality::Auditory => write!(f, "auditory"),
            Modality::Action => write!(f, "action"),
            Modality::Multimodal => write!(f, "multimodal"),
        }
    }
}

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    /// Merged into a surviving node; still readable
    Consolidated,
    /// Terminal
    Evicted,
}

impl NodeStatus {
    /// Active and consolidated nodes are live; evicted ones are gone
    pub fn is_live(&self) -> bool {
        !matches!(self, NodeStatus::Evicted)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Consolidated => write!(f, "consolidated"),
            NodeStatus::Evicted => write!(f, "evicted"),
        }
    }
}

/// One encoded episodic experience
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: NodeId,

    pub content: Content,

    pub embedding: Vec<f32>,

    pub created_at: DateTime<Utc>,

    pub last_accessed_at: DateTime<Utc>,

    /// Salience in [0, 1]
    pub strength: f32,

    pub access_count: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modality: Option<Modality>,

    pub status: NodeStatus,

    /// Survivor this node was merged into, if consolidated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<NodeId>,

    /// Creation order within the store; breaks `created_at` ties
    pub sequence: u64,
}

impl MemoryNode {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }

    /// Ordering key for "older first": creation time, then creation sequence
    pub fn age_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }
}

/// Parameters for a node about to be created
#[derive(Debug, Clone)]
pub struct NewNode {
    pub content: Content,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
    pub modality: Option<Modality>,
}

impl NewNode {
    pub fn new(content: Content, embedding: Vec<f32>) -> Self {
        Self {
            content,
            embedding,
            tags: Vec::new(),
            modality: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = Some(modality);
        self
    }
}

/// Clamp a strength or weight into [0, 1], mapping NaN to 0
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm
/// or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Check that a vector has the expected dimension and only finite values
pub fn validate_embedding(embedding: &[f32], expected: usize) -> Result<()> {
    if embedding.len() != expected {
        return Err(Error::validation(format!(
            "Embedding dimension mismatch: expected {}, got {}",
            expected,
            embedding.len()
        )));
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(Error::validation("Embedding contains non-finite values"));
    }
    Ok(())
}
