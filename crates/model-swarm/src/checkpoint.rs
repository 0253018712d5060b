//! Checkpoints.
//!
//! A checkpoint is a versioned snapshot of a resource's training state. It is
//! persisted by the durable store and also JSON-encoded into a checkpoint
//! chunk (`{resource}_checkpoint_{version}`) so peers can pull it from each
//! other. A node's current version for a resource is the highest checkpoint
//! version it holds locally.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ChunkKind};
use crate::error::{SwarmError, SwarmResult};

/// Metrics captured alongside a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub epochs: u32,
}

/// A versioned snapshot of training state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub resource_id: String,
    pub version: u64,
    /// Opaque training state
    pub payload: serde_json::Value,
    pub captured_at: DateTime<Utc>,
    pub training_metrics: TrainingMetrics,
}

impl Checkpoint {
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        version: u64,
        payload: serde_json::Value,
        training_metrics: TrainingMetrics,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            version,
            payload,
            captured_at: Utc::now(),
            training_metrics,
        }
    }

    /// Chunk id this checkpoint is stored under.
    #[must_use]
    pub fn chunk_id(&self) -> String {
        ChunkKind::Checkpoint(self.version).chunk_id(&self.resource_id)
    }

    /// Encode into an out-of-band checkpoint chunk.
    pub fn to_chunk(&self) -> SwarmResult<Chunk> {
        let data = Bytes::from(serde_json::to_vec(self)?);
        Ok(Chunk::new(
            &self.resource_id,
            ChunkKind::Checkpoint(self.version),
            data,
        ))
    }

    /// Decode a checkpoint chunk, verifying its hash first.
    pub fn from_chunk(chunk: &Chunk) -> SwarmResult<Self> {
        chunk.ensure_valid()?;
        let ChunkKind::Checkpoint(version) = chunk.kind else {
            return Err(SwarmError::UnknownResource(chunk.id.clone()));
        };
        let checkpoint: Self = serde_json::from_slice(&chunk.data)?;
        if checkpoint.version != version || checkpoint.resource_id != chunk.resource_id {
            return Err(SwarmError::HashMismatch {
                chunk_id: chunk.id.clone(),
            });
        }
        Ok(checkpoint)
    }
}

/// Highest checkpoint version among `chunk_ids` for `resource_id`, or 0.
pub fn latest_version<'a, I>(resource_id: &str, chunk_ids: I) -> u64
where
    I: IntoIterator<Item = &'a String>,
{
    chunk_ids
        .into_iter()
        .filter_map(|id| match ChunkKind::parse(resource_id, id) {
            Some(ChunkKind::Checkpoint(version)) => Some(version),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

/// Every checkpoint version among `chunk_ids` for `resource_id`, ascending.
pub fn versions<'a, I>(resource_id: &str, chunk_ids: I) -> Vec<u64>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut versions: Vec<u64> = chunk_ids
        .into_iter()
        .filter_map(|id| match ChunkKind::parse(resource_id, id) {
            Some(ChunkKind::Checkpoint(version)) => Some(version),
            _ => None,
        })
        .collect();
    versions.sort_unstable();
    versions.dedup();
    versions
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metrics() -> TrainingMetrics {
        TrainingMetrics {
            loss: 0.25,
            accuracy: 0.9,
            epochs: 3,
        }
    }

    #[test]
    fn test_chunk_encoding() {
        let checkpoint = Checkpoint::new("pool", 4, json!({"weights": [1, 2]}), metrics());
        let chunk = checkpoint.to_chunk().unwrap();
        assert_eq!(chunk.id, "pool_checkpoint_4");
        assert!(!chunk.kind.is_data());
        assert_eq!(Checkpoint::from_chunk(&chunk).unwrap(), checkpoint);
    }

    #[test]
    fn test_from_chunk_rejects_tampering() {
        let mut chunk = Checkpoint::new("pool", 1, json!(null), metrics())
            .to_chunk()
            .unwrap();
        chunk.data = Bytes::from_static(b"{}");
        assert!(matches!(
            Checkpoint::from_chunk(&chunk),
            Err(SwarmError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_from_chunk_rejects_data_chunk() {
        let chunk = Chunk::new("pool", ChunkKind::Data(0), Bytes::from_static(b"{}"));
        assert!(Checkpoint::from_chunk(&chunk).is_err());
    }

    #[test]
    fn test_versions() {
        let ids: Vec<String> = [
            "pool_0",
            "pool_checkpoint_3",
            "pool_checkpoint_1",
            "poolx_checkpoint_9",
            "pool_result_5",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(latest_version("pool", &ids), 3);
        assert_eq!(versions("pool", &ids), vec![1, 3]);
        assert_eq!(latest_version("other", &ids), 0);
    }
}
