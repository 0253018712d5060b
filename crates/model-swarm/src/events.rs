//! Outward-facing events.
//!
//! Every node publishes [`NetworkEvent`]s on its own broadcast channel. The
//! coordinator relays them onto its bus alongside the events it emits itself
//! (pool scaling, resyncs, pool-level model updates), so a single
//! `subscribe()` sees the whole network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::TrainingMetrics;
use crate::torrent::Torrent;
use crate::training::{ResourceRequirement, ResourceUsage, TrainingResult};

/// Default capacity of node and coordinator event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    TorrentCreated {
        node_id: String,
        participant: String,
        torrent: Box<Torrent>,
    },
    TorrentJoined {
        node_id: String,
        participant: String,
        resource_id: String,
        locator: String,
    },
    ChunkDownloaded {
        node_id: String,
        participant: String,
        resource_id: String,
        chunk_id: String,
        from_peer: String,
        bytes: u64,
    },
    ChunkUploaded {
        node_id: String,
        participant: String,
        chunk_id: String,
        to_peer: String,
        bytes: u64,
    },
    ChunkUnavailable {
        node_id: String,
        resource_id: String,
        chunk_id: String,
        attempts: u32,
        reason: String,
    },
    /// A resource was republished. `node_id` is `None` for the pool-level
    /// event the coordinator emits after a fan-out, which is the only
    /// `ModelUpdated` on the coordinator bus.
    ModelUpdated {
        resource_id: String,
        version: u64,
        node_id: Option<String>,
        active_nodes: Option<usize>,
    },
    NodeResynced {
        participant: String,
        resource_id: String,
        from_version: u64,
        to_version: u64,
    },
    NodeSynced {
        participant: String,
        pool_id: String,
        new_version: u64,
        synced_at: DateTime<Utc>,
    },
    PoolScaling {
        pool_id: String,
        from: u32,
        to: u32,
        reward_boost: f64,
    },
    TrainingStarted {
        node_id: String,
        resource_id: String,
        task_id: Uuid,
        batch_id: String,
    },
    TrainingProgress {
        node_id: String,
        resource_id: String,
        task_id: Uuid,
        progress: u8,
        usage: ResourceUsage,
    },
    TrainingCompleted {
        node_id: String,
        resource_id: String,
        task_id: Uuid,
        batch_id: String,
        result: Box<TrainingResult>,
    },
    TrainingFailed {
        node_id: String,
        resource_id: String,
        task_id: Uuid,
        batch_id: String,
        error: String,
    },
    ResultDistributed {
        node_id: String,
        resource_id: String,
        result_chunk_id: String,
        recipients: usize,
    },
    CheckpointSaved {
        node_id: String,
        resource_id: String,
        version: u64,
        chunk_id: String,
    },
    CheckpointDownloaded {
        node_id: String,
        resource_id: String,
        version: u64,
        from_peer: String,
    },
    ModelSynced {
        node_id: String,
        resource_id: String,
        target_version: u64,
        synced_to: u64,
    },
    TrainingProgressUpdated {
        node_id: String,
        resource_id: String,
        version: u64,
        metrics: TrainingMetrics,
    },
    ResourcesReallocated {
        node_id: String,
        resource_id: String,
        requirement: ResourceRequirement,
        success: bool,
    },
}

impl NetworkEvent {
    /// Event name as it appears in the serialized `type` tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TorrentCreated { .. } => "torrent_created",
            Self::TorrentJoined { .. } => "torrent_joined",
            Self::ChunkDownloaded { .. } => "chunk_downloaded",
            Self::ChunkUploaded { .. } => "chunk_uploaded",
            Self::ChunkUnavailable { .. } => "chunk_unavailable",
            Self::ModelUpdated { .. } => "model_updated",
            Self::NodeResynced { .. } => "node_resynced",
            Self::NodeSynced { .. } => "node_synced",
            Self::PoolScaling { .. } => "pool_scaling",
            Self::TrainingStarted { .. } => "training_started",
            Self::TrainingProgress { .. } => "training_progress",
            Self::TrainingCompleted { .. } => "training_completed",
            Self::TrainingFailed { .. } => "training_failed",
            Self::ResultDistributed { .. } => "result_distributed",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::CheckpointDownloaded { .. } => "checkpoint_downloaded",
            Self::ModelSynced { .. } => "model_synced",
            Self::TrainingProgressUpdated { .. } => "training_progress_updated",
            Self::ResourcesReallocated { .. } => "resources_reallocated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_tag_matches_kind() {
        let event = NetworkEvent::PoolScaling {
            pool_id: "p".into(),
            from: 3,
            to: 15,
            reward_boost: 1.5,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
        assert_eq!(value["to"], 15);

        let back: NetworkEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_pool_level_model_update_has_no_node() {
        let event = NetworkEvent::ModelUpdated {
            resource_id: "p".into(),
            version: 2,
            node_id: None,
            active_nodes: Some(4),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "model_updated");
        assert!(value["node_id"].is_null());
    }
}
