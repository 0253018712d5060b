//! Durable storage seam.
//!
//! The relational store is the system of record for pools, participants,
//! contributions, reward stats, checkpoints and torrent metadata. The swarm
//! only talks to it through [`PoolStore`]. [`MemoryStore`] is the in-process
//! implementation used by tests and the demo binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::checkpoint::TrainingMetrics;
use crate::error::{StorageError, StorageResult};
use crate::training::ResourceCapacity;

/// Lifecycle of a training pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    #[default]
    Active,
    Training,
    Completed,
}

/// A training pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: String,
    pub name: String,
    /// LLM, Computer Vision, ...
    pub model_type: String,
    pub description: String,
    pub min_cpu_cores: u32,
    pub min_gpu_memory: u64,
    pub min_ram_gb: u32,
    pub reward_per_hour: f64,
    pub status: PoolStatus,
    /// 0..=100
    pub training_progress: u8,
    pub participant_count: u32,
    /// Open-source model the pool was seeded from
    pub source_model_id: Option<String>,
    pub training_config: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl PoolRecord {
    /// A fresh active pool with no participants.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, model_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model_type: model_type.into(),
            description: String::new(),
            min_cpu_cores: 0,
            min_gpu_memory: 0,
            min_ram_gb: 0,
            reward_per_hour: 0.0,
            status: PoolStatus::Active,
            training_progress: 0,
            participant_count: 0,
            source_model_id: None,
            training_config: None,
            created_at: Utc::now(),
        }
    }
}

/// Partial pool update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolUpdate {
    pub reward_per_hour: Option<f64>,
    pub status: Option<PoolStatus>,
    pub training_progress: Option<u8>,
    pub participant_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    /// Wallet address
    pub identity: String,
}

/// Resources a participant committed to a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContribution {
    pub id: String,
    pub participant_id: String,
    pub pool_id: String,
    pub cpu_cores_allocated: u32,
    pub gpu_memory_allocated: u64,
    pub ram_allocated: u32,
    pub hours_contributed: f64,
    pub rewards_earned: f64,
    pub is_active: bool,
}

impl ResourceContribution {
    /// A fresh active contribution.
    #[must_use]
    pub fn new(participant_id: &str, pool_id: &str, allocation: ResourceCapacity) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participant_id: participant_id.to_string(),
            pool_id: pool_id.to_string(),
            cpu_cores_allocated: allocation.cpu_cores,
            gpu_memory_allocated: allocation.gpu_memory_mb,
            ram_allocated: allocation.ram_gb,
            hours_contributed: 0.0,
            rewards_earned: 0.0,
            is_active: true,
        }
    }

    /// The allocation as a capacity.
    #[must_use]
    pub fn allocation(&self) -> ResourceCapacity {
        ResourceCapacity {
            cpu_cores: self.cpu_cores_allocated,
            gpu_memory_mb: self.gpu_memory_allocated,
            ram_gb: self.ram_allocated,
        }
    }
}

/// Partial contribution update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContributionUpdate {
    pub hours_contributed: Option<f64>,
    pub rewards_earned: Option<f64>,
    pub is_active: Option<bool>,
    pub allocation: Option<ResourceCapacity>,
}

/// Per-participant reward and uptime totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub participant_id: String,
    pub total_cpu_hours: f64,
    pub total_gpu_hours: f64,
    pub total_earnings: f64,
    pub network_rank: u32,
    pub uptime_percentage: f64,
}

impl ResourceStats {
    #[must_use]
    pub fn empty(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            total_cpu_hours: 0.0,
            total_gpu_hours: 0.0,
            total_earnings: 0.0,
            network_rank: 0,
            uptime_percentage: 0.0,
        }
    }
}

/// A durably persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub pool_id: String,
    pub version: u64,
    pub model_data: serde_json::Value,
    pub captured_at: DateTime<Utc>,
    /// Participants whose nodes were live when the checkpoint was taken
    pub training_nodes: Vec<String>,
    pub training_metrics: Option<TrainingMetrics>,
}

/// Persisted torrent metadata, enough to rejoin without an in-memory torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub resource_id: String,
    pub locator: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub chunk_size: usize,
    pub version: u64,
    pub is_active_training: bool,
    pub last_updated_at: DateTime<Utc>,
}

/// Partial torrent update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentUpdate {
    pub version: Option<u64>,
    pub is_active_training: Option<bool>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Durable store operations the swarm depends on.
#[async_trait]
pub trait PoolStore: Send + Sync + 'static {
    async fn get_pool(&self, pool_id: &str) -> StorageResult<Option<PoolRecord>>;
    async fn create_pool(&self, pool: PoolRecord) -> StorageResult<PoolRecord>;
    async fn update_pool(&self, pool_id: &str, update: PoolUpdate) -> StorageResult<PoolRecord>;

    async fn get_participant_by_identity(&self, identity: &str)
    -> StorageResult<Option<Participant>>;
    async fn create_participant(&self, identity: &str) -> StorageResult<Participant>;

    async fn get_contributions(&self, participant_id: &str)
    -> StorageResult<Vec<ResourceContribution>>;
    async fn get_active_contributions(
        &self,
        participant_id: &str,
    ) -> StorageResult<Vec<ResourceContribution>>;
    async fn create_contribution(
        &self,
        contribution: ResourceContribution,
    ) -> StorageResult<ResourceContribution>;
    async fn update_contribution(
        &self,
        contribution_id: &str,
        update: ContributionUpdate,
    ) -> StorageResult<ResourceContribution>;

    /// Increment the pool's participant count and create an active
    /// contribution as one atomic step.
    async fn join_pool(
        &self,
        participant_id: &str,
        pool_id: &str,
        allocation: ResourceCapacity,
    ) -> StorageResult<ResourceContribution>;

    async fn get_resource_stats(&self, participant_id: &str)
    -> StorageResult<Option<ResourceStats>>;
    async fn upsert_resource_stats(&self, stats: ResourceStats) -> StorageResult<ResourceStats>;

    /// Versions are write-once: saving an existing version fails with
    /// [`StorageError::AlreadyExists`].
    async fn save_checkpoint(&self, checkpoint: CheckpointRecord) -> StorageResult<()>;
    /// Highest-version checkpoint of the pool.
    async fn get_latest_checkpoint(&self, pool_id: &str)
    -> StorageResult<Option<CheckpointRecord>>;
    /// Every checkpoint of the pool, ascending by version.
    async fn get_checkpoint_history(&self, pool_id: &str) -> StorageResult<Vec<CheckpointRecord>>;

    async fn save_torrent(&self, torrent: TorrentRecord) -> StorageResult<()>;
    async fn update_torrent(&self, resource_id: &str, update: TorrentUpdate) -> StorageResult<()>;
    async fn get_torrent(&self, resource_id: &str) -> StorageResult<Option<TorrentRecord>>;
}

#[derive(Debug, Default)]
struct Tables {
    pools: HashMap<String, PoolRecord>,
    /// Keyed by participant id
    participants: HashMap<String, Participant>,
    contributions: HashMap<String, ResourceContribution>,
    /// Keyed by participant id
    stats: HashMap<String, ResourceStats>,
    /// Pool id to checkpoints by version
    checkpoints: HashMap<String, BTreeMap<u64, CheckpointRecord>>,
    torrents: HashMap<String, TorrentRecord>,
}

/// In-memory [`PoolStore`]. One lock covers every table, so multi-record
/// writes are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(entity: &'static str, id: &str) -> StorageError {
    StorageError::NotFound {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn get_pool(&self, pool_id: &str) -> StorageResult<Option<PoolRecord>> {
        Ok(self.tables.read().await.pools.get(pool_id).cloned())
    }

    async fn create_pool(&self, pool: PoolRecord) -> StorageResult<PoolRecord> {
        let mut tables = self.tables.write().await;
        if tables.pools.contains_key(&pool.id) {
            return Err(StorageError::AlreadyExists {
                entity: "pool",
                id: pool.id,
            });
        }
        tables.pools.insert(pool.id.clone(), pool.clone());
        Ok(pool)
    }

    async fn update_pool(&self, pool_id: &str, update: PoolUpdate) -> StorageResult<PoolRecord> {
        let mut tables = self.tables.write().await;
        let pool = tables
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| not_found("pool", pool_id))?;
        if let Some(reward) = update.reward_per_hour {
            pool.reward_per_hour = reward;
        }
        if let Some(status) = update.status {
            pool.status = status;
        }
        if let Some(progress) = update.training_progress {
            pool.training_progress = progress.min(100);
        }
        if let Some(count) = update.participant_count {
            pool.participant_count = count;
        }
        Ok(pool.clone())
    }

    async fn get_participant_by_identity(
        &self,
        identity: &str,
    ) -> StorageResult<Option<Participant>> {
        Ok(self
            .tables
            .read()
            .await
            .participants
            .values()
            .find(|p| p.identity == identity)
            .cloned())
    }

    async fn create_participant(&self, identity: &str) -> StorageResult<Participant> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.participants.values().find(|p| p.identity == identity) {
            return Err(StorageError::AlreadyExists {
                entity: "participant",
                id: existing.id.clone(),
            });
        }
        let participant = Participant {
            id: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
        };
        tables
            .participants
            .insert(participant.id.clone(), participant.clone());
        Ok(participant)
    }

    async fn get_contributions(
        &self,
        participant_id: &str,
    ) -> StorageResult<Vec<ResourceContribution>> {
        Ok(self
            .tables
            .read()
            .await
            .contributions
            .values()
            .filter(|c| c.participant_id == participant_id)
            .cloned()
            .collect())
    }

    async fn get_active_contributions(
        &self,
        participant_id: &str,
    ) -> StorageResult<Vec<ResourceContribution>> {
        let mut active = self.get_contributions(participant_id).await?;
        active.retain(|c| c.is_active);
        Ok(active)
    }

    async fn create_contribution(
        &self,
        contribution: ResourceContribution,
    ) -> StorageResult<ResourceContribution> {
        let mut tables = self.tables.write().await;
        if !tables.pools.contains_key(&contribution.pool_id) {
            return Err(not_found("pool", &contribution.pool_id));
        }
        tables
            .contributions
            .insert(contribution.id.clone(), contribution.clone());
        Ok(contribution)
    }

    async fn update_contribution(
        &self,
        contribution_id: &str,
        update: ContributionUpdate,
    ) -> StorageResult<ResourceContribution> {
        let mut tables = self.tables.write().await;
        let contribution = tables
            .contributions
            .get_mut(contribution_id)
            .ok_or_else(|| not_found("contribution", contribution_id))?;
        if let Some(hours) = update.hours_contributed {
            contribution.hours_contributed = hours;
        }
        if let Some(rewards) = update.rewards_earned {
            contribution.rewards_earned = rewards;
        }
        if let Some(active) = update.is_active {
            contribution.is_active = active;
        }
        if let Some(allocation) = update.allocation {
            contribution.cpu_cores_allocated = allocation.cpu_cores;
            contribution.gpu_memory_allocated = allocation.gpu_memory_mb;
            contribution.ram_allocated = allocation.ram_gb;
        }
        Ok(contribution.clone())
    }

    async fn join_pool(
        &self,
        participant_id: &str,
        pool_id: &str,
        allocation: ResourceCapacity,
    ) -> StorageResult<ResourceContribution> {
        let mut tables = self.tables.write().await;
        if !tables.participants.contains_key(participant_id) {
            return Err(not_found("participant", participant_id));
        }
        if let Some(existing) = tables
            .contributions
            .values()
            .find(|c| c.is_active && c.participant_id == participant_id && c.pool_id == pool_id)
        {
            return Err(StorageError::AlreadyExists {
                entity: "contribution",
                id: existing.id.clone(),
            });
        }

        let pool = tables
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| not_found("pool", pool_id))?;
        pool.participant_count = pool.participant_count.saturating_add(1);

        let contribution = ResourceContribution::new(participant_id, pool_id, allocation);
        tables
            .contributions
            .insert(contribution.id.clone(), contribution.clone());
        Ok(contribution)
    }

    async fn get_resource_stats(&self, participant_id: &str) -> StorageResult<Option<ResourceStats>> {
        Ok(self.tables.read().await.stats.get(participant_id).cloned())
    }

    async fn upsert_resource_stats(&self, stats: ResourceStats) -> StorageResult<ResourceStats> {
        self.tables
            .write()
            .await
            .stats
            .insert(stats.participant_id.clone(), stats.clone());
        Ok(stats)
    }

    async fn save_checkpoint(&self, checkpoint: CheckpointRecord) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let versions = tables
            .checkpoints
            .entry(checkpoint.pool_id.clone())
            .or_default();
        if versions.contains_key(&checkpoint.version) {
            return Err(StorageError::AlreadyExists {
                entity: "checkpoint",
                id: format!("{}@{}", checkpoint.pool_id, checkpoint.version),
            });
        }
        versions.insert(checkpoint.version, checkpoint);
        Ok(())
    }

    async fn get_latest_checkpoint(
        &self,
        pool_id: &str,
    ) -> StorageResult<Option<CheckpointRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .checkpoints
            .get(pool_id)
            .and_then(|by_version| by_version.values().next_back())
            .cloned())
    }

    async fn get_checkpoint_history(&self, pool_id: &str) -> StorageResult<Vec<CheckpointRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .checkpoints
            .get(pool_id)
            .map(|by_version| by_version.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_torrent(&self, torrent: TorrentRecord) -> StorageResult<()> {
        self.tables
            .write()
            .await
            .torrents
            .insert(torrent.resource_id.clone(), torrent);
        Ok(())
    }

    async fn update_torrent(&self, resource_id: &str, update: TorrentUpdate) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let torrent = tables
            .torrents
            .get_mut(resource_id)
            .ok_or_else(|| not_found("torrent", resource_id))?;
        if let Some(version) = update.version {
            torrent.version = version;
        }
        if let Some(active) = update.is_active_training {
            torrent.is_active_training = active;
        }
        if let Some(at) = update.last_updated_at {
            torrent.last_updated_at = at;
        }
        Ok(())
    }

    async fn get_torrent(&self, resource_id: &str) -> StorageResult<Option<TorrentRecord>> {
        Ok(self.tables.read().await.torrents.get(resource_id).cloned())
    }
}
