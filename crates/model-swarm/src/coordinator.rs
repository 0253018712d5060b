//! Network coordinator.
//!
//! The [`NetworkCoordinator`] owns every participant's [`Node`], the
//! network-wide torrent table and the event bus the route layer subscribes
//! to. Pool-level operations fan out across nodes and reconcile the result
//! with durable storage.
//!
//! ```text
//!   route layer ──▶ NetworkCoordinator ──────────────┬──▶ PoolStore (durable)
//!                     │  nodes: identity → Node      ├──▶ ModelRepository
//!                     │  torrents: resource → Torrent│
//!                     │  pool locks                  │
//!                     ▼                              │
//!          ┌──── Node A ── Node B ── Node C ───┐      │
//!          │      events ──▶ forwarder ────────┼──────┘ (torrent table, rewards)
//!          └───────────────────────────────────┘
//!                     │
//!                     ▼
//!            broadcast<NetworkEvent> ──▶ subscribers
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::checkpoint::TrainingMetrics;
use crate::config::{CoordinatorConfig, SwarmConfig};
use crate::error::{StorageError, StorageResult, SwarmError, SwarmResult};
use crate::events::NetworkEvent;
use crate::models::{ModelRepository, load_source_model};
use crate::node::Node;
use crate::storage::{
    CheckpointRecord, PoolRecord, PoolStatus, PoolStore, PoolUpdate, ResourceContribution,
    ResourceStats, TorrentRecord, TorrentUpdate,
};
use crate::torrent::Torrent;
use crate::training::{
    ComputeExecutor, ComputeTier, ResourceCapacity, ResourceRequirement, TaskControl,
    TrainingBatch, TrainingTask,
};
use crate::transport::ChunkTransport;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// What a new pool is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: String,
}

/// A node that did not apply a fan-out operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutFailure {
    pub identity: String,
    pub error: String,
}

/// Per-node outcome of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<FanOutFailure>,
}

impl FanOutReport {
    /// Whether every targeted node succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of resyncing one resource on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub resource_id: String,
    pub from_version: u64,
    /// Latest durable checkpoint version
    pub target_version: u64,
    /// Version actually reached; below target when peers had a gap
    pub synced_to: u64,
}

impl SyncOutcome {
    #[must_use]
    pub fn converged(&self) -> bool {
        self.synced_to >= self.target_version
    }
}

/// An auto-scaling reward boost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub pool_id: String,
    pub from: u32,
    pub to: u32,
    pub reward_boost: f64,
    pub reward_per_hour: f64,
}

/// Network-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_nodes: usize,
    pub total_torrents: usize,
    pub total_peers: usize,
    pub total_chunks: usize,
    /// 0..=100
    pub network_health: u8,
}

/// Credit a participant for bytes moved.
async fn credit_bandwidth(
    store: &dyn PoolStore,
    config: &CoordinatorConfig,
    identity: &str,
    bytes: u64,
) -> StorageResult<()> {
    let Some(participant) = store.get_participant_by_identity(identity).await? else {
        trace!(identity, "Skipping reward for unknown participant");
        return Ok(());
    };

    let mut stats = store
        .get_resource_stats(&participant.id)
        .await?
        .unwrap_or_else(|| ResourceStats::empty(&participant.id));
    stats.total_earnings += bytes as f64 / BYTES_PER_MIB * config.bandwidth_reward_per_mb;
    stats.uptime_percentage = config.active_uptime_percentage;
    store.upsert_resource_stats(stats).await?;
    Ok(())
}

/// Relay one node's events onto the coordinator bus, keeping the torrent
/// table and bandwidth rewards current.
///
/// Node-level `ModelUpdated` stays on the node's own channel; the bus carries
/// the single pool-level event [`NetworkCoordinator::update_pool`] emits.
async fn forward_events(
    identity: String,
    mut rx: broadcast::Receiver<NetworkEvent>,
    torrents: Arc<DashMap<String, Torrent>>,
    store: Arc<dyn PoolStore>,
    config: CoordinatorConfig,
    bus: broadcast::Sender<NetworkEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%identity, skipped, "Event forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            NetworkEvent::TorrentCreated { torrent, .. } => {
                torrents.insert(torrent.resource_id.clone(), (**torrent).clone());
            }
            NetworkEvent::ChunkDownloaded { bytes, .. } | NetworkEvent::ChunkUploaded { bytes, .. } => {
                if let Err(e) = credit_bandwidth(store.as_ref(), &config, &identity, *bytes).await {
                    warn!(%identity, error = %e, "Failed to credit bandwidth");
                }
            }
            NetworkEvent::ModelUpdated { resource_id, version, .. } => {
                trace!(%identity, %resource_id, version, "Node update folded into pool event");
                continue;
            }
            _ => {}
        }

        if bus.send(event).is_err() {
            trace!(%identity, "No coordinator subscribers");
        }
    }
    debug!(%identity, "Event forwarder stopped");
}

/// Merge the bookkeeping fields every distributed model payload carries.
fn update_payload(model_data: &serde_json::Value, version: u64) -> SwarmResult<Bytes> {
    let mut merged = match model_data {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
    };
    merged.insert("version".to_string(), version.into());
    merged.insert("updatedAt".to_string(), serde_json::to_value(Utc::now())?);
    merged.insert("trainingStatus".to_string(), "active".into());
    for key in ["checkpoints", "trainingHistory", "gradients", "weights"] {
        if merged.get(key).is_none_or(serde_json::Value::is_null) {
            merged.insert(key.to_string(), serde_json::Value::Array(Vec::new()));
        }
    }
    Ok(Bytes::from(serde_json::to_vec(&serde_json::Value::Object(
        merged,
    ))?))
}

/// Treat a missing durable record as a no-op.
fn tolerate_missing(result: StorageResult<()>, what: &str, id: &str) -> SwarmResult<()> {
    match result {
        Err(StorageError::NotFound { .. }) => {
            debug!(id, "No durable {what} to update");
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Coordinates every node in the process.
pub struct NetworkCoordinator {
    config: SwarmConfig,
    store: Arc<dyn PoolStore>,
    models: Arc<dyn ModelRepository>,
    transport: Arc<dyn ChunkTransport>,
    executor: Arc<dyn ComputeExecutor>,
    nodes: DashMap<String, Arc<Node>>,
    torrents: Arc<DashMap<String, Torrent>>,
    pool_locks: DashMap<String, Arc<Mutex<()>>>,
    forwarders: DashMap<String, JoinHandle<()>>,
    events: broadcast::Sender<NetworkEvent>,
}

impl NetworkCoordinator {
    pub fn new(
        config: SwarmConfig,
        store: Arc<dyn PoolStore>,
        models: Arc<dyn ModelRepository>,
        transport: Arc<dyn ChunkTransport>,
        executor: Arc<dyn ComputeExecutor>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.coordinator.event_capacity.max(1));
        Self {
            config,
            store,
            models,
            transport,
            executor,
            nodes: DashMap::new(),
            torrents: Arc::new(DashMap::new()),
            pool_locks: DashMap::new(),
            forwarders: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    fn emit(&self, event: NetworkEvent) {
        if self.events.send(event).is_err() {
            trace!("No coordinator subscribers");
        }
    }

    fn node_snapshot(&self) -> Vec<(String, Arc<Node>)> {
        self.nodes
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    fn pool_lock(&self, pool_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.pool_locks
                .entry(pool_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// The node of `identity`, if one is live.
    #[must_use]
    pub fn node(&self, identity: &str) -> Option<Arc<Node>> {
        self.nodes.get(identity).map(|n| Arc::clone(n.value()))
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The node of `identity`, created and started on first use.
    pub async fn get_or_create_node(&self, identity: &str) -> Arc<Node> {
        if let Some(node) = self.node(identity) {
            return node;
        }

        let node = Arc::new(Node::new(
            identity,
            self.config.node.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.executor),
        ));
        let rx = node.subscribe();
        node.initialize().await;

        let existing = match self.nodes.entry(identity.to_string()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&node));
                None
            }
        };
        if let Some(existing) = existing {
            // Lost a creation race
            node.shutdown().await;
            return existing;
        }

        let forwarder = tokio::spawn(forward_events(
            identity.to_string(),
            rx,
            Arc::clone(&self.torrents),
            Arc::clone(&self.store),
            self.config.coordinator.clone(),
            self.events.clone(),
        ));
        self.forwarders.insert(identity.to_string(), forwarder);
        info!(identity, node_id = %node.node_id(), "Created node");
        node
    }

    /// Seed a new pool's resource from `identity`'s node and persist it.
    pub async fn create_pool(&self, pool: &PoolDescriptor, identity: &str) -> SwarmResult<Torrent> {
        let node = self.get_or_create_node(identity).await;

        let initial = serde_json::json!({
            "name": pool.name,
            "type": pool.model_type,
            "parameters": {},
            "weights": [],
            "version": 1,
            "createdAt": Utc::now(),
        });
        let torrent = node
            .create_resource(&pool.id, Bytes::from(serde_json::to_vec(&initial)?))
            .await?;
        self.torrents.insert(pool.id.clone(), torrent.clone());

        self.store
            .save_torrent(TorrentRecord {
                resource_id: torrent.resource_id.clone(),
                locator: torrent.locator.clone(),
                total_chunks: torrent.total_chunks,
                total_size: torrent.total_size,
                chunk_size: torrent.chunk_size,
                version: torrent.version,
                is_active_training: torrent.is_active_training,
                last_updated_at: torrent.last_updated_at,
            })
            .await?;

        info!(pool_id = %pool.id, identity, locator = %torrent.locator, "Created pool");
        Ok(torrent)
    }

    /// Join `identity`'s node to a pool's resource.
    ///
    /// Returns false if neither the torrent table nor durable storage knows
    /// the pool.
    pub async fn join_pool(&self, pool_id: &str, identity: &str) -> SwarmResult<bool> {
        let node = self.get_or_create_node(identity).await;

        let in_memory = self.torrents.get(pool_id).map(|t| t.locator.clone());
        let locator = match in_memory {
            Some(locator) => Some(locator),
            None => self.store.get_torrent(pool_id).await?.map(|r| r.locator),
        };
        let Some(locator) = locator else {
            debug!(pool_id, identity, "No torrent for pool");
            return Ok(false);
        };

        node.join_resource(&locator).await?;
        info!(pool_id, identity, "Joined pool");
        Ok(true)
    }

    /// Record a contribution and join the pool's resource.
    ///
    /// The participant count and contribution are written in one storage
    /// transaction before the swarm join.
    pub async fn join_pool_with_contribution(
        &self,
        pool_id: &str,
        identity: &str,
        allocation: ResourceCapacity,
    ) -> SwarmResult<ResourceContribution> {
        let participant = match self.store.get_participant_by_identity(identity).await? {
            Some(participant) => participant,
            None => self.store.create_participant(identity).await?,
        };
        let contribution = self
            .store
            .join_pool(&participant.id, pool_id, allocation)
            .await?;

        if !self.join_pool(pool_id, identity).await? {
            warn!(pool_id, identity, "Contribution recorded but pool has no torrent yet");
        }
        Ok(contribution)
    }

    /// Distribute a new model version to every node holding the pool.
    ///
    /// Updates of one pool are serialized. A version not newer than the
    /// latest durable checkpoint fails with [`SwarmError::StaleVersion`]
    /// before any node is touched. Each node gets `fan_out_timeout`; failures
    /// are reported without affecting the others. Durable state only changes
    /// when at least one node applied the update.
    pub async fn update_pool(
        &self,
        pool_id: &str,
        model_data: serde_json::Value,
        version: u64,
    ) -> SwarmResult<FanOutReport> {
        let lock = self.pool_lock(pool_id);
        let _guard = lock.lock().await;

        if !self.torrents.contains_key(pool_id) {
            return Err(SwarmError::PoolNotFound(pool_id.to_string()));
        }
        if let Some(latest) = self.store.get_latest_checkpoint(pool_id).await? {
            if version <= latest.version {
                return Err(SwarmError::StaleVersion {
                    resource_id: pool_id.to_string(),
                    version,
                    current: latest.version,
                });
            }
        }
        let payload = update_payload(&model_data, version)?;

        let mut holders = Vec::new();
        for (identity, node) in self.node_snapshot() {
            if node.has_resource(pool_id).await {
                holders.push((identity, node));
            }
        }

        let limit = self.config.coordinator.fan_out_timeout;
        let mut updates = JoinSet::new();
        for (identity, node) in holders {
            let payload = payload.clone();
            let resource_id = pool_id.to_string();
            updates.spawn(async move {
                let outcome = match tokio::time::timeout(
                    limit,
                    node.update_resource(&resource_id, payload, version),
                )
                .await
                {
                    Ok(Ok(torrent)) => Ok(torrent),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {limit:?}")),
                };
                (identity, outcome)
            });
        }

        let mut report = FanOutReport::default();
        while let Some(joined) = updates.join_next().await {
            match joined {
                Ok((identity, Ok(torrent))) => {
                    self.torrents.insert(pool_id.to_string(), torrent);
                    report.succeeded.push(identity);
                }
                Ok((identity, Err(error))) => {
                    warn!(pool_id, %identity, version, %error, "Node failed to apply update");
                    report.failed.push(FanOutFailure { identity, error });
                }
                Err(e) => warn!(pool_id, error = %e, "Update task aborted"),
            }
        }
        report.succeeded.sort();
        report.failed.sort_by(|a, b| a.identity.cmp(&b.identity));

        if report.succeeded.is_empty() {
            warn!(
                pool_id,
                version,
                failed = report.failed.len(),
                "No node applied the update; durable state unchanged"
            );
            return Ok(report);
        }

        let mut training_nodes: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        training_nodes.sort();
        let training_metrics = model_data
            .get("trainingMetrics")
            .cloned()
            .and_then(|m| serde_json::from_value::<TrainingMetrics>(m).ok());
        let checkpoint = CheckpointRecord {
            pool_id: pool_id.to_string(),
            version,
            model_data: model_data.clone(),
            captured_at: Utc::now(),
            training_nodes,
            training_metrics,
        };
        match self.store.save_checkpoint(checkpoint).await {
            Ok(()) => debug!(pool_id, version, "Training checkpoint saved"),
            Err(e) => warn!(pool_id, version, error = %e, "Failed to save training checkpoint"),
        }

        self.auto_scale(pool_id, ComputeTier::from_model_data(&model_data))
            .await?;

        let progress = u8::try_from(version.saturating_mul(5).min(100)).unwrap_or(100);
        let pool_update = self
            .store
            .update_pool(
                pool_id,
                PoolUpdate {
                    training_progress: Some(progress),
                    status: Some(PoolStatus::Training),
                    ..PoolUpdate::default()
                },
            )
            .await
            .map(|_| ());
        tolerate_missing(pool_update, "pool", pool_id)?;

        let now = Utc::now();
        let mut current_version = version;
        if let Some(mut torrent) = self.torrents.get_mut(pool_id) {
            torrent.version = torrent.version.max(version);
            torrent.last_updated_at = now;
            torrent.is_active_training = true;
            current_version = torrent.version;
        }
        let torrent_update = self
            .store
            .update_torrent(
                pool_id,
                TorrentUpdate {
                    version: Some(current_version),
                    is_active_training: Some(true),
                    last_updated_at: Some(now),
                },
            )
            .await;
        tolerate_missing(torrent_update, "torrent", pool_id)?;

        info!(
            pool_id,
            version,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Pool updated"
        );
        self.emit(NetworkEvent::ModelUpdated {
            resource_id: pool_id.to_string(),
            version,
            node_id: None,
            active_nodes: Some(self.nodes.len()),
        });
        Ok(report)
    }

    /// Create a training pool seeded from a staged open-source model.
    pub async fn create_pool_from_existing_model(
        &self,
        source_model_id: &str,
        identity: &str,
        training_config: serde_json::Value,
    ) -> SwarmResult<(PoolRecord, Torrent)> {
        if !self.models.is_staged(source_model_id).await {
            return Err(SwarmError::ModelNotStaged(source_model_id.to_string()));
        }
        let metadata = self
            .models
            .get_metadata(source_model_id)
            .await
            .ok_or_else(|| SwarmError::ModelNotFound(source_model_id.to_string()))?;
        let model_path = self
            .models
            .local_path(source_model_id)
            .await
            .ok_or_else(|| SwarmError::ModelPathUnavailable(source_model_id.to_string()))?;
        info!(source_model_id, path = %model_path.display(), "Creating pool from staged model");

        let pool_id = format!("{source_model_id}-training-{}", Utc::now().timestamp_millis());
        let reward_per_hour = match training_config.get("rewardPerHour") {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .unwrap_or(self.config.coordinator.default_reward_per_hour);

        let mut record = PoolRecord::new(
            &pool_id,
            format!("{} Training Pool", metadata.name),
            &metadata.model_type,
        );
        record.description = format!("P2P training pool for {}", metadata.name);
        record.min_cpu_cores = metadata.requirements.min_cpu_cores;
        record.min_gpu_memory = metadata.requirements.min_gpu_memory;
        record.min_ram_gb = metadata.requirements.min_ram_gb;
        record.reward_per_hour = reward_per_hour;
        record.source_model_id = Some(source_model_id.to_string());
        record.training_config = Some(training_config.clone());
        let record = self.store.create_pool(record).await?;

        let source = load_source_model(&model_path, &metadata).await?;
        let torrent = self
            .create_pool(
                &PoolDescriptor {
                    id: pool_id.clone(),
                    name: record.name.clone(),
                    model_type: record.model_type.clone(),
                },
                identity,
            )
            .await?;

        let seed = serde_json::json!({
            "sourceModel": serde_json::to_value(&metadata)?,
            "initialWeights": source.weights,
            "architecture": source.architecture,
            "tokenizer": source.tokenizer,
            "trainingConfig": training_config,
            "version": 1,
        });
        self.update_pool(&pool_id, seed, 1).await?;

        let record = self.store.get_pool(&pool_id).await?.unwrap_or(record);
        let torrent = self.torrent_info(&pool_id).unwrap_or(torrent);
        Ok((record, torrent))
    }

    /// Bring one resource on `node` up to `target` and report it.
    async fn resync(&self, node: &Node, identity: &str, resource_id: &str, target: u64) -> SyncOutcome {
        let from_version = node.model_version(resource_id);
        let synced_to = node.sync_to_version(resource_id, target).await;
        self.emit(NetworkEvent::NodeResynced {
            participant: identity.to_string(),
            resource_id: resource_id.to_string(),
            from_version,
            to_version: synced_to,
        });
        SyncOutcome {
            resource_id: resource_id.to_string(),
            from_version,
            target_version: target,
            synced_to,
        }
    }

    /// Resync every resource `identity`'s node holds to its latest durable
    /// checkpoint. Returns the version reached per resource.
    pub async fn sync_offline_node(&self, identity: &str) -> SwarmResult<HashMap<String, u64>> {
        let node = self.get_or_create_node(identity).await;
        let resource_ids: Vec<String> = self.torrents.iter().map(|e| e.key().clone()).collect();

        let mut results = HashMap::new();
        for resource_id in resource_ids {
            if !node.has_resource(&resource_id).await {
                continue;
            }
            let Some(latest) = self.store.get_latest_checkpoint(&resource_id).await? else {
                continue;
            };
            let outcome = self.resync(&node, identity, &resource_id, latest.version).await;
            results.insert(resource_id, outcome.synced_to);
        }
        Ok(results)
    }

    /// Resync a returning participant on every pool it actively contributes to.
    pub async fn handle_reconnection(&self, identity: &str) -> SwarmResult<Vec<SyncOutcome>> {
        let participant = self
            .store
            .get_participant_by_identity(identity)
            .await?
            .ok_or_else(|| SwarmError::ParticipantNotFound(identity.to_string()))?;
        info!(identity, "Participant reconnecting");

        let node = self.get_or_create_node(identity).await;
        let contributions = self.store.get_active_contributions(&participant.id).await?;

        let mut outcomes = Vec::new();
        for contribution in contributions {
            let pool_id = contribution.pool_id;
            let Some(latest) = self.store.get_latest_checkpoint(&pool_id).await? else {
                debug!(%pool_id, "No durable checkpoint yet");
                continue;
            };
            if !node.has_resource(&pool_id).await && !self.join_pool(&pool_id, identity).await? {
                warn!(%pool_id, identity, "Cannot rejoin pool without a torrent");
                continue;
            }

            let outcome = self.resync(&node, identity, &pool_id, latest.version).await;
            node.update_training_progress(&pool_id, outcome.synced_to)
                .await;
            self.emit(NetworkEvent::NodeSynced {
                participant: identity.to_string(),
                pool_id: pool_id.clone(),
                new_version: outcome.synced_to,
                synced_at: Utc::now(),
            });
            if !outcome.converged() {
                warn!(%pool_id, identity, target = outcome.target_version, reached = outcome.synced_to, "Resync stopped at a gap");
            }
            outcomes.push(outcome);
        }

        info!(identity, pools = outcomes.len(), "Participant sync completed");
        Ok(outcomes)
    }

    /// Raise a pool's reward when it is below its tier's participant floor.
    ///
    /// Never lowers the reward.
    pub async fn auto_scale(
        &self,
        pool_id: &str,
        tier: ComputeTier,
    ) -> SwarmResult<Option<ScalingDecision>> {
        let Some(pool) = self.store.get_pool(pool_id).await? else {
            return Ok(None);
        };

        let current = pool.participant_count;
        let target = tier.min_nodes().max(current);
        if current >= target {
            return Ok(None);
        }

        let reward_boost = tier.reward_multiplier();
        let reward_per_hour = (pool.reward_per_hour * reward_boost).max(pool.reward_per_hour);
        self.store
            .update_pool(
                pool_id,
                PoolUpdate {
                    reward_per_hour: Some(reward_per_hour),
                    ..PoolUpdate::default()
                },
            )
            .await?;

        info!(pool_id, ?tier, from = current, to = target, reward_per_hour, "Boosting pool reward");
        self.emit(NetworkEvent::PoolScaling {
            pool_id: pool_id.to_string(),
            from: current,
            to: target,
            reward_boost,
        });
        Ok(Some(ScalingDecision {
            pool_id: pool_id.to_string(),
            from: current,
            to: target,
            reward_boost,
            reward_per_hour,
        }))
    }

    /// Allocation `identity` actively committed to `pool_id`.
    async fn committed_capacity(
        &self,
        identity: &str,
        pool_id: &str,
    ) -> SwarmResult<Option<ResourceCapacity>> {
        let Some(participant) = self.store.get_participant_by_identity(identity).await? else {
            return Ok(None);
        };
        let active = self.store.get_active_contributions(&participant.id).await?;
        Ok(active
            .iter()
            .find(|c| c.pool_id == pool_id)
            .map(ResourceContribution::allocation))
    }

    /// Run `batch` on every node whose committed resources meet its needs.
    ///
    /// Returns the identities used; empty if the pool has no torrent.
    pub async fn allocate_resources_for_training(
        &self,
        pool_id: &str,
        batch: TrainingBatch,
    ) -> SwarmResult<Vec<String>> {
        if !self.torrents.contains_key(pool_id) {
            return Ok(Vec::new());
        }
        let requirement = ResourceRequirement::for_batch(&batch);

        let mut qualified = Vec::new();
        for (identity, node) in self.node_snapshot() {
            match self.committed_capacity(&identity, pool_id).await? {
                Some(capacity) if capacity.satisfies(&requirement) => qualified.push((identity, node)),
                _ => trace!(%identity, pool_id, "Node does not qualify for batch"),
            }
        }
        info!(pool_id, batch_id = %batch.id, nodes = qualified.len(), ?requirement, "Allocating training batch");

        let mut tasks = JoinSet::new();
        let mut used = Vec::with_capacity(qualified.len());
        for (identity, node) in qualified {
            let task = TrainingTask::new(pool_id, batch.clone());
            let resource_id = pool_id.to_string();
            used.push(identity);
            tasks.spawn(async move { node.allocate_training_task(&resource_id, task).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(pool_id, error = %e, "Training task aborted");
            }
        }

        used.sort();
        Ok(used)
    }

    async fn control_training(&self, pool_id: &str, control: TaskControl) -> usize {
        let mut signalled = 0;
        for (_, node) in self.node_snapshot() {
            if node.control_training(pool_id, control).await {
                signalled += 1;
            }
        }
        info!(pool_id, ?control, signalled, "Training control fanned out");
        signalled
    }

    /// Pause every running task of the pool. Returns how many nodes were signalled.
    pub async fn pause_training(&self, pool_id: &str) -> usize {
        self.control_training(pool_id, TaskControl::Pause).await
    }

    pub async fn resume_training(&self, pool_id: &str) -> usize {
        self.control_training(pool_id, TaskControl::Run).await
    }

    pub async fn stop_training(&self, pool_id: &str) -> usize {
        self.control_training(pool_id, TaskControl::Stop).await
    }

    /// Ask every node whether it can take on `requirement`. Returns the
    /// identities that can.
    pub async fn reallocate_resources(
        &self,
        pool_id: &str,
        requirement: ResourceRequirement,
    ) -> Vec<String> {
        let mut accepted = Vec::new();
        for (identity, node) in self.node_snapshot() {
            if node.reallocate_resources(pool_id, requirement).await {
                accepted.push(identity);
            }
        }
        accepted.sort();
        accepted
    }

    pub async fn network_stats(&self) -> NetworkStats {
        let mut total_peers = 0;
        let mut total_chunks = 0;
        let mut health_sum = 0usize;

        let nodes = self.node_snapshot();
        for (_, node) in &nodes {
            let stats = node.stats().await;
            total_peers += stats.connected_peers;
            total_chunks += stats.total_chunks;
            health_sum += (stats.connected_peers * 10 + stats.total_chunks * 5).min(100);
        }

        let network_health = if nodes.is_empty() {
            0
        } else {
            let mean = health_sum as f64 / nodes.len() as f64;
            u8::try_from(mean.round() as u64).unwrap_or(100)
        };

        NetworkStats {
            total_nodes: nodes.len(),
            total_torrents: self.torrents.len(),
            total_peers,
            total_chunks,
            network_health,
        }
    }

    /// Download percentage per known resource for `identity`'s node.
    pub async fn participant_progress(&self, identity: &str) -> HashMap<String, f64> {
        let Some(node) = self.node(identity) else {
            return HashMap::new();
        };
        let resource_ids: Vec<String> = self.torrents.iter().map(|e| e.key().clone()).collect();

        let mut progress = HashMap::with_capacity(resource_ids.len());
        for resource_id in resource_ids {
            let percent = node.download_progress(&resource_id).await;
            progress.insert(resource_id, percent);
        }
        progress
    }

    #[must_use]
    pub fn torrent_info(&self, resource_id: &str) -> Option<Torrent> {
        self.torrents.get(resource_id).map(|t| t.value().clone())
    }

    async fn evict(&self, identity: &str) -> bool {
        let Some((_, node)) = self.nodes.remove(identity) else {
            return false;
        };
        if let Some((_, forwarder)) = self.forwarders.remove(identity) {
            forwarder.abort();
        }
        node.shutdown().await;
        true
    }

    /// Evict nodes idle for longer than `max_idle`. Durable state is untouched.
    pub async fn cleanup_idle_nodes(&self, max_idle: Duration) -> usize {
        let mut evicted = 0;
        for (identity, node) in self.node_snapshot() {
            if node.is_idle(max_idle).await && self.evict(&identity).await {
                info!(%identity, "Evicted idle node");
                evicted += 1;
            }
        }
        evicted
    }

    /// Shut every node down.
    pub async fn shutdown(&self) {
        let identities: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        for identity in identities {
            self.evict(&identity).await;
        }
        info!("Coordinator shut down");
    }

    /// When the coordinator last saw `identity`'s node active.
    pub async fn last_active_at(&self, identity: &str) -> Option<DateTime<Utc>> {
        match self.node(identity) {
            Some(node) => Some(node.last_active_at().await),
            None => None,
        }
    }
}
