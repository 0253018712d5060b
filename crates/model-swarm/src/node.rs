//! Participant node.
//!
//! A [`Node`] is one participant's agent in the swarm. It owns the local
//! chunk store, the peer directory and the torrent catalog, serves upload
//! requests through its transport, drives chunk and checkpoint downloads and
//! runs allocated training tasks.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────── Node ───────────────────────────┐
//!                 │                                                             │
//!   create/join ─▶│  NodeShared ──────────────┐        background tasks         │
//!   update/train  │   ├─ ChunkStore (dashmap) │        ├─ discovery loop (30s)  │
//!   sync/stats    │   ├─ RwLock<NodeState>    │        └─ upload loop    (1s)   │
//!                 │   │   ├─ PeerDirectory    │                                 │
//!                 │   │   ├─ TorrentCatalog   ├──▶ ChunkHandler ◀── transport   │
//!                 │   │   ├─ upload queue     │    (serve / receive)            │
//!                 │   │   └─ training tasks   │                                 │
//!                 │   └─ broadcast<NetworkEvent> ──▶ subscribers / coordinator  │
//!                 └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The state lock is never held across a transport call. Transports call
//! back into the serving half ([`ChunkHandler`]) of *other* nodes, which take
//! their own locks.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::checkpoint::{self, Checkpoint, TrainingMetrics};
use crate::chunk::{Chunk, ChunkKind};
use crate::config::NodeConfig;
use crate::error::{SwarmError, SwarmResult, TransportError};
use crate::events::NetworkEvent;
use crate::peers::{PeerDirectory, PeerInfo};
use crate::torrent::{Torrent, TorrentCatalog};
use crate::training::{
    ComputeExecutor, ResourceCapacity, ResourceRequirement, TaskControl, TaskState, TrainingTask,
};
use crate::transport::{ChunkHandler, ChunkStore, ChunkTransport};

/// A chunk waiting to be pushed to a peer.
#[derive(Debug, Clone)]
struct PendingUpload {
    to_peer: String,
    chunk: Chunk,
}

/// Bookkeeping for the training task of one resource.
#[derive(Debug)]
struct ActiveTask {
    task_id: Uuid,
    state: TaskState,
    control: watch::Sender<TaskControl>,
}

/// Mutable node state, guarded by one lock.
#[derive(Debug)]
struct NodeState {
    peers: PeerDirectory,
    torrents: TorrentCatalog,
    upload_queue: VecDeque<PendingUpload>,
    /// Latest training task per resource
    tasks: HashMap<String, ActiveTask>,
    bytes_uploaded: u64,
    bytes_downloaded: u64,
    last_active_at: DateTime<Utc>,
}

impl NodeState {
    /// Bytes served over bytes consumed, smoothed so a fresh node reads 1.0.
    fn upload_ratio(&self) -> f64 {
        (self.bytes_uploaded as f64 + 1.0) / (self.bytes_downloaded as f64 + 1.0)
    }
}

/// Node-level statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: String,
    pub participant: String,
    pub connected_peers: usize,
    pub active_resources: usize,
    pub total_chunks: usize,
    pub pending_uploads: usize,
    pub last_active_at: DateTime<Utc>,
    pub capacity: ResourceCapacity,
    /// Latest local checkpoint version per resource
    pub versions: HashMap<String, u64>,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub upload_ratio: f64,
}

/// The part of a node shared with its transport and background tasks.
struct NodeShared {
    node_id: String,
    participant: String,
    config: NodeConfig,
    store: ChunkStore,
    state: RwLock<NodeState>,
    events: broadcast::Sender<NetworkEvent>,
}

impl NodeShared {
    fn emit(&self, event: NetworkEvent) {
        if self.events.send(event).is_err() {
            trace!(node_id = %self.node_id, "No event subscribers");
        }
    }

    /// This node as a peer, advertising everything in the store.
    fn local_peer(&self, state: &NodeState) -> PeerInfo {
        let mut peer = PeerInfo::new(&self.node_id, &self.participant)
            .with_upload_ratio(state.upload_ratio());
        peer.available_chunk_ids = self.store.ids();
        peer
    }

    /// Highest checkpoint version held for `resource_id`.
    fn version_of(&self, resource_id: &str) -> u64 {
        checkpoint::latest_version(resource_id, &self.store.ids_for(resource_id))
    }

    /// Re-advertise held chunks in every torrent. Returns resources where
    /// this node was just promoted to seeder.
    fn refresh_availability(&self, state: &mut NodeState) -> Vec<String> {
        let mut promoted = Vec::new();
        for torrent in state.torrents.iter_mut() {
            let held = self.store.ids_for(&torrent.resource_id);
            if torrent.refresh_local(&self.node_id, &held) {
                promoted.push(torrent.resource_id.clone());
            }
        }
        for resource_id in &promoted {
            info!(node_id = %self.node_id, %resource_id, "Promoted to seeder");
        }
        promoted
    }

    /// Remove data chunks of `resource_id` at or beyond `total_chunks`.
    fn drop_stale_data(&self, resource_id: &str, total_chunks: u32) {
        self.store.retain(|c| {
            c.resource_id != resource_id
                || !matches!(c.kind, ChunkKind::Data(index) if index >= total_chunks)
        });
    }

    /// Run one discovery round, restricted to `only` if given.
    async fn discover(&self, transport: &dyn ChunkTransport, only: Option<&str>) -> usize {
        let resource_ids = match only {
            Some(resource_id) => vec![resource_id.to_string()],
            None => self.state.read().await.torrents.resource_ids(),
        };

        let found = transport.discover(&resource_ids, &self.node_id).await;

        let mut state = self.state.write().await;
        for torrent in state.torrents.iter_mut() {
            let resource_id = torrent.resource_id.clone();
            for peer in found.iter().filter(|p| p.participates_in(&resource_id)) {
                torrent.upsert_member(peer.clone());
            }
        }
        let added = state.peers.merge(found, self.config.max_connections);
        let pruned = state.peers.prune_stale(self.config.peer_stale_after);
        debug!(
            node_id = %self.node_id,
            added,
            pruned,
            known = state.peers.len(),
            "Peer discovery round complete"
        );
        added
    }

    /// Push one queued chunk. Returns false if the queue was empty.
    async fn drain_one(&self, transport: &dyn ChunkTransport) -> bool {
        let next = self.state.write().await.upload_queue.pop_front();
        let Some(upload) = next else {
            return false;
        };

        let bytes = upload.chunk.size as u64;
        let chunk_id = upload.chunk.id.clone();
        match transport
            .push(&upload.to_peer, &self.node_id, upload.chunk)
            .await
        {
            Ok(()) => {
                {
                    let mut state = self.state.write().await;
                    state.bytes_uploaded += bytes;
                    state.last_active_at = Utc::now();
                }
                self.emit(NetworkEvent::ChunkUploaded {
                    node_id: self.node_id.clone(),
                    participant: self.participant.clone(),
                    chunk_id,
                    to_peer: upload.to_peer,
                    bytes,
                });
            }
            Err(e) => {
                warn!(node_id = %self.node_id, to = %upload.to_peer, %chunk_id, error = %e, "Upload failed");
            }
        }
        true
    }
}

#[async_trait]
impl ChunkHandler for NodeShared {
    async fn advertisement(&self) -> PeerInfo {
        let state = self.state.read().await;
        self.local_peer(&state)
    }

    async fn serve_chunk(&self, requester: &str, chunk_id: &str) -> Option<Chunk> {
        let chunk = self.store.get(chunk_id)?;
        let bytes = chunk.size as u64;
        {
            let mut state = self.state.write().await;
            state.bytes_uploaded += bytes;
            state.last_active_at = Utc::now();
        }
        self.emit(NetworkEvent::ChunkUploaded {
            node_id: self.node_id.clone(),
            participant: self.participant.clone(),
            chunk_id: chunk_id.to_string(),
            to_peer: requester.to_string(),
            bytes,
        });
        Some(chunk)
    }

    async fn receive_chunk(&self, from: &str, chunk: Chunk) {
        if !chunk.verify() {
            warn!(node_id = %self.node_id, from, chunk_id = %chunk.id, "Rejecting pushed chunk with bad hash");
            return;
        }

        let bytes = chunk.size as u64;
        let resource_id = chunk.resource_id.clone();
        let chunk_id = chunk.id.clone();
        {
            let mut state = self.state.write().await;
            if !state.torrents.contains(&resource_id) {
                debug!(node_id = %self.node_id, from, %chunk_id, "Ignoring chunk for unknown resource");
                return;
            }
            self.store.insert(chunk);
            state.bytes_downloaded += bytes;
            state.last_active_at = Utc::now();
            self.refresh_availability(&mut state);
        }

        self.emit(NetworkEvent::ChunkDownloaded {
            node_id: self.node_id.clone(),
            participant: self.participant.clone(),
            resource_id,
            chunk_id,
            from_peer: from.to_string(),
            bytes,
        });
    }

    async fn receive_update(&self, from: &str, resource_id: &str, version: u64) {
        let current = self.version_of(resource_id);
        if version > current {
            info!(node_id = %self.node_id, from, resource_id, version, current, "Peer announced a newer version");
        } else {
            trace!(node_id = %self.node_id, from, resource_id, version, "Ignoring stale announcement");
        }
    }
}

async fn discovery_loop(
    shared: Arc<NodeShared>,
    transport: Arc<dyn ChunkTransport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = shared.config.discovery_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.discover(transport.as_ref(), None).await;
            }
            _ = shutdown.changed() => {
                debug!(node_id = %shared.node_id, "Discovery loop stopping");
                break;
            }
        }
    }
}

async fn upload_loop(
    shared: Arc<NodeShared>,
    transport: Arc<dyn ChunkTransport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = shared.config.upload_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.drain_one(transport.as_ref()).await;
            }
            _ = shutdown.changed() => {
                debug!(node_id = %shared.node_id, "Upload loop stopping");
                break;
            }
        }
    }
}

/// One participant's agent.
pub struct Node {
    shared: Arc<NodeShared>,
    transport: Arc<dyn ChunkTransport>,
    executor: Arc<dyn ComputeExecutor>,
    shutdown_tx: watch::Sender<bool>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node for `participant`. Call [`Node::initialize`] to go live.
    pub fn new(
        participant: impl Into<String>,
        config: NodeConfig,
        transport: Arc<dyn ChunkTransport>,
        executor: Arc<dyn ComputeExecutor>,
    ) -> Self {
        let participant = participant.into();
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let node_id = hex::encode(Sha256::digest(format!("{participant}{nanos}").as_bytes()));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let state = NodeState {
            peers: PeerDirectory::new(),
            torrents: TorrentCatalog::new(config.chunk_size, config.tracker.clone()),
            upload_queue: VecDeque::new(),
            tasks: HashMap::new(),
            bytes_uploaded: 0,
            bytes_downloaded: 0,
            last_active_at: Utc::now(),
        };

        Self {
            shared: Arc::new(NodeShared {
                node_id,
                participant,
                config,
                store: ChunkStore::new(),
                state: RwLock::new(state),
                events,
            }),
            transport,
            executor,
            shutdown_tx,
            background: StdMutex::new(Vec::new()),
        }
    }

    /// Register with the transport and start the discovery and upload loops.
    ///
    /// Calling it again on a running node does nothing.
    pub async fn initialize(&self) {
        if self.background.lock().map(|h| !h.is_empty()).unwrap_or(true) {
            return;
        }

        let handler: Arc<dyn ChunkHandler> = self.shared.clone();
        self.transport.register(&self.shared.node_id, handler).await;

        let discovery = tokio::spawn(discovery_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.transport),
            self.shutdown_tx.subscribe(),
        ));
        let uploads = tokio::spawn(upload_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.transport),
            self.shutdown_tx.subscribe(),
        ));

        if let Ok(mut handles) = self.background.lock() {
            handles.push(discovery);
            handles.push(uploads);
        }
        info!(
            node_id = %self.shared.node_id,
            participant = %self.shared.participant,
            "Node initialized"
        );
    }

    /// Stop background loops, cancel training and leave the transport.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_err() {
            trace!(node_id = %self.shared.node_id, "Background loops already stopped");
        }

        {
            let state = self.shared.state.read().await;
            for task in state.tasks.values().filter(|t| !t.state.is_terminal()) {
                if task.control.send(TaskControl::Stop).is_err() {
                    trace!(node_id = %self.shared.node_id, task_id = %task.task_id, "Task already finished");
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .map(|mut h| h.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(node_id = %self.shared.node_id, error = %e, "Background task failed");
                }
            }
        }

        self.transport.unregister(&self.shared.node_id).await;
        info!(node_id = %self.shared.node_id, "Node shut down");
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    #[must_use]
    pub fn participant(&self) -> &str {
        &self.shared.participant
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.shared.events.subscribe()
    }

    async fn touch(&self) {
        self.shared.state.write().await.last_active_at = Utc::now();
    }

    /// Chunk `payload` and seed it as a new resource.
    pub async fn create_resource(&self, resource_id: &str, payload: Bytes) -> SwarmResult<Torrent> {
        let torrent = {
            let mut state = self.shared.state.write().await;
            let local = self.shared.local_peer(&state);
            let (created, chunks) = state.torrents.create_torrent(resource_id, &payload, local)?;
            self.shared.drop_stale_data(resource_id, created.total_chunks);
            for chunk in chunks {
                self.shared.store.insert(chunk);
            }
            self.shared.refresh_availability(&mut state);
            state.last_active_at = Utc::now();
            state.torrents.get(resource_id).cloned().unwrap_or(created)
        };

        info!(
            node_id = %self.shared.node_id,
            resource_id,
            total_chunks = torrent.total_chunks,
            total_size = torrent.total_size,
            "Created resource"
        );
        self.shared.emit(NetworkEvent::TorrentCreated {
            node_id: self.shared.node_id.clone(),
            participant: self.shared.participant.clone(),
            torrent: Box::new(torrent.clone()),
        });
        Ok(torrent)
    }

    /// Join a resource by locator and download what peers offer.
    pub async fn join_resource(&self, locator: &str) -> SwarmResult<Torrent> {
        let joined = {
            let mut state = self.shared.state.write().await;
            let local = self.shared.local_peer(&state);
            let joined = state.torrents.join_torrent(locator, local)?;
            self.shared.refresh_availability(&mut state);
            state.last_active_at = Utc::now();
            joined
        };
        let resource_id = joined.resource_id.clone();

        info!(node_id = %self.shared.node_id, resource_id, "Joined resource");
        self.shared.emit(NetworkEvent::TorrentJoined {
            node_id: self.shared.node_id.clone(),
            participant: self.shared.participant.clone(),
            resource_id: resource_id.clone(),
            locator: locator.to_string(),
        });

        self.shared
            .discover(self.transport.as_ref(), Some(&resource_id))
            .await;
        self.download_missing(&resource_id).await;

        Ok(self.torrent(&resource_id).await.unwrap_or(joined))
    }

    /// Fetch every missing data chunk from its best advertiser.
    ///
    /// Chunks nobody advertises are skipped. Returns how many were fetched.
    pub async fn download_missing(&self, resource_id: &str) -> usize {
        let Some(total_chunks) = self.torrent(resource_id).await.map(|t| t.total_chunks) else {
            return 0;
        };

        let mut fetched = 0;
        for index in 0..total_chunks {
            let chunk_id = ChunkKind::Data(index).chunk_id(resource_id);
            if self.shared.store.contains(&chunk_id) {
                continue;
            }

            let best = self
                .shared
                .state
                .read()
                .await
                .peers
                .peers_with_chunk(resource_id, &chunk_id)
                .into_iter()
                .next();
            let Some(peer) = best else {
                trace!(node_id = %self.shared.node_id, %chunk_id, "No peer advertises chunk");
                continue;
            };

            match self.request_chunk(&peer, &chunk_id).await {
                Ok(_) => fetched += 1,
                Err(e) => debug!(node_id = %self.shared.node_id, %chunk_id, error = %e, "Chunk download failed"),
            }
        }
        fetched
    }

    /// Fetch `chunk_id` from `peer` with timeout, retries and hash verification.
    pub async fn request_chunk(&self, peer: &PeerInfo, chunk_id: &str) -> SwarmResult<Chunk> {
        let resource_id = self
            .shared
            .state
            .read()
            .await
            .torrents
            .resource_ids()
            .into_iter()
            .find(|r| ChunkKind::parse(r, chunk_id).is_some())
            .ok_or_else(|| SwarmError::UnknownResource(chunk_id.to_string()))?;

        let config = &self.shared.config;
        let attempts = config.max_fetch_attempts.max(1);
        let mut last_error = TransportError::PeerUnreachable(peer.peer_id.clone());

        for attempt in 1..=attempts {
            let fetch = self
                .transport
                .fetch(&peer.peer_id, &self.shared.node_id, chunk_id);
            match tokio::time::timeout(config.request_timeout, fetch).await {
                Ok(Ok(chunk)) if chunk.id == chunk_id && chunk.verify() => {
                    return Ok(self.accept_download(&peer.peer_id, &resource_id, chunk).await);
                }
                Ok(Ok(_)) => {
                    warn!(node_id = %self.shared.node_id, peer = %peer.peer_id, chunk_id, "Received chunk failed verification");
                    last_error = TransportError::TransferFailed(format!("hash mismatch for {chunk_id}"));
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = TransportError::Timeout(config.request_timeout),
            }

            if attempt < attempts {
                let backoff = config.backoff_for(attempt);
                debug!(node_id = %self.shared.node_id, chunk_id, attempt, ?backoff, error = %last_error, "Retrying chunk request");
                tokio::time::sleep(backoff).await;
            }
        }

        warn!(node_id = %self.shared.node_id, peer = %peer.peer_id, chunk_id, attempts, error = %last_error, "Chunk unavailable");
        self.shared.emit(NetworkEvent::ChunkUnavailable {
            node_id: self.shared.node_id.clone(),
            resource_id,
            chunk_id: chunk_id.to_string(),
            attempts,
            reason: last_error.to_string(),
        });
        Err(SwarmError::ChunkUnavailable {
            chunk_id: chunk_id.to_string(),
            attempts,
            source: last_error,
        })
    }

    async fn accept_download(&self, from_peer: &str, resource_id: &str, chunk: Chunk) -> Chunk {
        let bytes = chunk.size as u64;
        self.shared.store.insert(chunk.clone());
        {
            let mut state = self.shared.state.write().await;
            state.bytes_downloaded += bytes;
            state.last_active_at = Utc::now();
            self.shared.refresh_availability(&mut state);
        }

        self.shared.emit(NetworkEvent::ChunkDownloaded {
            node_id: self.shared.node_id.clone(),
            participant: self.shared.participant.clone(),
            resource_id: resource_id.to_string(),
            chunk_id: chunk.id.clone(),
            from_peer: from_peer.to_string(),
            bytes,
        });
        if let ChunkKind::Checkpoint(version) = chunk.kind {
            self.shared.emit(NetworkEvent::CheckpointDownloaded {
                node_id: self.shared.node_id.clone(),
                resource_id: resource_id.to_string(),
                version,
                from_peer: from_peer.to_string(),
            });
        }
        chunk
    }

    /// Republish `resource_id` with a new payload at `version`.
    ///
    /// The version must be newer than the local one. Known peers are told
    /// about the update in the background.
    pub async fn update_resource(
        &self,
        resource_id: &str,
        payload: Bytes,
        version: u64,
    ) -> SwarmResult<Torrent> {
        let state_json: serde_json::Value = serde_json::from_slice(&payload)
            .unwrap_or_else(|_| serde_json::json!({ "size": payload.len() }));
        let metrics: TrainingMetrics = state_json
            .get("trainingMetrics")
            .cloned()
            .and_then(|m| serde_json::from_value(m).ok())
            .unwrap_or_default();
        let checkpoint_chunk = Checkpoint::new(resource_id, version, state_json, metrics).to_chunk()?;

        let (torrent, recipients) = {
            let mut state = self.shared.state.write().await;
            if !state.torrents.contains(resource_id) {
                return Err(SwarmError::UnknownResource(resource_id.to_string()));
            }
            let current = self.shared.version_of(resource_id);
            if version <= current {
                return Err(SwarmError::StaleVersion {
                    resource_id: resource_id.to_string(),
                    version,
                    current,
                });
            }

            let local = self.shared.local_peer(&state);
            let (created, chunks) = state.torrents.create_torrent(resource_id, &payload, local)?;
            self.shared.drop_stale_data(resource_id, created.total_chunks);
            for chunk in chunks {
                self.shared.store.insert(chunk);
            }
            self.shared.store.insert(checkpoint_chunk);

            let mut recipients: HashSet<String> = state
                .peers
                .peers_for_resource(resource_id)
                .into_iter()
                .map(|p| p.peer_id)
                .collect();
            if let Some(entry) = state.torrents.get_mut(resource_id) {
                entry.version = version;
                entry.last_updated_at = Utc::now();
                recipients.extend(entry.members().map(|p| p.peer_id.clone()));
            }
            recipients.remove(&self.shared.node_id);

            self.shared.refresh_availability(&mut state);
            state.last_active_at = Utc::now();
            let torrent = state.torrents.get(resource_id).cloned().unwrap_or(created);
            (torrent, recipients)
        };

        if !recipients.is_empty() {
            let transport = Arc::clone(&self.transport);
            let from = self.shared.node_id.clone();
            let resource = resource_id.to_string();
            tokio::spawn(async move {
                for peer_id in recipients {
                    if let Err(e) = transport
                        .announce_update(&peer_id, &from, &resource, version)
                        .await
                    {
                        debug!(to = %peer_id, resource_id = %resource, error = %e, "Update announcement failed");
                    }
                }
            });
        }

        info!(node_id = %self.shared.node_id, resource_id, version, total_chunks = torrent.total_chunks, "Updated resource");
        self.shared.emit(NetworkEvent::ModelUpdated {
            resource_id: resource_id.to_string(),
            version,
            node_id: Some(self.shared.node_id.clone()),
            active_nodes: None,
        });
        Ok(torrent)
    }

    /// Run a training task to completion and distribute its result.
    ///
    /// Never fails to the caller; the outcome is reported through events and
    /// the returned terminal state.
    pub async fn allocate_training_task(&self, resource_id: &str, task: TrainingTask) -> TaskState {
        let task_id = task.task_id;
        let (control_tx, control_rx) = watch::channel(TaskControl::Run);
        {
            let mut state = self.shared.state.write().await;
            if let Some(previous) = state.tasks.get(resource_id) {
                if !previous.state.is_terminal() {
                    warn!(node_id = %self.shared.node_id, resource_id, "Replacing an unfinished training task");
                    if previous.control.send(TaskControl::Stop).is_err() {
                        trace!(node_id = %self.shared.node_id, task_id = %previous.task_id, "Replaced task already finished");
                    }
                }
            }
            state.tasks.insert(
                resource_id.to_string(),
                ActiveTask {
                    task_id,
                    state: TaskState::Allocated,
                    control: control_tx,
                },
            );
            state.last_active_at = Utc::now();
        }

        info!(
            node_id = %self.shared.node_id,
            resource_id,
            %task_id,
            cpu_cores = task.requirement.cpu_cores,
            gpu_memory_mb = task.requirement.gpu_memory_mb,
            ram_gb = task.requirement.ram_gb,
            "Training task allocated"
        );
        self.shared.emit(NetworkEvent::TrainingStarted {
            node_id: self.shared.node_id.clone(),
            resource_id: resource_id.to_string(),
            task_id,
            batch_id: task.batch.id.clone(),
        });
        self.set_task_state(resource_id, task_id, TaskState::Running { progress: 0 })
            .await;

        let base_version = self.shared.version_of(resource_id);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let execution = self
            .executor
            .execute(&task, base_version, progress_tx, control_rx);
        let forward = async {
            while let Some(tick) = progress_rx.recv().await {
                self.set_task_state(
                    resource_id,
                    task_id,
                    TaskState::Running {
                        progress: tick.progress,
                    },
                )
                .await;
                self.shared.emit(NetworkEvent::TrainingProgress {
                    node_id: self.shared.node_id.clone(),
                    resource_id: resource_id.to_string(),
                    task_id,
                    progress: tick.progress,
                    usage: tick.usage,
                });
            }
        };
        let (outcome, ()) = tokio::join!(execution, forward);

        let final_state = match outcome {
            Ok(result) => {
                match self.distribute_result(resource_id, &result).await {
                    Ok(Some((result_chunk_id, recipients))) => {
                        self.shared.emit(NetworkEvent::ResultDistributed {
                            node_id: self.shared.node_id.clone(),
                            resource_id: resource_id.to_string(),
                            result_chunk_id,
                            recipients,
                        });
                    }
                    Ok(None) => {
                        debug!(node_id = %self.shared.node_id, resource_id, "No torrent to distribute result to");
                    }
                    Err(e) => {
                        warn!(node_id = %self.shared.node_id, resource_id, error = %e, "Failed to distribute result");
                    }
                }
                info!(node_id = %self.shared.node_id, resource_id, %task_id, loss = result.loss, accuracy = result.accuracy, "Training completed");
                self.shared.emit(NetworkEvent::TrainingCompleted {
                    node_id: self.shared.node_id.clone(),
                    resource_id: resource_id.to_string(),
                    task_id,
                    batch_id: task.batch.id.clone(),
                    result: Box::new(result),
                });
                TaskState::Completed
            }
            Err(failure) => {
                warn!(node_id = %self.shared.node_id, resource_id, %task_id, error = %failure, "Training failed");
                self.shared.emit(NetworkEvent::TrainingFailed {
                    node_id: self.shared.node_id.clone(),
                    resource_id: resource_id.to_string(),
                    task_id,
                    batch_id: task.batch.id.clone(),
                    error: failure.to_string(),
                });
                TaskState::Failed {
                    reason: failure.to_string(),
                }
            }
        };

        self.set_task_state(resource_id, task_id, final_state.clone())
            .await;
        final_state
    }

    /// Store a result chunk and queue it for every other torrent member.
    async fn distribute_result(
        &self,
        resource_id: &str,
        result: &crate::training::TrainingResult,
    ) -> SwarmResult<Option<(String, usize)>> {
        let produced_at = result
            .produced_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| result.produced_at.timestamp_millis());
        let chunk = Chunk::new(
            resource_id,
            ChunkKind::Result(produced_at),
            Bytes::from(serde_json::to_vec(result)?),
        );

        let mut state = self.shared.state.write().await;
        let Some(torrent) = state.torrents.get(resource_id) else {
            return Ok(None);
        };
        let recipients: Vec<String> = torrent
            .members()
            .map(|p| p.peer_id.clone())
            .filter(|id| id != &self.shared.node_id)
            .collect();

        let chunk_id = chunk.id.clone();
        self.shared.store.insert(chunk.clone());
        for to_peer in &recipients {
            state.upload_queue.push_back(PendingUpload {
                to_peer: to_peer.clone(),
                chunk: chunk.clone(),
            });
        }
        self.shared.refresh_availability(&mut state);
        Ok(Some((chunk_id, recipients.len())))
    }

    async fn set_task_state(&self, resource_id: &str, task_id: Uuid, next: TaskState) {
        let mut state = self.shared.state.write().await;
        if let Some(task) = state.tasks.get_mut(resource_id) {
            if task.task_id != task_id || task.state.is_terminal() {
                return;
            }
            // A paused task keeps reporting paused until resumed
            task.state = match (&task.state, next) {
                (TaskState::Paused { .. }, TaskState::Running { progress }) => {
                    TaskState::Paused { progress }
                }
                (_, next) => next,
            };
        }
    }

    /// Pause, resume or stop the training task running for `resource_id`.
    ///
    /// Returns false if no unfinished task exists.
    pub async fn control_training(&self, resource_id: &str, control: TaskControl) -> bool {
        let mut state = self.shared.state.write().await;
        let Some(task) = state.tasks.get_mut(resource_id) else {
            return false;
        };
        if task.state.is_terminal() || task.control.send(control).is_err() {
            return false;
        }

        let progress = match task.state {
            TaskState::Running { progress } | TaskState::Paused { progress } => progress,
            _ => 0,
        };
        task.state = match control {
            TaskControl::Pause => TaskState::Paused { progress },
            TaskControl::Run => TaskState::Running { progress },
            TaskControl::Stop => task.state.clone(),
        };
        info!(node_id = %self.shared.node_id, resource_id, ?control, "Training control sent");
        true
    }

    /// State of the latest training task for `resource_id`.
    pub async fn task_state(&self, resource_id: &str) -> Option<TaskState> {
        self.shared
            .state
            .read()
            .await
            .tasks
            .get(resource_id)
            .map(|t| t.state.clone())
    }

    /// Store a checkpoint chunk locally.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> SwarmResult<()> {
        let chunk = checkpoint.to_chunk()?;
        let chunk_id = chunk.id.clone();
        self.shared.store.insert(chunk);
        {
            let mut state = self.shared.state.write().await;
            self.shared.refresh_availability(&mut state);
            state.last_active_at = Utc::now();
        }

        debug!(node_id = %self.shared.node_id, resource_id = %checkpoint.resource_id, version = checkpoint.version, "Checkpoint saved");
        self.shared.emit(NetworkEvent::CheckpointSaved {
            node_id: self.shared.node_id.clone(),
            resource_id: checkpoint.resource_id.clone(),
            version: checkpoint.version,
            chunk_id,
        });
        Ok(())
    }

    /// Pull checkpoints `(local, target]` in order from the best advertisers.
    ///
    /// Stops at the first version nobody can supply. Returns the local
    /// version reached, which is below `target` when there was a gap.
    pub async fn sync_to_version(&self, resource_id: &str, target: u64) -> u64 {
        if !self.has_resource(resource_id).await {
            warn!(node_id = %self.shared.node_id, resource_id, "Cannot sync a resource this node does not hold");
            return self.shared.version_of(resource_id);
        }

        self.shared
            .discover(self.transport.as_ref(), Some(resource_id))
            .await;

        let start = self.shared.version_of(resource_id);
        info!(node_id = %self.shared.node_id, resource_id, from = start, target, "Syncing resource");

        for version in start.saturating_add(1)..=target {
            let chunk_id = ChunkKind::Checkpoint(version).chunk_id(resource_id);
            if self.shared.store.contains(&chunk_id) {
                continue;
            }

            let best = self
                .shared
                .state
                .read()
                .await
                .peers
                .peers_with_chunk(resource_id, &chunk_id)
                .into_iter()
                .next();
            let Some(peer) = best else {
                debug!(node_id = %self.shared.node_id, resource_id, version, "No peer holds checkpoint; stopping sync");
                break;
            };
            if let Err(e) = self.request_chunk(&peer, &chunk_id).await {
                debug!(node_id = %self.shared.node_id, resource_id, version, error = %e, "Checkpoint fetch failed; stopping sync");
                break;
            }
        }

        let synced_to = self.shared.version_of(resource_id);
        self.shared.emit(NetworkEvent::ModelSynced {
            node_id: self.shared.node_id.clone(),
            resource_id: resource_id.to_string(),
            target_version: target,
            synced_to,
        });
        synced_to
    }

    /// Emit the metrics of checkpoint `version`, if held locally.
    pub async fn update_training_progress(
        &self,
        resource_id: &str,
        version: u64,
    ) -> Option<TrainingMetrics> {
        let chunk = self
            .shared
            .store
            .get(&ChunkKind::Checkpoint(version).chunk_id(resource_id))?;
        let checkpoint = match Checkpoint::from_chunk(&chunk) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(node_id = %self.shared.node_id, resource_id, version, error = %e, "Unreadable checkpoint");
                return None;
            }
        };

        self.touch().await;
        self.shared.emit(NetworkEvent::TrainingProgressUpdated {
            node_id: self.shared.node_id.clone(),
            resource_id: resource_id.to_string(),
            version,
            metrics: checkpoint.training_metrics,
        });
        Some(checkpoint.training_metrics)
    }

    /// Check whether this node can take on `requirement` for `resource_id`.
    pub async fn reallocate_resources(
        &self,
        resource_id: &str,
        requirement: ResourceRequirement,
    ) -> bool {
        let capacity = self.shared.config.capacity;
        if !capacity.satisfies(&requirement) {
            debug!(node_id = %self.shared.node_id, resource_id, ?requirement, ?capacity, "Cannot meet new requirement");
            return false;
        }

        self.touch().await;
        self.shared.emit(NetworkEvent::ResourcesReallocated {
            node_id: self.shared.node_id.clone(),
            resource_id: resource_id.to_string(),
            requirement,
            success: true,
        });
        true
    }

    /// Answer an upload request from `requester`.
    pub async fn serve_chunk(&self, requester: &str, chunk_id: &str) -> Option<Chunk> {
        self.shared.serve_chunk(requester, chunk_id).await
    }

    /// Run one discovery round over every held resource.
    pub async fn discover_peers(&self) -> usize {
        self.shared.discover(self.transport.as_ref(), None).await
    }

    /// Push the next queued upload. Returns false if the queue was empty.
    pub async fn process_upload_queue(&self) -> bool {
        self.shared.drain_one(self.transport.as_ref()).await
    }

    /// Latest local checkpoint version of `resource_id`, 0 if none.
    #[must_use]
    pub fn model_version(&self, resource_id: &str) -> u64 {
        self.shared.version_of(resource_id)
    }

    /// Every checkpoint version held for `resource_id`, ascending.
    #[must_use]
    pub fn available_versions(&self, resource_id: &str) -> Vec<u64> {
        checkpoint::versions(resource_id, &self.shared.store.ids_for(resource_id))
    }

    /// Metrics of every readable checkpoint held for `resource_id`, by version.
    #[must_use]
    pub fn training_history(&self, resource_id: &str) -> Vec<(u64, TrainingMetrics)> {
        self.available_versions(resource_id)
            .into_iter()
            .filter_map(|version| {
                let chunk = self
                    .shared
                    .store
                    .get(&ChunkKind::Checkpoint(version).chunk_id(resource_id))?;
                Checkpoint::from_chunk(&chunk)
                    .ok()
                    .map(|c| (version, c.training_metrics))
            })
            .collect()
    }

    /// Percentage of data chunks held for `resource_id`.
    pub async fn download_progress(&self, resource_id: &str) -> f64 {
        let Some(torrent) = self.torrent(resource_id).await else {
            return 0.0;
        };
        if torrent.total_chunks == 0 {
            return 0.0;
        }
        let held = self.shared.store.data_count(resource_id);
        held as f64 / f64::from(torrent.total_chunks) * 100.0
    }

    /// Whether a local chunk with this id exists.
    #[must_use]
    pub fn has_chunk(&self, chunk_id: &str) -> bool {
        self.shared.store.contains(chunk_id)
    }

    /// Every chunk id held locally.
    #[must_use]
    pub fn chunk_ids(&self) -> HashSet<String> {
        self.shared.store.ids()
    }

    /// Local chunks of `resource_id`, of any kind.
    #[must_use]
    pub fn chunks_for(&self, resource_id: &str) -> Vec<Chunk> {
        self.shared.store.chunks_for(resource_id)
    }

    pub async fn has_resource(&self, resource_id: &str) -> bool {
        self.shared.state.read().await.torrents.contains(resource_id)
    }

    pub async fn torrent(&self, resource_id: &str) -> Option<Torrent> {
        self.shared
            .state
            .read()
            .await
            .torrents
            .get(resource_id)
            .cloned()
    }

    pub async fn torrents(&self) -> Vec<Torrent> {
        self.shared
            .state
            .read()
            .await
            .torrents
            .iter()
            .cloned()
            .collect()
    }

    /// This node as other peers see it.
    pub async fn local_peer_info(&self) -> PeerInfo {
        self.shared.advertisement().await
    }

    pub async fn last_active_at(&self) -> DateTime<Utc> {
        self.shared.state.read().await.last_active_at
    }

    /// Whether the node has been inactive for longer than `max_idle`.
    pub async fn is_idle(&self, max_idle: Duration) -> bool {
        let Ok(max_idle) = ChronoDuration::from_std(max_idle) else {
            return false;
        };
        Utc::now() - self.last_active_at().await > max_idle
    }

    pub async fn stats(&self) -> NodeStats {
        let state = self.shared.state.read().await;
        let versions = state
            .torrents
            .resource_ids()
            .into_iter()
            .map(|r| {
                let version = self.shared.version_of(&r);
                (r, version)
            })
            .collect();

        NodeStats {
            node_id: self.shared.node_id.clone(),
            participant: self.shared.participant.clone(),
            connected_peers: state.peers.len(),
            active_resources: state.torrents.len(),
            total_chunks: self.shared.store.len(),
            pending_uploads: state.upload_queue.len(),
            last_active_at: state.last_active_at,
            capacity: self.shared.config.capacity,
            versions,
            bytes_uploaded: state.bytes_uploaded,
            bytes_downloaded: state.bytes_downloaded,
            upload_ratio: state.upload_ratio(),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Ok(handles) = self.background.get_mut() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk;
    use crate::training::{ModelSize, SimulatedExecutor, TrainingBatch};
    use crate::transport::MemoryTransport;

    fn test_config() -> NodeConfig {
        NodeConfig {
            chunk_size: 4,
            request_timeout: Duration::from_secs(1),
            max_fetch_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            max_retry_backoff: Duration::from_millis(2),
            ..NodeConfig::default()
        }
    }

    fn node(participant: &str, transport: &Arc<MemoryTransport>) -> Node {
        Node::new(
            participant,
            test_config(),
            transport.clone(),
            Arc::new(SimulatedExecutor::new(0.0)),
        )
    }

    async fn registered(participant: &str, transport: &Arc<MemoryTransport>) -> Node {
        let node = node(participant, transport);
        let handler: Arc<dyn ChunkHandler> = node.shared.clone();
        transport.register(node.node_id(), handler).await;
        node
    }

    fn drain(rx: &mut broadcast::Receiver<NetworkEvent>) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_node_ids_are_distinct_per_creation() {
        let transport = Arc::new(MemoryTransport::new());
        let a = node("0xabc", &transport);
        let b = node("0xabc", &transport);
        assert_eq!(a.node_id().len(), 64);
        assert_ne!(a.node_id(), b.node_id());
    }

    #[tokio::test]
    async fn test_create_resource_seeds_every_chunk() {
        let transport = Arc::new(MemoryTransport::new());
        let a = registered("0xa", &transport).await;
        let mut events = a.subscribe();

        let torrent = a
            .create_resource("modelX", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(torrent.total_chunks, 3);
        assert!(torrent.is_seeder(a.node_id()));
        assert!((a.download_progress("modelX").await - 100.0).abs() < f64::EPSILON);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [NetworkEvent::TorrentCreated { .. }]
        ));
    }

    #[tokio::test]
    async fn test_join_downloads_subset_of_advertised() {
        let transport = Arc::new(MemoryTransport::new());
        let a = registered("0xa", &transport).await;
        let b = registered("0xb", &transport).await;

        let torrent = a
            .create_resource("modelX", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        let joined = b.join_resource(&torrent.locator).await.unwrap();

        let a_ids = a.chunk_ids();
        let b_ids = b.chunk_ids();
        assert!(b_ids.is_subset(&a_ids));
        assert_eq!(b.shared.store.data_count("modelX"), 3);
        assert!(joined.is_seeder(b.node_id()));

        let payload = chunk::reassemble(&b.chunks_for("modelX"), joined.total_chunks).unwrap();
        assert_eq!(payload, Bytes::from_static(b"0123456789"));

        // A served three chunks, B consumed them
        let (a_stats, b_stats) = (a.stats().await, b.stats().await);
        assert_eq!(a_stats.bytes_uploaded, 10);
        assert_eq!(b_stats.bytes_downloaded, 10);
        assert!(a_stats.upload_ratio > b_stats.upload_ratio);
    }

    #[tokio::test]
    async fn test_join_without_peers_leaves_nothing_local() {
        let transport = Arc::new(MemoryTransport::new());
        let a = registered("0xa", &transport).await;
        let torrent = a
            .create_resource("modelX", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        transport.unregister(a.node_id()).await;

        let b = registered("0xb", &transport).await;
        let joined = b.join_resource(&torrent.locator).await.unwrap();
        assert!(b.chunk_ids().is_empty());
        assert_eq!(b.download_progress("modelX").await, 0.0);
        assert!(!joined.is_seeder(b.node_id()));
    }

    #[tokio::test]
    async fn test_invalid_locator_is_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let b = registered("0xb", &transport).await;
        assert!(matches!(
            b.join_resource("not a locator").await,
            Err(SwarmError::InvalidLocator(_))
        ));
    }

    /// Serves every chunk with its first byte flipped.
    struct TamperingPeer {
        inner: Arc<NodeShared>,
    }

    #[async_trait]
    impl ChunkHandler for TamperingPeer {
        async fn advertisement(&self) -> PeerInfo {
            let mut peer = self.inner.advertisement().await;
            peer.peer_id = "evil".to_string();
            peer
        }

        async fn serve_chunk(&self, _requester: &str, chunk_id: &str) -> Option<Chunk> {
            let mut chunk = self.inner.store.get(chunk_id)?;
            let mut data = chunk.data.to_vec();
            data[0] ^= 0xff;
            chunk.data = Bytes::from(data);
            Some(chunk)
        }

        async fn receive_chunk(&self, _from: &str, _chunk: Chunk) {}

        async fn receive_update(&self, _from: &str, _resource_id: &str, _version: u64) {}
    }

    #[tokio::test]
    async fn test_tampered_chunks_are_rejected_on_receipt() {
        let transport = Arc::new(MemoryTransport::new());
        let origin = node("0xa", &transport);
        let torrent = origin
            .create_resource("modelX", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        transport
            .register(
                "evil",
                Arc::new(TamperingPeer {
                    inner: origin.shared.clone(),
                }),
            )
            .await;

        let b = registered("0xb", &transport).await;
        let mut events = b.subscribe();
        b.join_resource(&torrent.locator).await.unwrap();

        assert!(b.chunk_ids().is_empty());
        let unavailable = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, NetworkEvent::ChunkUnavailable { attempts: 2, .. }))
            .count();
        assert_eq!(unavailable, 3);
    }

    #[tokio::test]
    async fn test_request_chunk_exhausts_retries() {
        let transport = Arc::new(MemoryTransport::new());
        let a = registered("0xa", &transport).await;
        let torrent = a
            .create_resource("modelX", Bytes::from_static(b"0123"))
            .await
            .unwrap();

        let b = registered("0xb", &transport).await;
        b.join_resource(&torrent.locator).await.unwrap();
        let ghost = PeerInfo::new("ghost", "0xghost");
        let err = b.request_chunk(&ghost, "modelX_0").await.unwrap_err();
        assert!(matches!(
            err,
            SwarmError::ChunkUnavailable {
                attempts: 2,
                source: TransportError::PeerUnreachable(_),
                ..
            }
        ));

        assert!(matches!(
            b.request_chunk(&ghost, "other_0").await,
            Err(SwarmError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_update_resource_versions_are_monotonic() {
        let transport = Arc::new(MemoryTransport::new());
        let a = registered("0xa", &transport).await;
        a.create_resource("m", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(a.model_version("m"), 0);

        let updated = a
            .update_resource("m", Bytes::from_static(br#"{"w":1}"#), 1)
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.total_chunks, 2);
        // Data chunks beyond the new range are gone
        assert!(!a.has_chunk("m_2"));
        assert!(a.has_chunk("m_checkpoint_1"));

        a.update_resource("m", Bytes::from_static(br#"{"w":3}"#), 3)
            .await
            .unwrap();
        assert!(matches!(
            a.update_resource("m", Bytes::from_static(b"{}"), 2).await,
            Err(SwarmError::StaleVersion { version: 2, current: 3, .. })
        ));
        assert!(matches!(
            a.update_resource("m", Bytes::from_static(b"{}"), 3).await,
            Err(SwarmError::StaleVersion { .. })
        ));
        assert_eq!(a.model_version("m"), 3);
        assert_eq!(a.available_versions("m"), vec![1, 3]);

        assert!(matches!(
            a.update_resource("unknown", Bytes::from_static(b"{}"), 1).await,
            Err(SwarmError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_training_emits_lifecycle_and_queues_result() {
        let transport = Arc::new(MemoryTransport::new());
        let a = registered("0xa", &transport).await;
        let b = registered("0xb", &transport).await;
        let torrent = a
            .create_resource("pool", Bytes::from_static(b"weights!"))
            .await
            .unwrap();
        b.join_resource(&torrent.locator).await.unwrap();
        a.discover_peers().await;

        let mut events = a.subscribe();
        let task = TrainingTask::new("pool", TrainingBatch::new("b1", 100, ModelSize::Small));
        let state = a.allocate_training_task("pool", task).await;
        assert_eq!(state, TaskState::Completed);
        assert_eq!(a.task_state("pool").await, Some(TaskState::Completed));

        let events = drain(&mut events);
        let kinds: Vec<&str> = events.iter().map(NetworkEvent::kind).collect();
        assert_eq!(kinds.first(), Some(&"training_started"));
        assert_eq!(kinds.iter().filter(|k| **k == "training_progress").count(), 11);
        assert_eq!(kinds.last(), Some(&"training_completed"));
        assert!(events.iter().any(|e| matches!(
            e,
            NetworkEvent::ResultDistributed { recipients: 1, .. }
        )));

        assert_eq!(a.stats().await.pending_uploads, 1);
        assert!(a.process_upload_queue().await);
        assert!(!a.process_upload_queue().await);
        assert!(
            b.chunk_ids()
                .iter()
                .any(|id| matches!(ChunkKind::parse("pool", id), Some(ChunkKind::Result(_))))
        );
    }

    #[tokio::test]
    async fn test_training_can_be_stopped() {
        let transport = Arc::new(MemoryTransport::new());
        let a = Arc::new(Node::new(
            "0xa",
            test_config(),
            transport.clone(),
            Arc::new(SimulatedExecutor::new(1.0)),
        ));
        a.create_resource("pool", Bytes::from_static(b"w"))
            .await
            .unwrap();

        // 100 samples: ten ticks of 100ms
        let task = TrainingTask::new("pool", TrainingBatch::new("b1", 100, ModelSize::Small));
        let runner = {
            let a = a.clone();
            tokio::spawn(async move { a.allocate_training_task("pool", task).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(a.control_training("pool", TaskControl::Pause).await);
        assert!(matches!(
            a.task_state("pool").await,
            Some(TaskState::Paused { .. })
        ));
        assert!(a.control_training("pool", TaskControl::Stop).await);

        let state = runner.await.unwrap();
        assert!(matches!(state, TaskState::Failed { .. }));
        assert!(!a.control_training("pool", TaskControl::Run).await);
    }

    #[tokio::test]
    async fn test_sync_to_version_converges_and_stops_at_gap() {
        let transport = Arc::new(MemoryTransport::new());
        let a = registered("0xa", &transport).await;
        let b = registered("0xb", &transport).await;
        let torrent = a
            .create_resource("pool", Bytes::from_static(b"weights!"))
            .await
            .unwrap();
        for version in [1, 2, 3, 5] {
            a.save_checkpoint(&Checkpoint::new(
                "pool",
                version,
                serde_json::json!({ "v": version }),
                TrainingMetrics {
                    loss: 0.5 / version as f64,
                    accuracy: 0.8,
                    epochs: version as u32,
                },
            ))
            .await
            .unwrap();
        }
        b.join_resource(&torrent.locator).await.unwrap();

        let mut events = b.subscribe();
        assert_eq!(b.sync_to_version("pool", 3).await, 3);
        assert_eq!(b.model_version("pool"), 3);
        assert_eq!(
            drain(&mut events)
                .iter()
                .filter(|e| e.kind() == "checkpoint_downloaded")
                .count(),
            3
        );

        // Version 4 is missing everywhere
        assert_eq!(b.sync_to_version("pool", 5).await, 3);

        let history = b.training_history("pool");
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].1.epochs, 3);
        assert_eq!(
            b.update_training_progress("pool", 2).await.map(|m| m.epochs),
            Some(2)
        );
        assert!(b.update_training_progress("pool", 4).await.is_none());
    }

    #[tokio::test]
    async fn test_reallocate_resources_checks_capacity() {
        let transport = Arc::new(MemoryTransport::new());
        let a = node("0xa", &transport);
        let small = ResourceRequirement::for_batch(&TrainingBatch::new("b", 1000, ModelSize::Small));
        let large = ResourceRequirement::for_batch(&TrainingBatch::new("b", 1000, ModelSize::Large));
        assert!(a.reallocate_resources("pool", small).await);
        assert!(!a.reallocate_resources("pool", large).await);
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let transport = Arc::new(MemoryTransport::new());
        let a = Node::new(
            "0xa",
            NodeConfig {
                discovery_interval: Duration::from_millis(10),
                upload_interval: Duration::from_millis(10),
                ..test_config()
            },
            transport.clone(),
            Arc::new(SimulatedExecutor::new(0.0)),
        );
        a.initialize().await;
        a.initialize().await;
        assert_eq!(transport.peer_count(), 1);

        a.shutdown().await;
        assert_eq!(transport.peer_count(), 0);
        assert!(a.background.lock().unwrap().is_empty());

        // Loops are gone, so the second stop signal has no listener
        a.shutdown().await;
        assert_eq!(transport.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_is_idle() {
        let transport = Arc::new(MemoryTransport::new());
        let a = node("0xa", &transport);
        assert!(!a.is_idle(Duration::from_secs(60)).await);
        a.shared.state.write().await.last_active_at = Utc::now() - ChronoDuration::hours(2);
        assert!(a.is_idle(Duration::from_secs(3600)).await);
    }
}
