//! Chunk transport.
//!
//! The seam between a node and the network. A node registers a
//! [`ChunkHandler`] under its peer id; the transport routes fetches, pushes
//! and update announcements from other nodes to it, and answers discovery
//! queries from the set of registered peers.
//!
//! ```text
//!   Node A                      transport                      Node B
//!   ──────                      ─────────                      ──────
//!   request_chunk ── fetch(B) ──────────▶ serve_chunk ──▶ ChunkStore
//!   upload loop ──── push(B) ───────────▶ receive_chunk
//!   update_resource ─ announce_update(B) ▶ receive_update
//!   discovery loop ── discover ─────────▶ advertisement (every peer)
//! ```
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryTransport`]: an in-process swarm. Every registered node serves
//!   real chunks from its store. Latency and failures can be injected.
//! - [`SimulatedTransport`]: a stand-in with no real peers. Fetches return
//!   synthetic chunks after a random delay and fail at a fixed rate, and
//!   discovery invents a handful of peers.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::checkpoint::{Checkpoint, TrainingMetrics};
use crate::chunk::{Chunk, ChunkKind};
use crate::error::{TransportError, TransportResult};
use crate::peers::PeerInfo;

/// A node's local chunk store, shared between the node and its handler.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: DashMap<String, Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chunk, replacing any chunk with the same id.
    pub fn insert(&self, chunk: Chunk) {
        self.chunks.insert(chunk.id.clone(), chunk);
    }

    #[must_use]
    pub fn get(&self, chunk_id: &str) -> Option<Chunk> {
        self.chunks.get(chunk_id).map(|c| c.clone())
    }

    #[must_use]
    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.contains_key(chunk_id)
    }

    pub fn remove(&self, chunk_id: &str) -> Option<Chunk> {
        self.chunks.remove(chunk_id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Every chunk id held.
    pub fn ids(&self) -> HashSet<String> {
        self.chunks.iter().map(|e| e.key().clone()).collect()
    }

    /// Chunk ids held for `resource_id`, of any kind.
    pub fn ids_for(&self, resource_id: &str) -> HashSet<String> {
        self.chunks
            .iter()
            .filter(|e| e.value().resource_id == resource_id)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Chunks held for `resource_id`, of any kind.
    pub fn chunks_for(&self, resource_id: &str) -> Vec<Chunk> {
        self.chunks
            .iter()
            .filter(|e| e.value().resource_id == resource_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Number of data chunks held for `resource_id`.
    pub fn data_count(&self, resource_id: &str) -> usize {
        self.chunks
            .iter()
            .filter(|e| e.value().resource_id == resource_id && e.value().kind.is_data())
            .count()
    }

    /// Keep only the chunks for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&Chunk) -> bool) {
        self.chunks.retain(|_, c| keep(c));
    }
}

/// The serving half of a node, as seen by a transport.
#[async_trait]
pub trait ChunkHandler: Send + Sync {
    /// Current self-description for discovery.
    async fn advertisement(&self) -> PeerInfo;

    /// Answer an upload request. `None` if the chunk is not held.
    async fn serve_chunk(&self, requester: &str, chunk_id: &str) -> Option<Chunk>;

    /// Accept a chunk pushed by `from`.
    async fn receive_chunk(&self, from: &str, chunk: Chunk);

    /// Accept a new-version announcement from `from`.
    async fn receive_update(&self, from: &str, resource_id: &str, version: u64);
}

/// Moves chunks between peers and finds peers.
#[async_trait]
pub trait ChunkTransport: Send + Sync + 'static {
    /// Make `handler` reachable as `peer_id`.
    async fn register(&self, peer_id: &str, handler: Arc<dyn ChunkHandler>);

    /// Stop routing to `peer_id`.
    async fn unregister(&self, peer_id: &str);

    /// Fetch `chunk_id` from peer `from` on behalf of `requester`.
    async fn fetch(&self, from: &str, requester: &str, chunk_id: &str) -> TransportResult<Chunk>;

    /// Deliver `chunk` from `from` to peer `to`.
    async fn push(&self, to: &str, from: &str, chunk: Chunk) -> TransportResult<()>;

    /// Tell peer `to` that `from` published `version` of `resource_id`.
    async fn announce_update(
        &self,
        to: &str,
        from: &str,
        resource_id: &str,
        version: u64,
    ) -> TransportResult<()>;

    /// Peers participating in any of `resource_ids`, excluding `self_id`.
    ///
    /// An empty `resource_ids` asks for every known peer.
    async fn discover(&self, resource_ids: &[String], self_id: &str) -> Vec<PeerInfo>;
}

/// In-process swarm over registered handlers.
#[derive(Default)]
pub struct MemoryTransport {
    peers: DashMap<String, Arc<dyn ChunkHandler>>,
    /// Delay added to every request
    latency: Duration,
    /// Probability in [0, 1] that a fetch or push fails
    failure_rate: f64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed delay to every request.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail fetches and pushes with the given probability.
    #[must_use]
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn handler(&self, peer_id: &str) -> TransportResult<Arc<dyn ChunkHandler>> {
        self.peers
            .get(peer_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| TransportError::PeerUnreachable(peer_id.to_string()))
    }

    /// Apply injected latency and failures.
    async fn wire(&self, what: &str) -> TransportResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(TransportError::TransferFailed(format!("injected failure: {what}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkTransport for MemoryTransport {
    async fn register(&self, peer_id: &str, handler: Arc<dyn ChunkHandler>) {
        debug!(peer_id, "Registering peer with in-memory swarm");
        self.peers.insert(peer_id.to_string(), handler);
    }

    async fn unregister(&self, peer_id: &str) {
        debug!(peer_id, "Unregistering peer from in-memory swarm");
        self.peers.remove(peer_id);
    }

    async fn fetch(&self, from: &str, requester: &str, chunk_id: &str) -> TransportResult<Chunk> {
        let handler = self.handler(from)?;
        self.wire(chunk_id).await?;
        trace!(from, requester, chunk_id, "Fetching chunk");
        handler
            .serve_chunk(requester, chunk_id)
            .await
            .ok_or_else(|| TransportError::ChunkNotHeld {
                peer_id: from.to_string(),
                chunk_id: chunk_id.to_string(),
            })
    }

    async fn push(&self, to: &str, from: &str, chunk: Chunk) -> TransportResult<()> {
        let handler = self.handler(to)?;
        self.wire(&chunk.id).await?;
        handler.receive_chunk(from, chunk).await;
        Ok(())
    }

    async fn announce_update(
        &self,
        to: &str,
        from: &str,
        resource_id: &str,
        version: u64,
    ) -> TransportResult<()> {
        let handler = self.handler(to)?;
        handler.receive_update(from, resource_id, version).await;
        Ok(())
    }

    async fn discover(&self, resource_ids: &[String], self_id: &str) -> Vec<PeerInfo> {
        // Clone handlers out so no map guard is held across awaits
        let handlers: Vec<Arc<dyn ChunkHandler>> = self
            .peers
            .iter()
            .filter(|e| e.key() != self_id)
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut found = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let peer = handler.advertisement().await;
            if resource_ids.is_empty() || resource_ids.iter().any(|r| peer.participates_in(r)) {
                found.push(peer);
            }
        }
        found
    }
}

/// Randomized stand-in transport with no real peers.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    /// Scales every simulated delay; 0 disables delays
    pub time_scale: f64,
    /// Probability that a data chunk fetch fails
    pub chunk_failure_rate: f64,
    /// Probability that a checkpoint fetch fails
    pub checkpoint_failure_rate: f64,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            chunk_failure_rate: 0.1,
            checkpoint_failure_rate: 0.05,
        }
    }
}

impl SimulatedTransport {
    async fn delay(&self, base_ms: u64, jitter_ms: u64) {
        let ms = base_ms + rand::thread_rng().gen_range(0..=jitter_ms);
        let delay = Duration::from_millis(ms).mul_f64(self.time_scale.max(0.0));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn synthetic_checkpoint(resource_id: &str, version: u64) -> TransportResult<Chunk> {
        let mut rng = rand::thread_rng();
        let gradients: Vec<f64> = (0..100).map(|_| rng.r#gen::<f64>()).collect();
        let metrics = TrainingMetrics {
            loss: rng.gen_range(0.0..0.5),
            accuracy: rng.gen_range(0.7..1.0),
            epochs: u32::try_from(version).unwrap_or(u32::MAX),
        };
        Checkpoint::new(
            resource_id,
            version,
            serde_json::json!({ "gradients": gradients }),
            metrics,
        )
        .to_chunk()
        .map_err(|e| TransportError::TransferFailed(e.to_string()))
    }
}

/// Split a chunk id into resource id and kind without knowing the resource.
fn split_chunk_id(chunk_id: &str) -> Option<(&str, ChunkKind)> {
    for marker in ["_checkpoint_", "_result_"] {
        if let Some(pos) = chunk_id.rfind(marker) {
            let resource_id = &chunk_id[..pos];
            return ChunkKind::parse(resource_id, chunk_id).map(|k| (resource_id, k));
        }
    }
    let pos = chunk_id.rfind('_')?;
    let resource_id = &chunk_id[..pos];
    ChunkKind::parse(resource_id, chunk_id).map(|k| (resource_id, k))
}

#[async_trait]
impl ChunkTransport for SimulatedTransport {
    async fn register(&self, peer_id: &str, _handler: Arc<dyn ChunkHandler>) {
        debug!(peer_id, "Simulated transport ignores registration");
    }

    async fn unregister(&self, _peer_id: &str) {}

    async fn fetch(&self, from: &str, _requester: &str, chunk_id: &str) -> TransportResult<Chunk> {
        let (resource_id, kind) = split_chunk_id(chunk_id).ok_or_else(|| {
            TransportError::ChunkNotHeld {
                peer_id: from.to_string(),
                chunk_id: chunk_id.to_string(),
            }
        })?;

        match kind {
            ChunkKind::Checkpoint(version) => {
                self.delay(200, 300).await;
                if rand::thread_rng().gen_bool(self.checkpoint_failure_rate.clamp(0.0, 1.0)) {
                    return Err(TransportError::TransferFailed(chunk_id.to_string()));
                }
                Self::synthetic_checkpoint(resource_id, version)
            }
            _ => {
                self.delay(100, 200).await;
                if rand::thread_rng().gen_bool(self.chunk_failure_rate.clamp(0.0, 1.0)) {
                    return Err(TransportError::TransferFailed(chunk_id.to_string()));
                }
                let data = Bytes::from(format!("Simulated chunk data for {chunk_id}"));
                Ok(Chunk::new(resource_id, kind, data))
            }
        }
    }

    async fn push(&self, to: &str, _from: &str, chunk: Chunk) -> TransportResult<()> {
        trace!(to, chunk_id = %chunk.id, "Simulated upload");
        Ok(())
    }

    async fn announce_update(
        &self,
        to: &str,
        _from: &str,
        resource_id: &str,
        version: u64,
    ) -> TransportResult<()> {
        debug!(to, resource_id, version, "Simulated update announcement");
        Ok(())
    }

    async fn discover(&self, _resource_ids: &[String], _self_id: &str) -> Vec<PeerInfo> {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(1..=3);
        (0..count)
            .map(|i| {
                let peer_id = hex::encode(Sha256::digest(format!("peer_{now}_{i}").as_bytes()));
                let wallet: [u8; 20] = rng.r#gen();
                let mut peer = PeerInfo::new(peer_id, format!("0x{}", hex::encode(wallet)))
                    .with_upload_ratio(rng.gen_range(0.0..2.0));
                peer.bandwidth_estimate = rng.gen_range(100..1100);
                peer
            })
            .collect()
    }
}
