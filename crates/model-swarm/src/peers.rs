//! Peer directory.
//!
//! Tracks every peer a node knows about: identity, advertised chunks,
//! bandwidth and upload-ratio reputation, and liveness. The directory is
//! owned by a single node and only mutated through that node.
//!
//! # Peer selection
//!
//! [`PeerDirectory::peers_with_chunk`] is the "best peer" policy used by both
//! chunk and checkpoint fetches: peers advertising the chunk, ordered by
//! descending upload ratio. Ties keep a stable order by peer id. The ratio
//! models tit-for-tat (bytes served / bytes consumed) and is used only as a
//! ranking signal, never enforced.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::chunk::ChunkKind;

/// What a node knows about one remote (or its own) peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Node identity of the peer
    pub peer_id: String,
    /// Participant (wallet) identity that owns the peer
    pub participant_identity: String,
    /// Chunk ids the peer currently advertises
    pub available_chunk_ids: HashSet<String>,
    /// Estimated bandwidth in KB/s
    pub bandwidth_estimate: u32,
    /// Bytes served divided by bytes consumed
    pub upload_ratio: f64,
    /// Last time this peer was heard from
    pub last_seen_at: DateTime<Utc>,
}

impl PeerInfo {
    /// A fresh peer with no advertised chunks.
    #[must_use]
    pub fn new(peer_id: impl Into<String>, participant_identity: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            participant_identity: participant_identity.into(),
            available_chunk_ids: HashSet::new(),
            bandwidth_estimate: 1000,
            upload_ratio: 0.0,
            last_seen_at: Utc::now(),
        }
    }

    /// Set the upload ratio.
    #[must_use]
    pub fn with_upload_ratio(mut self, ratio: f64) -> Self {
        self.upload_ratio = ratio;
        self
    }

    /// Set the advertised chunks.
    #[must_use]
    pub fn with_chunks<I, S>(mut self, chunk_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available_chunk_ids = chunk_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the peer advertises `chunk_id`.
    #[must_use]
    pub fn advertises(&self, chunk_id: &str) -> bool {
        self.available_chunk_ids.contains(chunk_id)
    }

    /// Whether the peer advertises anything for `resource_id`.
    #[must_use]
    pub fn participates_in(&self, resource_id: &str) -> bool {
        self.available_chunk_ids
            .iter()
            .any(|id| ChunkKind::parse(resource_id, id).is_some())
    }

    /// Number of data chunks advertised for `resource_id`.
    #[must_use]
    pub fn data_chunk_count(&self, resource_id: &str) -> usize {
        self.available_chunk_ids
            .iter()
            .filter(|id| matches!(ChunkKind::parse(resource_id, id), Some(ChunkKind::Data(_))))
            .count()
    }
}

/// Order peers best-first: higher upload ratio, then peer id.
pub(crate) fn by_upload_ratio_desc(a: &PeerInfo, b: &PeerInfo) -> Ordering {
    b.upload_ratio
        .partial_cmp(&a.upload_ratio)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.peer_id.cmp(&b.peer_id))
}

/// Known peers, keyed by peer id.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: HashMap<String, PeerInfo>,
}

impl PeerDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer.
    ///
    /// An older sighting never overwrites a newer one.
    pub fn upsert(&mut self, peer: PeerInfo) {
        match self.peers.get_mut(&peer.peer_id) {
            Some(existing) if existing.last_seen_at > peer.last_seen_at => {}
            Some(existing) => *existing = peer,
            None => {
                self.peers.insert(peer.peer_id.clone(), peer);
            }
        }
    }

    /// Merge a batch of discovered peers, keeping at most `max_peers`.
    ///
    /// When over the limit, the peers with the lowest upload ratio are
    /// dropped. Returns how many previously unknown peers were added.
    pub fn merge(&mut self, discovered: Vec<PeerInfo>, max_peers: usize) -> usize {
        let mut added = 0;
        for peer in discovered {
            if !self.peers.contains_key(&peer.peer_id) {
                added += 1;
            }
            self.upsert(peer);
        }

        if self.peers.len() > max_peers {
            let mut ranked: Vec<PeerInfo> = self.peers.drain().map(|(_, p)| p).collect();
            ranked.sort_by(by_upload_ratio_desc);
            ranked.truncate(max_peers);
            self.peers = ranked.into_iter().map(|p| (p.peer_id.clone(), p)).collect();
        }

        added
    }

    /// Peers advertising `chunk_id` of `resource_id`, best first.
    #[must_use]
    pub fn peers_with_chunk(&self, resource_id: &str, chunk_id: &str) -> Vec<PeerInfo> {
        if ChunkKind::parse(resource_id, chunk_id).is_none() {
            return Vec::new();
        }

        let mut peers: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|p| p.advertises(chunk_id))
            .cloned()
            .collect();
        peers.sort_by(by_upload_ratio_desc);
        peers
    }

    /// Peers advertising anything for `resource_id`.
    #[must_use]
    pub fn peers_for_resource(&self, resource_id: &str) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|p| p.participates_in(resource_id))
            .cloned()
            .collect();
        peers.sort_by(by_upload_ratio_desc);
        peers
    }

    /// Remove peers not seen within `max_age`. Returns how many were removed.
    pub fn prune_stale(&mut self, max_age: Duration) -> usize {
        // Out-of-range ages mean nothing can be stale yet
        let Ok(max_age) = ChronoDuration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let before = self.peers.len();
        self.peers.retain(|_, p| p.last_seen_at >= cutoff);
        before - self.peers.len()
    }

    /// Look up a peer.
    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }
}
