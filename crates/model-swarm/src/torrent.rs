//! Torrent catalog.
//!
//! One [`Torrent`] per distributable resource (a model and its versions):
//! chunk geometry, the magnet-style [`Locator`], and the seeder/leecher sets.
//!
//! A node that originates a resource is its sole seeder with full availability.
//! A node that joins through a locator starts as a leecher with nothing, and
//! is promoted to seeder once it holds every data chunk.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::chunk::{self, Chunk, ChunkKind};
use crate::error::{SwarmError, SwarmResult};
use crate::peers::PeerInfo;

const MAGNET_PREFIX: &str = "magnet:?";
const DISPLAY_PREFIX: &str = "AI_Model_";

/// Display name used for a resource in locators and torrents.
#[must_use]
pub fn display_name(resource_id: &str) -> String {
    format!("{DISPLAY_PREFIX}{resource_id}")
}

/// Magnet-style locator identifying a resource and how to find its peers.
///
/// ```text
/// magnet:?xt=urn:btih:<sha256>&dn=AI_Model_<id>&xl=<bytes>&nc=<chunks>&cs=<chunk size>&tr=<tracker>
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    /// SHA-256 over `{resource}_{chunks}_{size}`
    pub info_hash: String,
    pub resource_id: String,
    /// Total payload size, 0 if the locator did not carry it
    pub total_size: u64,
    /// Total data chunks, 0 if the locator did not carry it
    pub total_chunks: u32,
    /// Chunk size, 0 if the locator did not carry it
    pub chunk_size: usize,
    /// Discovery tracker hint
    pub tracker: String,
}

impl Locator {
    /// Derive the locator for a resource.
    #[must_use]
    pub fn generate(
        resource_id: &str,
        total_chunks: u32,
        total_size: u64,
        chunk_size: usize,
        tracker: &str,
    ) -> Self {
        let info_hash = hex::encode(Sha256::digest(
            format!("{resource_id}_{total_chunks}_{total_size}").as_bytes(),
        ));
        Self {
            info_hash,
            resource_id: resource_id.to_string(),
            total_size,
            total_chunks,
            chunk_size,
            tracker: tracker.to_string(),
        }
    }

    /// Parse a locator string.
    ///
    /// Only the `dn=AI_Model_<id>` parameter is required. Missing numeric
    /// parameters read as 0 (unknown).
    pub fn parse(locator: &str) -> SwarmResult<Self> {
        let query = locator
            .strip_prefix(MAGNET_PREFIX)
            .ok_or_else(|| SwarmError::InvalidLocator(locator.to_string()))?;

        let params: HashMap<&str, &str> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();

        let resource_id = params
            .get("dn")
            .and_then(|dn| dn.strip_prefix(DISPLAY_PREFIX))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SwarmError::InvalidLocator(locator.to_string()))?;

        let number = |key: &str| params.get(key).and_then(|v| v.parse::<u64>().ok());
        let out_of_range = |_| SwarmError::InvalidLocator(locator.to_string());
        let total_chunks = u32::try_from(number("nc").unwrap_or(0)).map_err(out_of_range)?;
        let chunk_size = usize::try_from(number("cs").unwrap_or(0)).map_err(out_of_range)?;

        Ok(Self {
            info_hash: params
                .get("xt")
                .and_then(|xt| xt.strip_prefix("urn:btih:"))
                .unwrap_or_default()
                .to_string(),
            resource_id: resource_id.to_string(),
            total_size: number("xl").unwrap_or(0),
            total_chunks,
            chunk_size,
            tracker: params.get("tr").copied().unwrap_or_default().to_string(),
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{MAGNET_PREFIX}xt=urn:btih:{}&dn={}&xl={}&nc={}&cs={}&tr={}",
            self.info_hash,
            display_name(&self.resource_id),
            self.total_size,
            self.total_chunks,
            self.chunk_size,
            self.tracker
        )
    }
}

/// Distribution metadata for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Torrent {
    pub resource_id: String,
    pub display_name: String,
    pub total_chunks: u32,
    pub chunk_size: usize,
    pub total_size: u64,
    /// Rendered [`Locator`]
    pub locator: String,
    /// Peers holding every data chunk
    pub seeders: Vec<PeerInfo>,
    /// Peers still acquiring data chunks
    pub leechers: Vec<PeerInfo>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Latest model version published through this torrent
    pub version: u64,
    /// Whether the pool behind this resource is actively training
    pub is_active_training: bool,
}

impl Torrent {
    fn shell(locator: &Locator, chunk_size: usize) -> Self {
        let now = Utc::now();
        Self {
            resource_id: locator.resource_id.clone(),
            display_name: display_name(&locator.resource_id),
            total_chunks: locator.total_chunks,
            chunk_size: if locator.chunk_size > 0 {
                locator.chunk_size
            } else {
                chunk_size
            },
            total_size: locator.total_size,
            locator: locator.to_string(),
            seeders: Vec::new(),
            leechers: Vec::new(),
            created_at: now,
            last_updated_at: now,
            version: 0,
            is_active_training: false,
        }
    }

    /// Seeders followed by leechers.
    pub fn members(&self) -> impl Iterator<Item = &PeerInfo> {
        self.seeders.iter().chain(self.leechers.iter())
    }

    #[must_use]
    pub fn is_member(&self, peer_id: &str) -> bool {
        self.members().any(|p| p.peer_id == peer_id)
    }

    #[must_use]
    pub fn is_seeder(&self, peer_id: &str) -> bool {
        self.seeders.iter().any(|p| p.peer_id == peer_id)
    }

    /// Every data chunk id in the indexed range.
    #[must_use]
    pub fn data_chunk_ids(&self) -> Vec<String> {
        (0..self.total_chunks)
            .map(|i| ChunkKind::Data(i).chunk_id(&self.resource_id))
            .collect()
    }

    /// Whether `available` covers every data chunk.
    fn is_complete(&self, available: &HashSet<String>) -> bool {
        self.total_chunks > 0
            && (0..self.total_chunks)
                .all(|i| available.contains(&ChunkKind::Data(i).chunk_id(&self.resource_id)))
    }

    fn remove_member(&mut self, peer_id: &str) -> Option<PeerInfo> {
        if let Some(pos) = self.seeders.iter().position(|p| p.peer_id == peer_id) {
            return Some(self.seeders.remove(pos));
        }
        if let Some(pos) = self.leechers.iter().position(|p| p.peer_id == peer_id) {
            return Some(self.leechers.remove(pos));
        }
        None
    }

    /// Insert or refresh a member, placing it by completeness.
    ///
    /// Only chunk ids belonging to this resource are kept.
    pub fn upsert_member(&mut self, mut peer: PeerInfo) {
        let resource_id = self.resource_id.clone();
        peer.available_chunk_ids
            .retain(|id| ChunkKind::parse(&resource_id, id).is_some());

        self.remove_member(&peer.peer_id);
        if self.is_complete(&peer.available_chunk_ids) {
            self.seeders.push(peer);
        } else {
            self.leechers.push(peer);
        }
        self.last_updated_at = Utc::now();
    }

    /// Refresh a member's advertised chunks and liveness.
    ///
    /// Returns `true` if the member was promoted from leecher to seeder.
    pub fn refresh_local(&mut self, peer_id: &str, available: &HashSet<String>) -> bool {
        let Some(mut peer) = self.remove_member(peer_id) else {
            return false;
        };
        let was_seeder = self.is_complete(&peer.available_chunk_ids);
        peer.available_chunk_ids = available.clone();
        peer.last_seen_at = Utc::now();
        self.upsert_member(peer);
        !was_seeder && self.is_seeder(peer_id)
    }

    /// Move a leecher into the seeder set regardless of advertised chunks.
    ///
    /// Returns `false` if the peer is not a leecher of this torrent.
    pub fn promote_to_seeder(&mut self, peer_id: &str) -> bool {
        let Some(pos) = self.leechers.iter().position(|p| p.peer_id == peer_id) else {
            return false;
        };
        let peer = self.leechers.remove(pos);
        self.seeders.push(peer);
        self.last_updated_at = Utc::now();
        true
    }
}

/// The torrents one node participates in, keyed by resource id.
#[derive(Debug, Clone)]
pub struct TorrentCatalog {
    torrents: HashMap<String, Torrent>,
    chunk_size: usize,
    tracker: String,
}

impl TorrentCatalog {
    pub fn new(chunk_size: usize, tracker: impl Into<String>) -> Self {
        Self {
            torrents: HashMap::new(),
            chunk_size,
            tracker: tracker.into(),
        }
    }

    /// Chunk `payload` and register `local` as the sole seeder.
    ///
    /// Re-creating an existing resource republishes it: creation time is kept
    /// and previously known members stay on as leechers of the new content.
    pub fn create_torrent(
        &mut self,
        resource_id: &str,
        payload: &Bytes,
        mut local: PeerInfo,
    ) -> SwarmResult<(Torrent, Vec<Chunk>)> {
        let total_chunks = chunk::chunk_count(payload.len(), self.chunk_size)?;
        let chunks = chunk::split(resource_id, payload, self.chunk_size)?;
        let total_size = payload.len() as u64;
        let locator = Locator::generate(
            resource_id,
            total_chunks,
            total_size,
            self.chunk_size,
            &self.tracker,
        );

        local.available_chunk_ids = chunks.iter().map(|c| c.id.clone()).collect();
        local.upload_ratio = local.upload_ratio.max(1.0);
        local.last_seen_at = Utc::now();

        let now = Utc::now();
        let previous = self.torrents.remove(resource_id);
        let mut torrent = Torrent {
            resource_id: resource_id.to_string(),
            display_name: display_name(resource_id),
            total_chunks,
            chunk_size: self.chunk_size,
            total_size,
            locator: locator.to_string(),
            seeders: vec![local.clone()],
            leechers: Vec::new(),
            created_at: previous.as_ref().map_or(now, |t| t.created_at),
            last_updated_at: now,
            version: previous.as_ref().map_or(0, |t| t.version),
            is_active_training: previous.as_ref().is_some_and(|t| t.is_active_training),
        };

        if let Some(previous) = previous {
            torrent.leechers = previous
                .members()
                .filter(|p| p.peer_id != local.peer_id)
                .cloned()
                .map(|mut p| {
                    p.available_chunk_ids.clear();
                    p
                })
                .collect();
        }

        self.torrents
            .insert(resource_id.to_string(), torrent.clone());
        Ok((torrent, chunks))
    }

    /// Join the resource named by `locator` as a leecher.
    ///
    /// Builds a torrent shell from the locator if the resource is not known
    /// locally. Joining a resource the node already belongs to is a no-op.
    pub fn join_torrent(&mut self, locator: &str, mut local: PeerInfo) -> SwarmResult<Torrent> {
        let parsed = Locator::parse(locator)?;
        let chunk_size = self.chunk_size;
        let torrent = self
            .torrents
            .entry(parsed.resource_id.clone())
            .or_insert_with(|| Torrent::shell(&parsed, chunk_size));

        if !torrent.is_member(&local.peer_id) {
            local.available_chunk_ids.clear();
            local.last_seen_at = Utc::now();
            torrent.leechers.push(local);
            torrent.last_updated_at = Utc::now();
        }

        Ok(torrent.clone())
    }

    #[must_use]
    pub fn get(&self, resource_id: &str) -> Option<&Torrent> {
        self.torrents.get(resource_id)
    }

    pub fn get_mut(&mut self, resource_id: &str) -> Option<&mut Torrent> {
        self.torrents.get_mut(resource_id)
    }

    #[must_use]
    pub fn contains(&self, resource_id: &str) -> bool {
        self.torrents.contains_key(resource_id)
    }

    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }

    pub fn resource_ids(&self) -> Vec<String> {
        self.torrents.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Torrent> {
        self.torrents.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Torrent> {
        self.torrents.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACKER: &str = "stellarium-ai-tracker";

    fn local(id: &str) -> PeerInfo {
        PeerInfo::new(id, format!("0x{id}"))
    }

    #[test]
    fn test_locator_round_trip() {
        let locator = Locator::generate("modelX", 3, 2500, 1024, TRACKER);
        let rendered = locator.to_string();
        assert!(rendered.starts_with("magnet:?xt=urn:btih:"));
        assert!(rendered.contains("dn=AI_Model_modelX"));
        assert!(rendered.ends_with("tr=stellarium-ai-tracker"));
        assert_eq!(Locator::parse(&rendered).unwrap(), locator);
    }

    #[test]
    fn test_locator_without_sizes_parses() {
        let parsed =
            Locator::parse("magnet:?xt=urn:btih:abc&dn=AI_Model_pool-1&tr=stellarium-ai-tracker")
                .unwrap();
        assert_eq!(parsed.resource_id, "pool-1");
        assert_eq!(parsed.total_chunks, 0);
        assert_eq!(parsed.info_hash, "abc");
    }

    #[test]
    fn test_invalid_locators() {
        for bad in [
            "",
            "http://example.com",
            "magnet:?xt=urn:btih:abc",
            "magnet:?dn=Other_x",
            "magnet:?dn=AI_Model_",
            "magnet:?dn=AI_Model_x&nc=4294967296",
        ] {
            assert!(
                matches!(Locator::parse(bad), Err(SwarmError::InvalidLocator(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_create_torrent_size_invariant() {
        let mut catalog = TorrentCatalog::new(1000, TRACKER);
        let payload = Bytes::from(vec![0u8; 2500]);
        let (torrent, chunks) = catalog.create_torrent("m", &payload, local("a")).unwrap();

        assert_eq!(torrent.total_chunks, 3);
        assert_eq!(torrent.total_size, 2500);
        assert_eq!(chunks.iter().map(|c| c.size as u64).sum::<u64>(), torrent.total_size);
        assert_eq!(
            u64::from(torrent.total_chunks),
            torrent.total_size.div_ceil(torrent.chunk_size as u64)
        );
        assert_eq!(torrent.seeders.len(), 1);
        assert_eq!(torrent.seeders[0].available_chunk_ids.len(), 3);
        assert!(torrent.leechers.is_empty());
    }

    #[test]
    fn test_join_unknown_builds_shell_as_leecher() {
        let mut origin = TorrentCatalog::new(1000, TRACKER);
        let (created, _) = origin
            .create_torrent("m", &Bytes::from(vec![1u8; 2500]), local("a"))
            .unwrap();

        let mut catalog = TorrentCatalog::new(1000, TRACKER);
        let joined = catalog.join_torrent(&created.locator, local("b")).unwrap();
        assert_eq!(joined.total_chunks, 3);
        assert_eq!(joined.total_size, 2500);
        assert!(joined.seeders.is_empty());
        assert_eq!(joined.leechers.len(), 1);
        assert!(joined.leechers[0].available_chunk_ids.is_empty());

        // Second join does not duplicate membership
        let again = catalog.join_torrent(&created.locator, local("b")).unwrap();
        assert_eq!(again.leechers.len(), 1);
    }

    #[test]
    fn test_join_known_adds_leecher() {
        let mut catalog = TorrentCatalog::new(1000, TRACKER);
        let (created, _) = catalog
            .create_torrent("m", &Bytes::from(vec![1u8; 10]), local("a"))
            .unwrap();
        let joined = catalog.join_torrent(&created.locator, local("b")).unwrap();
        assert_eq!(joined.seeders.len(), 1);
        assert_eq!(joined.leechers.len(), 1);
    }

    #[test]
    fn test_refresh_local_promotes_complete_leecher() {
        let mut catalog = TorrentCatalog::new(4, TRACKER);
        let (created, chunks) = catalog
            .create_torrent("m", &Bytes::from_static(b"abcdefgh"), local("a"))
            .unwrap();
        catalog.join_torrent(&created.locator, local("b")).unwrap();

        let torrent = catalog.get_mut("m").unwrap();
        let partial: HashSet<String> = [chunks[0].id.clone()].into();
        assert!(!torrent.refresh_local("b", &partial));
        assert!(!torrent.is_seeder("b"));

        let full: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
        assert!(torrent.refresh_local("b", &full));
        assert!(torrent.is_seeder("b"));
        assert_eq!(torrent.seeders.len(), 2);
    }

    #[test]
    fn test_promote_to_seeder() {
        let mut catalog = TorrentCatalog::new(4, TRACKER);
        let (created, _) = catalog
            .create_torrent("m", &Bytes::from_static(b"abcd"), local("a"))
            .unwrap();
        catalog.join_torrent(&created.locator, local("b")).unwrap();

        let torrent = catalog.get_mut("m").unwrap();
        assert!(torrent.promote_to_seeder("b"));
        assert!(!torrent.promote_to_seeder("b"));
        assert!(torrent.is_seeder("b"));
        assert!(torrent.leechers.is_empty());
    }

    #[test]
    fn test_republish_keeps_members_as_leechers() {
        let mut catalog = TorrentCatalog::new(4, TRACKER);
        let (created, _) = catalog
            .create_torrent("m", &Bytes::from_static(b"abcd"), local("a"))
            .unwrap();
        catalog.join_torrent(&created.locator, local("b")).unwrap();

        let (updated, chunks) = catalog
            .create_torrent("m", &Bytes::from_static(b"abcdefghij"), local("a"))
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.seeders.len(), 1);
        assert_eq!(updated.leechers.len(), 1);
        assert_eq!(updated.leechers[0].peer_id, "b");
    }
}
