//! Content chunking.
//!
//! Splits an opaque model payload into fixed-size, SHA-256 hashed chunks and
//! puts it back together. Pure data transforms, no I/O.
//!
//! Chunk ids are derived from the resource id:
//!
//! | Kind       | Id                               |
//! |------------|----------------------------------|
//! | Data       | `{resource}_{index}`             |
//! | Result     | `{resource}_result_{timestamp}`  |
//! | Checkpoint | `{resource}_checkpoint_{version}`|
//!
//! Result and checkpoint chunks are out-of-band: they share the chunk
//! representation but never count towards a torrent's indexed range.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{SwarmError, SwarmResult};

/// What a chunk carries and where it sits in its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ChunkKind {
    /// Piece `index` of the resource payload
    Data(u32),
    /// A serialized training result, keyed by production time (ns)
    Result(i64),
    /// A serialized checkpoint at the given version
    Checkpoint(u64),
}

impl ChunkKind {
    /// Format the chunk id for this kind within `resource_id`.
    #[must_use]
    pub fn chunk_id(&self, resource_id: &str) -> String {
        match self {
            Self::Data(index) => format!("{resource_id}_{index}"),
            Self::Result(ts) => format!("{resource_id}_result_{ts}"),
            Self::Checkpoint(version) => format!("{resource_id}_checkpoint_{version}"),
        }
    }

    /// Parse a chunk id belonging to `resource_id`.
    ///
    /// Returns `None` if the id belongs to a different resource, including
    /// resources whose id merely shares a prefix with `resource_id`.
    #[must_use]
    pub fn parse(resource_id: &str, chunk_id: &str) -> Option<Self> {
        let rest = chunk_id.strip_prefix(resource_id)?.strip_prefix('_')?;
        if let Some(version) = rest.strip_prefix("checkpoint_") {
            return version.parse().ok().map(Self::Checkpoint);
        }
        if let Some(ts) = rest.strip_prefix("result_") {
            return ts.parse().ok().map(Self::Result);
        }
        rest.parse().ok().map(Self::Data)
    }

    /// Whether this chunk is part of the torrent's indexed range.
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// A hashed slice of a resource, or an out-of-band payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk id (see [`ChunkKind::chunk_id`])
    pub id: String,
    /// Owning resource
    pub resource_id: String,
    /// Position or out-of-band role
    pub kind: ChunkKind,
    /// Raw bytes
    pub data: Bytes,
    /// Hex SHA-256 of `data`
    pub content_hash: String,
    /// Length of `data` in bytes
    pub size: usize,
    /// When this chunk was produced
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Build a chunk, hashing `data`.
    pub fn new(resource_id: &str, kind: ChunkKind, data: Bytes) -> Self {
        Self {
            id: kind.chunk_id(resource_id),
            resource_id: resource_id.to_string(),
            kind,
            content_hash: content_hash(&data),
            size: data.len(),
            data,
            created_at: Utc::now(),
        }
    }

    /// Check that `content_hash` and `size` describe `data`.
    #[must_use]
    pub fn verify(&self) -> bool {
        self.size == self.data.len() && self.content_hash == content_hash(&self.data)
    }

    /// Like [`Chunk::verify`], as a `Result`.
    pub fn ensure_valid(&self) -> SwarmResult<()> {
        if self.verify() {
            Ok(())
        } else {
            Err(SwarmError::HashMismatch {
                chunk_id: self.id.clone(),
            })
        }
    }
}

/// Hex-encoded SHA-256 of `data`.
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Number of chunks a payload of `total_size` bytes splits into.
pub fn chunk_count(total_size: usize, chunk_size: usize) -> SwarmResult<u32> {
    if chunk_size == 0 {
        return Err(SwarmError::InvalidChunkSize(chunk_size));
    }
    u32::try_from(total_size.div_ceil(chunk_size)).map_err(|_| SwarmError::TooManyChunks {
        total_size,
        chunk_size,
    })
}

/// Split `payload` into `ceil(len / chunk_size)` data chunks.
pub fn split(resource_id: &str, payload: &Bytes, chunk_size: usize) -> SwarmResult<Vec<Chunk>> {
    let total = chunk_count(payload.len(), chunk_size)?;
    let chunks = (0..total)
        .map(|index| {
            let start = index as usize * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            Chunk::new(resource_id, ChunkKind::Data(index), payload.slice(start..end))
        })
        .collect();

    Ok(chunks)
}

/// Concatenate data chunks `[0, total_chunks)` in index order.
///
/// Every chunk is verified against its hash before it is used, so a tampered
/// chunk fails with [`SwarmError::HashMismatch`] instead of yielding wrong bytes.
/// Out-of-band chunks in the input are ignored.
pub fn reassemble<'a, I>(chunks: I, total_chunks: u32) -> SwarmResult<Bytes>
where
    I: IntoIterator<Item = &'a Chunk>,
{
    let mut by_index: BTreeMap<u32, &Chunk> = BTreeMap::new();
    for chunk in chunks {
        if let ChunkKind::Data(index) = chunk.kind {
            if index < total_chunks {
                by_index.insert(index, chunk);
            }
        }
    }

    let missing: Vec<u32> = (0..total_chunks)
        .filter(|index| !by_index.contains_key(index))
        .collect();
    if !missing.is_empty() {
        return Err(SwarmError::MissingChunks { missing });
    }

    let total_len = by_index.values().map(|c| c.data.len()).sum();
    let mut out = BytesMut::with_capacity(total_len);
    for chunk in by_index.values() {
        chunk.ensure_valid()?;
        out.extend_from_slice(&chunk.data);
    }

    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(ChunkKind::Data(3).chunk_id("modelX"), "modelX_3");
        assert_eq!(
            ChunkKind::Checkpoint(7).chunk_id("modelX"),
            "modelX_checkpoint_7"
        );
        assert_eq!(ChunkKind::Result(42).chunk_id("modelX"), "modelX_result_42");
    }

    #[test]
    fn test_parse_rejects_prefix_collisions() {
        assert_eq!(ChunkKind::parse("a", "a_4"), Some(ChunkKind::Data(4)));
        assert_eq!(ChunkKind::parse("a", "ab_4"), None);
        assert_eq!(ChunkKind::parse("a", "a_1_0"), None);
        assert_eq!(ChunkKind::parse("a_1", "a_1_0"), Some(ChunkKind::Data(0)));
        assert_eq!(
            ChunkKind::parse("a", "a_checkpoint_12"),
            Some(ChunkKind::Checkpoint(12))
        );
        assert_eq!(ChunkKind::parse("a", "a_checkpoint_x"), None);
    }

    #[test]
    fn test_ten_mib_payload_makes_ten_chunks() {
        let payload = Bytes::from(vec![7u8; 10 * MIB]);
        let chunks = split("big", &payload, MIB).unwrap();
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.size == MIB));
    }

    #[test]
    fn test_tampered_chunk_is_detected() {
        let payload = Bytes::from((0..10 * MIB).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        let mut chunks = split("big", &payload, MIB).unwrap();

        let mut tampered = chunks[3].data.to_vec();
        tampered[0] ^= 0xff;
        chunks[3].data = Bytes::from(tampered);

        let err = reassemble(&chunks, 10).unwrap_err();
        assert!(matches!(err, SwarmError::HashMismatch { ref chunk_id } if chunk_id == "big_3"));
    }

    #[test]
    fn test_reassemble_reports_missing() {
        let payload = Bytes::from_static(b"abcdefghij");
        let mut chunks = split("r", &payload, 3).unwrap();
        chunks.remove(1);
        let err = reassemble(&chunks, 4).unwrap_err();
        assert!(matches!(err, SwarmError::MissingChunks { ref missing } if missing == &vec![1]));
    }

    #[test]
    fn test_reassemble_ignores_out_of_band_chunks() {
        let payload = Bytes::from_static(b"hello world");
        let mut chunks = split("r", &payload, 4).unwrap();
        chunks.push(Chunk::new(
            "r",
            ChunkKind::Checkpoint(1),
            Bytes::from_static(b"{}"),
        ));
        assert_eq!(reassemble(&chunks, 3).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload_and_zero_chunk_size() {
        assert!(split("r", &Bytes::new(), 16).unwrap().is_empty());
        assert!(matches!(
            split("r", &Bytes::from_static(b"x"), 0),
            Err(SwarmError::InvalidChunkSize(0))
        ));
    }

    #[test]
    fn test_chunk_count_rejects_index_overflow() {
        assert_eq!(chunk_count(2500, 1000).unwrap(), 3);
        assert_eq!(chunk_count(0, 1000).unwrap(), 0);
        assert!(matches!(chunk_count(10, 0), Err(SwarmError::InvalidChunkSize(0))));

        let too_many = u32::MAX as usize + 1;
        assert!(matches!(
            chunk_count(too_many, 1),
            Err(SwarmError::TooManyChunks { chunk_size: 1, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_split_reassemble_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk_size in 1usize..512,
        ) {
            let payload = Bytes::from(payload);
            let chunks = split("prop", &payload, chunk_size).unwrap();
            let total = chunk_count(payload.len(), chunk_size).unwrap();

            prop_assert_eq!(chunks.len() as u32, total);
            prop_assert_eq!(chunks.iter().map(|c| c.size).sum::<usize>(), payload.len());
            prop_assert_eq!(reassemble(&chunks, total).unwrap(), payload);
        }

        #[test]
        fn prop_chunk_ids_cover_range_once(len in 0usize..2048, chunk_size in 1usize..128) {
            let payload = Bytes::from(vec![1u8; len]);
            let chunks = split("ids", &payload, chunk_size).unwrap();
            let ids: HashSet<_> = chunks.iter().map(|c| c.id.clone()).collect();
            prop_assert_eq!(ids.len(), chunks.len());
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.kind, ChunkKind::Data(i as u32));
            }
        }
    }
}
