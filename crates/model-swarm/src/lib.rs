//! Stellarium AI model swarm
//!
//! Peer-to-peer distribution of AI models and coordination of the pools that
//! train them:
//!
//! - **Chunked distribution**: model payloads are split into hashed chunks and
//!   shared between participants as torrents with magnet-style locators
//! - **Training tasks**: batches are sized against each participant's
//!   committed resources and executed on their node
//! - **Checkpoints**: versioned snapshots travel through the swarm so nodes
//!   that were offline can catch up
//! - **Pool scaling**: under-populated pools raise their rewards
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        NetworkCoordinator                            │
//! │   pools ─ fan-out updates ─ reconnection sync ─ auto-scale ─ stats   │
//! ├──────────────┬───────────────────────┬───────────────────────────────┤
//! │  PoolStore   │    ModelRepository    │     broadcast<NetworkEvent>   │
//! └──────────────┴───────────┬───────────┴───────────────────────────────┘
//!                            │ one per participant
//!        ┌───────────────────┼────────────────────┐
//!        ▼                   ▼                    ▼
//!   ┌─────────┐         ┌─────────┐          ┌─────────┐
//!   │ Node A  │◄───────►│ Node B  │◄────────►│ Node C  │   ChunkTransport
//!   │ chunks  │  fetch  │ chunks  │   push   │ chunks  │   ComputeExecutor
//!   │ peers   │         │ peers   │          │ peers   │
//!   └─────────┘         └─────────┘          └─────────┘
//! ```
//!
//! Transport and compute are seams: [`MemoryTransport`] and
//! [`SimulatedExecutor`] run an entire swarm in one process.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod node;
pub mod peers;
pub mod storage;
pub mod torrent;
pub mod training;
pub mod transport;

pub use checkpoint::{Checkpoint, TrainingMetrics};
pub use chunk::{Chunk, ChunkKind};
pub use config::{CoordinatorConfig, NodeConfig, SwarmConfig};
pub use coordinator::{
    FanOutFailure, FanOutReport, NetworkCoordinator, NetworkStats, PoolDescriptor,
    ScalingDecision, SyncOutcome,
};
pub use error::{StorageError, SwarmError, SwarmResult, TransportError};
pub use events::NetworkEvent;
pub use models::{FsModelRepository, ModelMetadata, ModelRepository, ModelRequirements};
pub use node::{Node, NodeStats};
pub use peers::{PeerDirectory, PeerInfo};
pub use storage::{MemoryStore, PoolRecord, PoolStatus, PoolStore};
pub use torrent::{Locator, Torrent};
pub use training::{
    ComputeExecutor, ComputeTier, ModelSize, ResourceCapacity, ResourceRequirement,
    SimulatedExecutor, TaskControl, TaskState, TrainingBatch, TrainingTask,
};
pub use transport::{ChunkHandler, ChunkTransport, MemoryTransport, SimulatedTransport};
