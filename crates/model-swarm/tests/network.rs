//! End-to-end swarm scenarios over the in-memory transport and store.

use std::sync::Arc;
use std::time::Duration;

use stellarium_model_swarm::{
    ComputeTier, CoordinatorConfig, FsModelRepository, MemoryStore, MemoryTransport,
    ModelMetadata, ModelRequirements, NetworkCoordinator, NetworkEvent, NodeConfig,
    PoolDescriptor, PoolRecord, PoolStatus, PoolStore, ResourceCapacity, SimulatedExecutor,
    SwarmConfig, SwarmError,
};
use tempfile::TempDir;

const POOL: &str = "pool-1";

fn config() -> SwarmConfig {
    SwarmConfig {
        node: NodeConfig {
            chunk_size: 64,
            request_timeout: Duration::from_secs(1),
            max_fetch_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            max_retry_backoff: Duration::from_millis(2),
            ..NodeConfig::default()
        },
        coordinator: CoordinatorConfig::default(),
    }
}

fn coordinator(store: Arc<MemoryStore>, models: FsModelRepository) -> NetworkCoordinator {
    NetworkCoordinator::new(
        config(),
        store,
        Arc::new(models),
        Arc::new(MemoryTransport::new()),
        Arc::new(SimulatedExecutor::new(0.0)),
    )
}

fn no_models() -> FsModelRepository {
    FsModelRepository::new(std::env::temp_dir().join("stellarium-swarm-no-models"))
}

async fn seeded_pool() -> (NetworkCoordinator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store
        .create_pool(PoolRecord::new(POOL, "Pool One", "LLM"))
        .await
        .unwrap();
    let coordinator = coordinator(store.clone(), no_models());
    coordinator
        .create_pool(
            &PoolDescriptor {
                id: POOL.to_string(),
                name: "Pool One".to_string(),
                model_type: "LLM".to_string(),
            },
            "0xa",
        )
        .await
        .unwrap();
    (coordinator, store)
}

fn model_data(version: u64) -> serde_json::Value {
    serde_json::json!({
        "weights": vec![version as f64; 32],
        "trainingMetrics": { "loss": 1.0 / version as f64, "accuracy": 0.5, "epochs": version },
    })
}

#[tokio::test]
async fn test_joiner_downloads_every_chunk() {
    let (coordinator, _) = seeded_pool().await;
    let a = coordinator.node("0xa").unwrap();

    coordinator
        .join_pool_with_contribution(POOL, "0xb", ResourceCapacity::default())
        .await
        .unwrap();
    let b = coordinator.node("0xb").unwrap();

    let torrent = coordinator.torrent_info(POOL).unwrap();
    assert!(torrent.total_chunks > 1);
    assert_eq!(b.chunks_for(POOL).len(), a.chunks_for(POOL).len());
    assert!((b.download_progress(POOL).await - 100.0).abs() < f64::EPSILON);

    let b_torrent = b.torrent(POOL).await.unwrap();
    assert!(b_torrent.is_seeder(b.node_id()));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_update_reaches_every_holder() {
    let (coordinator, store) = seeded_pool().await;
    coordinator
        .join_pool_with_contribution(POOL, "0xb", ResourceCapacity::default())
        .await
        .unwrap();

    let report = coordinator.update_pool(POOL, model_data(1), 1).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.succeeded, vec!["0xa".to_string(), "0xb".to_string()]);

    for identity in ["0xa", "0xb"] {
        let node = coordinator.node(identity).unwrap();
        assert_eq!(node.model_version(POOL), 1);
    }

    let pool = store.get_pool(POOL).await.unwrap().unwrap();
    assert_eq!(pool.status, PoolStatus::Training);
    assert_eq!(pool.training_progress, 5);
    let latest = store.get_latest_checkpoint(POOL).await.unwrap().unwrap();
    assert_eq!(latest.version, 1);
    assert_eq!(latest.training_metrics.unwrap().epochs, 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_versions_never_go_backwards() {
    let (coordinator, store) = seeded_pool().await;
    coordinator.update_pool(POOL, model_data(2), 2).await.unwrap();

    for (version, data) in [(2, serde_json::json!({ "weights": [9.0] })), (1, model_data(1))] {
        let rejected = coordinator.update_pool(POOL, data, version).await;
        assert!(matches!(
            rejected,
            Err(SwarmError::StaleVersion { current: 2, .. })
        ));
    }

    let node = coordinator.node("0xa").unwrap();
    assert_eq!(node.model_version(POOL), 2);
    assert_eq!(coordinator.torrent_info(POOL).unwrap().version, 2);

    let latest = store.get_latest_checkpoint(POOL).await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.model_data, model_data(2));
    assert_eq!(store.get_pool(POOL).await.unwrap().unwrap().training_progress, 10);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_reconnection_converges_to_latest_checkpoint() {
    let (coordinator, _) = seeded_pool().await;
    coordinator
        .join_pool_with_contribution(POOL, "0xb", ResourceCapacity::default())
        .await
        .unwrap();
    for version in 1..=3 {
        coordinator
            .update_pool(POOL, model_data(version), version)
            .await
            .unwrap();
    }

    coordinator
        .join_pool_with_contribution(POOL, "0xlate", ResourceCapacity::default())
        .await
        .unwrap();
    let late = coordinator.node("0xlate").unwrap();
    assert_eq!(late.model_version(POOL), 0);

    let mut events = coordinator.subscribe();
    let outcomes = coordinator.handle_reconnection("0xlate").await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].converged());
    assert_eq!(outcomes[0].from_version, 0);
    assert_eq!(outcomes[0].synced_to, 3);
    assert_eq!(late.available_versions(POOL), vec![1, 2, 3]);

    let history = late.training_history(POOL);
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].1.epochs, 3);

    let mut synced = None;
    while let Ok(event) = events.try_recv() {
        if let NetworkEvent::NodeSynced { new_version, .. } = event {
            synced = Some(new_version);
        }
    }
    assert_eq!(synced, Some(3));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_sync_offline_node_is_a_no_op_when_current() {
    let (coordinator, _) = seeded_pool().await;
    coordinator.update_pool(POOL, model_data(1), 1).await.unwrap();

    let reached = coordinator.sync_offline_node("0xa").await.unwrap();
    assert_eq!(reached.get(POOL), Some(&1));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_auto_scale_only_raises_rewards() {
    let store = Arc::new(MemoryStore::new());
    let mut pool = PoolRecord::new(POOL, "Pool One", "LLM");
    pool.reward_per_hour = 1.0;
    store.create_pool(pool).await.unwrap();
    let coordinator = coordinator(store.clone(), no_models());

    let mut last = 1.0;
    for _ in 0..3 {
        let decision = coordinator
            .auto_scale(POOL, ComputeTier::Light)
            .await
            .unwrap()
            .unwrap();
        assert!(decision.reward_per_hour >= last);
        assert_eq!(decision.to, ComputeTier::Light.min_nodes());
        last = decision.reward_per_hour;
    }

    let mut full = PoolRecord::new("pool-full", "Full", "LLM");
    full.participant_count = 60;
    full.reward_per_hour = 3.0;
    store.create_pool(full).await.unwrap();
    let none = coordinator
        .auto_scale("pool-full", ComputeTier::Heavy)
        .await
        .unwrap();
    assert!(none.is_none());
    let unchanged = store.get_pool("pool-full").await.unwrap().unwrap();
    assert!((unchanged.reward_per_hour - 3.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_network_health_is_bounded() {
    let store = Arc::new(MemoryStore::new());
    let empty = coordinator(store, no_models());
    assert_eq!(empty.network_stats().await.network_health, 0);

    let (coordinator, _) = seeded_pool().await;
    for identity in ["0xb", "0xc", "0xd"] {
        coordinator.join_pool(POOL, identity).await.unwrap();
    }
    let stats = coordinator.network_stats().await;
    assert_eq!(stats.total_nodes, 4);
    assert_eq!(stats.total_torrents, 1);
    assert!(stats.total_chunks > 0);
    assert!(stats.network_health > 0);
    assert!(stats.network_health <= 100);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_pool_from_staged_model() {
    let dir = TempDir::new().unwrap();
    let model_dir = dir.path().join("tiny-llm");
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(model_dir.join("model.bin"), b"\x00\x01\x02\x03").unwrap();
    std::fs::write(model_dir.join("config.json"), br#"{"layers": 4, "hidden": 128}"#).unwrap();

    let metadata = ModelMetadata {
        id: "tiny-llm".to_string(),
        name: "Tiny LLM".to_string(),
        source: "huggingface".to_string(),
        model_type: "llm".to_string(),
        size_mb: 1,
        parameters: "1M".to_string(),
        license: "apache-2.0".to_string(),
        description: "A tiny test model".to_string(),
        requirements: ModelRequirements {
            min_cpu_cores: 2,
            min_gpu_memory: 0,
            min_ram_gb: 1,
        },
    };
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(
        store.clone(),
        FsModelRepository::new(dir.path()).with_model(metadata),
    );

    let (pool, torrent) = coordinator
        .create_pool_from_existing_model("tiny-llm", "0xa", serde_json::json!({ "rewardPerHour": 0.25 }))
        .await
        .unwrap();

    assert!(pool.id.starts_with("tiny-llm-training-"));
    assert_eq!(pool.name, "Tiny LLM Training Pool");
    assert_eq!(pool.source_model_id.as_deref(), Some("tiny-llm"));
    assert_eq!(pool.min_cpu_cores, 2);
    assert!(pool.reward_per_hour >= 0.25);
    assert_eq!(torrent.resource_id, pool.id);
    assert_eq!(torrent.version, 1);

    let node = coordinator.node("0xa").unwrap();
    assert_eq!(node.model_version(&pool.id), 1);
    let checkpoint = store.get_latest_checkpoint(&pool.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.model_data["architecture"]["layers"], 4);

    coordinator.shutdown().await;
}
