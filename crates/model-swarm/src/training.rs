//! Training tasks and the compute seam.
//!
//! The coordinator sizes a [`TrainingBatch`] into a [`ResourceRequirement`],
//! wraps both into a [`TrainingTask`], and hands it to each qualifying node.
//! The node runs it through a [`ComputeExecutor`], forwarding progress ticks
//! and honouring [`TaskControl`] messages on a watch channel.
//!
//! ```text
//!   Allocated ──▶ Running(0..=100) ──▶ Completed
//!                   │    ▲      │
//!             Pause │    │ Run  └────▶ Failed(Cancelled | Compute)
//!                   ▼    │              ▲
//!                  Paused ──── Stop ────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::trace;
use uuid::Uuid;

const DEFAULT_SAMPLES: u64 = 1000;

/// Model complexity class of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Small,
    #[default]
    Medium,
    Large,
}

/// Describes a slice of training work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingBatch {
    pub id: String,
    #[serde(default = "default_samples")]
    pub samples: u64,
    #[serde(default)]
    pub model_size: ModelSize,
}

fn default_samples() -> u64 {
    DEFAULT_SAMPLES
}

impl TrainingBatch {
    #[must_use]
    pub fn new(id: impl Into<String>, samples: u64, model_size: ModelSize) -> Self {
        Self {
            id: id.into(),
            samples,
            model_size,
        }
    }
}

impl Default for TrainingBatch {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            samples: DEFAULT_SAMPLES,
            model_size: ModelSize::default(),
        }
    }
}

/// Resources a task needs from a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub cpu_cores: u32,
    pub gpu_memory_mb: u64,
    pub ram_gb: u32,
    pub estimated_duration_secs: f64,
}

impl ResourceRequirement {
    /// Size a batch.
    ///
    /// | size   | cpu cores              | gpu MB | ram GB |
    /// |--------|------------------------|--------|--------|
    /// | small  | ceil(samples/1000) * 2 | 1024   | 2      |
    /// | medium | ceil(samples/500) * 4  | 4096   | 8      |
    /// | large  | ceil(samples/200) * 8  | 8192   | 16     |
    ///
    /// Duration is `samples / 100` seconds.
    #[must_use]
    pub fn for_batch(batch: &TrainingBatch) -> Self {
        let samples = batch.samples;
        let (cpu_cores, gpu_memory_mb, ram_gb) = match batch.model_size {
            ModelSize::Small => (samples.div_ceil(1000) * 2, 1024, 2),
            ModelSize::Medium => (samples.div_ceil(500) * 4, 4096, 8),
            ModelSize::Large => (samples.div_ceil(200) * 8, 8192, 16),
        };
        Self {
            cpu_cores: u32::try_from(cpu_cores).unwrap_or(u32::MAX),
            gpu_memory_mb,
            ram_gb,
            estimated_duration_secs: samples as f64 / 100.0,
        }
    }

    #[must_use]
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs_f64(self.estimated_duration_secs.max(0.0))
    }
}

/// Resources a node has available for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub cpu_cores: u32,
    pub gpu_memory_mb: u64,
    pub ram_gb: u32,
}

impl ResourceCapacity {
    /// Whether every dimension meets `requirement`.
    #[must_use]
    pub fn satisfies(&self, requirement: &ResourceRequirement) -> bool {
        self.cpu_cores >= requirement.cpu_cores
            && self.gpu_memory_mb >= requirement.gpu_memory_mb
            && self.ram_gb >= requirement.ram_gb
    }
}

impl Default for ResourceCapacity {
    fn default() -> Self {
        Self {
            cpu_cores: 8,
            gpu_memory_mb: 4096,
            ram_gb: 16,
        }
    }
}

/// Compute intensity of a pool, used by auto-scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeTier {
    Light,
    #[default]
    Medium,
    Heavy,
}

impl ComputeTier {
    /// Participant floor below which the pool is scaled up.
    #[must_use]
    pub fn min_nodes(self) -> u32 {
        match self {
            Self::Light => 5,
            Self::Medium => 15,
            Self::Heavy => 50,
        }
    }

    /// Reward multiplier applied when scaling up.
    #[must_use]
    pub fn reward_multiplier(self) -> f64 {
        match self {
            Self::Light => 1.2,
            Self::Medium => 1.5,
            Self::Heavy => 2.0,
        }
    }

    /// Read `computeRequirement` from a model payload, defaulting to medium.
    #[must_use]
    pub fn from_model_data(model_data: &serde_json::Value) -> Self {
        model_data
            .get("computeRequirement")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// Work allocated to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingTask {
    pub task_id: Uuid,
    pub resource_id: String,
    pub batch: TrainingBatch,
    pub requirement: ResourceRequirement,
}

impl TrainingTask {
    /// Build a task, sizing the batch.
    #[must_use]
    pub fn new(resource_id: impl Into<String>, batch: TrainingBatch) -> Self {
        let requirement = ResourceRequirement::for_batch(&batch);
        Self {
            task_id: Uuid::new_v4(),
            resource_id: resource_id.into(),
            batch,
            requirement,
        }
    }
}

/// Output of a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub gradients: Vec<f64>,
    pub loss: f64,
    pub accuracy: f64,
    pub samples_processed: u64,
    pub compute_duration_ms: u64,
    /// Local model version the task ran against
    pub produced_at_version: u64,
    pub produced_at: DateTime<Utc>,
}

/// Host utilization reported with each progress tick (percent).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub gpu: f64,
    pub memory: f64,
}

/// One progress report from an executor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressTick {
    /// 0..=100
    pub progress: u8,
    pub usage: ResourceUsage,
}

/// Control messages for a running task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskControl {
    #[default]
    Run,
    Pause,
    Stop,
}

/// Node-side lifecycle of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    Allocated,
    Running { progress: u8 },
    Paused { progress: u8 },
    Completed,
    Failed { reason: String },
}

impl TaskState {
    /// Whether the task has finished, successfully or not.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

/// Why a task did not produce a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("Training cancelled")]
    Cancelled,

    #[error("Compute failed: {0}")]
    Compute(String),
}

/// Runs training tasks.
#[async_trait]
pub trait ComputeExecutor: Send + Sync + 'static {
    /// Run `task` against local model version `base_version`.
    ///
    /// Implementations report progress 0 through 100 on `progress`, pause
    /// while `control` reads [`TaskControl::Pause`] and return
    /// [`TaskFailure::Cancelled`] once it reads [`TaskControl::Stop`].
    async fn execute(
        &self,
        task: &TrainingTask,
        base_version: u64,
        progress: mpsc::UnboundedSender<ProgressTick>,
        control: watch::Receiver<TaskControl>,
    ) -> Result<TrainingResult, TaskFailure>;
}

/// Placeholder executor: ten timed ticks and random metrics.
///
/// Each tick sleeps `estimated_duration / 10 * time_scale`. A scale of 0 runs
/// instantly.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    time_scale: f64,
}

impl SimulatedExecutor {
    #[must_use]
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale: time_scale.max(0.0),
        }
    }

    /// Block while paused. Errors once stopped.
    async fn wait_while_paused(
        control: &mut watch::Receiver<TaskControl>,
    ) -> Result<(), TaskFailure> {
        loop {
            match *control.borrow_and_update() {
                TaskControl::Run => return Ok(()),
                TaskControl::Stop => return Err(TaskFailure::Cancelled),
                TaskControl::Pause => {}
            }
            if control.changed().await.is_err() {
                // Nobody left to resume us
                return Err(TaskFailure::Cancelled);
            }
        }
    }

    /// Resolve once the control reads Stop. Never resolves if the sender is gone.
    async fn stopped(control: &mut watch::Receiver<TaskControl>) {
        loop {
            if *control.borrow_and_update() == TaskControl::Stop {
                return;
            }
            if control.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn usage() -> ResourceUsage {
        let mut rng = rand::thread_rng();
        ResourceUsage {
            cpu: rng.gen_range(20.0..100.0),
            gpu: rng.gen_range(10.0..100.0),
            memory: rng.gen_range(30.0..100.0),
        }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl ComputeExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        task: &TrainingTask,
        base_version: u64,
        progress: mpsc::UnboundedSender<ProgressTick>,
        mut control: watch::Receiver<TaskControl>,
    ) -> Result<TrainingResult, TaskFailure> {
        let nominal = task.requirement.estimated_duration();
        let tick = nominal.div_f64(10.0).mul_f64(self.time_scale);

        for step in 0..=10u8 {
            tokio::select! {
                () = tokio::time::sleep(tick) => {}
                () = Self::stopped(&mut control) => return Err(TaskFailure::Cancelled),
            }
            Self::wait_while_paused(&mut control).await?;

            let update = ProgressTick {
                progress: step * 10,
                usage: Self::usage(),
            };
            if progress.send(update).is_err() {
                trace!(task_id = %task.task_id, step, "Progress receiver dropped");
            }
        }

        let mut rng = rand::thread_rng();
        let gradient_len = (task.requirement.gpu_memory_mb / 100) as usize;
        Ok(TrainingResult {
            gradients: (0..gradient_len).map(|_| rng.r#gen::<f64>()).collect(),
            loss: rng.gen_range(0.1..0.6),
            accuracy: rng.gen_range(0.7..1.0),
            samples_processed: task.batch.samples,
            compute_duration_ms: u64::try_from(nominal.as_millis()).unwrap_or(u64::MAX),
            produced_at_version: base_version,
            produced_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_fixture_table() {
        let cases = [
            (ModelSize::Small, 1000, 2, 1024, 2, 10.0),
            (ModelSize::Small, 1001, 4, 1024, 2, 10.01),
            (ModelSize::Medium, 1000, 8, 4096, 8, 10.0),
            (ModelSize::Medium, 250, 4, 4096, 8, 2.5),
            (ModelSize::Large, 1000, 40, 8192, 16, 10.0),
            (ModelSize::Large, 200, 8, 8192, 16, 2.0),
        ];
        for (size, samples, cpu, gpu, ram, secs) in cases {
            let req = ResourceRequirement::for_batch(&TrainingBatch::new("b", samples, size));
            assert_eq!(req.cpu_cores, cpu, "{size:?}/{samples}");
            assert_eq!(req.gpu_memory_mb, gpu);
            assert_eq!(req.ram_gb, ram);
            assert!((req.estimated_duration_secs - secs).abs() < 1e-9);
        }
    }

    #[test]
    fn test_batch_defaults() {
        let batch: TrainingBatch = serde_json::from_str(r#"{"id":"b1"}"#).unwrap();
        assert_eq!(batch.samples, 1000);
        assert_eq!(batch.model_size, ModelSize::Medium);
        assert_eq!(ResourceRequirement::for_batch(&batch).cpu_cores, 8);
    }

    #[test]
    fn test_capacity_satisfies() {
        let req = ResourceRequirement::for_batch(&TrainingBatch::new("b", 1000, ModelSize::Medium));
        let capacity = ResourceCapacity {
            cpu_cores: 8,
            gpu_memory_mb: 4096,
            ram_gb: 8,
        };
        assert!(capacity.satisfies(&req));
        assert!(!ResourceCapacity { ram_gb: 7, ..capacity }.satisfies(&req));
    }

    #[test]
    fn test_compute_tier_from_model_data() {
        use serde_json::json;
        assert_eq!(
            ComputeTier::from_model_data(&json!({"computeRequirement": "heavy"})),
            ComputeTier::Heavy
        );
        assert_eq!(ComputeTier::from_model_data(&json!({})), ComputeTier::Medium);
        assert_eq!(
            ComputeTier::from_model_data(&json!({"computeRequirement": "extreme"})),
            ComputeTier::Medium
        );
        assert_eq!(ComputeTier::Light.min_nodes(), 5);
        assert_eq!(ComputeTier::Heavy.reward_multiplier(), 2.0);
    }

    #[tokio::test]
    async fn test_simulated_executor_reports_eleven_ticks() {
        let task = TrainingTask::new("pool", TrainingBatch::new("b", 1000, ModelSize::Medium));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_control_tx, control_rx) = watch::channel(TaskControl::Run);

        let result = SimulatedExecutor::new(0.0)
            .execute(&task, 3, tx, control_rx)
            .await
            .unwrap();

        let mut ticks = Vec::new();
        while let Ok(tick) = rx.try_recv() {
            ticks.push(tick.progress);
        }
        assert_eq!(ticks, (0..=10).map(|i| i * 10).collect::<Vec<u8>>());
        assert_eq!(result.gradients.len(), 40);
        assert_eq!(result.produced_at_version, 3);
        assert!((0.1..0.6).contains(&result.loss));
        assert!((0.7..1.0).contains(&result.accuracy));
    }

    #[tokio::test]
    async fn test_simulated_executor_stops() {
        let task = TrainingTask::new("pool", TrainingBatch::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = watch::channel(TaskControl::Stop);

        let result = SimulatedExecutor::new(0.0)
            .execute(&task, 0, tx, control_rx)
            .await;
        assert_eq!(result, Err(TaskFailure::Cancelled));
        drop(control_tx);
    }

    #[tokio::test]
    async fn test_simulated_executor_outlives_progress_listener() {
        let task = TrainingTask::new("pool", TrainingBatch::default());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (_control_tx, control_rx) = watch::channel(TaskControl::Run);

        let result = SimulatedExecutor::new(0.0)
            .execute(&task, 0, tx, control_rx)
            .await
            .unwrap();
        assert_eq!(result.samples_processed, task.batch.samples);
    }

    #[tokio::test]
    async fn test_simulated_executor_pause_and_resume() {
        let task = TrainingTask::new("pool", TrainingBatch::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = watch::channel(TaskControl::Pause);

        let handle = tokio::spawn(async move {
            SimulatedExecutor::new(0.0)
                .execute(&task, 0, tx, control_rx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "paused task must not advance");

        control_tx.send(TaskControl::Run).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
