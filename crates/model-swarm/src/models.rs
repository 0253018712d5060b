//! Model repository seam.
//!
//! Open-source models are downloaded and staged on disk by an external
//! repository service. Pools can be seeded from a staged model; the swarm
//! only needs to know whether a model is staged, its catalog metadata and
//! where its files live.
//!
//! Staged layout:
//!
//! ```text
//! <models_dir>/<model_id>/model.bin        required, marks the model as staged
//! <models_dir>/<model_id>/config.json      optional architecture
//! <models_dir>/<model_id>/tokenizer.json   optional tokenizer
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::SwarmResult;

const WEIGHTS_FILE: &str = "model.bin";
const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Minimum hardware to train a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequirements {
    pub min_cpu_cores: u32,
    pub min_gpu_memory: u64,
    pub min_ram_gb: u32,
}

/// Catalog entry for an open-source model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: String,
    pub name: String,
    /// huggingface, pytorch, tensorflow
    pub source: String,
    /// llm, vision, audio, multimodal
    pub model_type: String,
    pub size_mb: u64,
    /// e.g. "7B"
    pub parameters: String,
    pub license: String,
    pub description: String,
    pub requirements: ModelRequirements,
}

/// Read access to staged models.
#[async_trait]
pub trait ModelRepository: Send + Sync + 'static {
    /// Whether the model's weights are on local disk.
    async fn is_staged(&self, model_id: &str) -> bool;

    async fn get_metadata(&self, model_id: &str) -> Option<ModelMetadata>;

    /// Directory holding the staged model, if staged.
    async fn local_path(&self, model_id: &str) -> Option<PathBuf>;
}

/// File-system repository over a models directory and an in-memory catalog.
#[derive(Debug, Clone)]
pub struct FsModelRepository {
    models_dir: PathBuf,
    catalog: HashMap<String, ModelMetadata>,
}

impl FsModelRepository {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            catalog: HashMap::new(),
        }
    }

    /// Add a catalog entry.
    #[must_use]
    pub fn with_model(mut self, metadata: ModelMetadata) -> Self {
        self.catalog.insert(metadata.id.clone(), metadata);
        self
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Ids of every staged model directory, sorted.
    pub async fn list_staged(&self) -> Vec<String> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.models_dir).await else {
            return Vec::new();
        };
        let mut staged = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(id) = entry.file_name().to_str() {
                if self.is_staged(id).await {
                    staged.push(id.to_string());
                }
            }
        }
        staged.sort();
        staged
    }
}

#[async_trait]
impl ModelRepository for FsModelRepository {
    async fn is_staged(&self, model_id: &str) -> bool {
        tokio::fs::try_exists(self.models_dir.join(model_id).join(WEIGHTS_FILE))
            .await
            .unwrap_or(false)
    }

    async fn get_metadata(&self, model_id: &str) -> Option<ModelMetadata> {
        self.catalog.get(model_id).cloned()
    }

    async fn local_path(&self, model_id: &str) -> Option<PathBuf> {
        if self.is_staged(model_id).await {
            Some(self.models_dir.join(model_id))
        } else {
            None
        }
    }
}

/// What a pool is seeded with from a staged model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceModel {
    pub name: String,
    pub model_type: String,
    pub parameters: String,
    pub size_mb: u64,
    /// Parsed `config.json`, or an empty object
    pub architecture: serde_json::Value,
    /// Parsed `tokenizer.json`, if present
    pub tokenizer: Option<serde_json::Value>,
    /// Reference to the binary weights
    pub weights: String,
}

/// Read a JSON side file. Missing or malformed files yield `None`.
async fn read_optional_json(path: &Path) -> SwarmResult<Option<serde_json::Value>> {
    match tokio::fs::read(path).await {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed model side file");
                Ok(None)
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Model side file not present");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Load the seed data for a staged model at `model_path`.
pub async fn load_source_model(
    model_path: &Path,
    metadata: &ModelMetadata,
) -> SwarmResult<SourceModel> {
    let architecture = read_optional_json(&model_path.join(CONFIG_FILE))
        .await?
        .unwrap_or_else(|| serde_json::json!({}));
    let tokenizer = read_optional_json(&model_path.join(TOKENIZER_FILE)).await?;

    Ok(SourceModel {
        name: metadata.name.clone(),
        model_type: metadata.model_type.clone(),
        parameters: metadata.parameters.clone(),
        size_mb: metadata.size_mb,
        architecture,
        tokenizer,
        weights: format!(
            "Binary weights from {}",
            model_path.join(WEIGHTS_FILE).display()
        ),
    })
}
