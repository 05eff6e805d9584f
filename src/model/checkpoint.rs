/*!
 * Adapter checkpoints on disk.
 *
 * A checkpoint directory holds `adapter_config.json` and the adapter
 * variables as `adapter_model.safetensors`, next to the tokenizer and, for
 * training checkpoints, the trainer and optimizer state.
 */

use candle_core::{Device, Tensor};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::errors::{ModelLoadError, TrainingError};

use super::lora::{AdapterSet, LORA_A_SUFFIX, LORA_B_SUFFIX};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdapterConfigFile {
    rank: usize,
    scaling_factor: f32,
    target_layers: Vec<String>,
    base_model_id: String,
    dropout_probability: f32,
    hidden_size: usize,
    #[serde(default)]
    training_step: usize,
    #[serde(default)]
    validation_loss: Option<f32>,
}

/// Trained adapter weights with the metadata needed to reattach them
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterCheckpoint {
    pub base_model_id: String,
    pub hidden_size: usize,
    pub adapter_weights: AdapterSet,
    pub training_step: usize,
    pub validation_loss: Option<f32>,
}

impl AdapterCheckpoint {
    pub fn new(
        base_model_id: &str,
        hidden_size: usize,
        adapter_weights: AdapterSet,
        training_step: usize,
        validation_loss: Option<f32>,
    ) -> Self {
        Self {
            base_model_id: base_model_id.to_string(),
            hidden_size,
            adapter_weights,
            training_step,
            validation_loss,
        }
    }

    pub fn rank(&self) -> usize {
        self.adapter_weights.rank
    }

    pub fn target_layers(&self) -> Vec<String> {
        self.adapter_weights.target_layers()
    }

    /// Whether `dir` looks like a checkpoint directory
    pub fn exists<P: AsRef<Path>>(dir: P) -> bool {
        let dir = dir.as_ref();
        dir.join(ADAPTER_CONFIG_FILE).is_file() && dir.join(ADAPTER_WEIGHTS_FILE).is_file()
    }

    /// Write the adapter config and weights
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<(), TrainingError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let config = AdapterConfigFile {
            rank: self.rank(),
            scaling_factor: self.adapter_weights.scaling_factor,
            target_layers: self.target_layers(),
            base_model_id: self.base_model_id.clone(),
            dropout_probability: self.adapter_weights.dropout_probability,
            hidden_size: self.hidden_size,
            training_step: self.training_step,
            validation_loss: self.validation_loss,
        };
        write_json(&dir.join(ADAPTER_CONFIG_FILE), &config)?;
        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        self.adapter_weights.save(&weights_path).map_err(|e| {
            TrainingError::Checkpoint(format!("failed to write {}: {}", weights_path.display(), e))
        })?;

        debug!("Saved adapter checkpoint (step {}) to {}", self.training_step, dir.display());
        Ok(())
    }

    /// Read a checkpoint written by `save`
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, ModelLoadError> {
        let dir = dir.as_ref();
        let config: AdapterConfigFile = read_json(&dir.join(ADAPTER_CONFIG_FILE))?;
        let factors = read_factors(&dir.join(ADAPTER_WEIGHTS_FILE))?;

        let stored: Vec<String> = factors.keys().cloned().collect();
        let mut declared = config.target_layers.clone();
        declared.sort();
        if stored != declared {
            return Err(ModelLoadError::Incompatible(format!(
                "adapter weights cover {:?} but the config declares {:?}",
                stored, config.target_layers
            )));
        }
        if config.rank == 0 {
            return Err(ModelLoadError::Incompatible("adapter rank is zero".to_string()));
        }
        for (name, (a, b)) in &factors {
            let (a_rows, _) = a.dims2()?;
            let (_, b_cols) = b.dims2()?;
            if a_rows != config.rank || b_cols != config.rank {
                return Err(ModelLoadError::Incompatible(format!(
                    "adapter '{}' does not have rank {}",
                    name, config.rank
                )));
            }
        }

        let adapter_weights = AdapterSet::from_tensors(
            config.rank,
            config.scaling_factor,
            config.dropout_probability,
            factors,
        )?;

        Ok(Self {
            base_model_id: config.base_model_id,
            hidden_size: config.hidden_size,
            adapter_weights,
            training_step: config.training_step,
            validation_loss: config.validation_loss,
        })
    }
}

/// Adapter factors by layer from a safetensors file
fn read_factors(path: &Path) -> Result<BTreeMap<String, (Tensor, Tensor)>, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::MissingArtifact(path.to_path_buf()));
    }
    let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| ModelLoadError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();
    for (name, tensor) in tensors {
        let Some((layer, suffix)) = name.rsplit_once('.') else {
            return Err(unexpected_tensor(path, &name));
        };
        let entry = halves.entry(layer.to_string()).or_default();
        match suffix {
            LORA_A_SUFFIX => entry.0 = Some(tensor),
            LORA_B_SUFFIX => entry.1 = Some(tensor),
            _ => return Err(unexpected_tensor(path, &name)),
        }
    }

    halves
        .into_iter()
        .map(|(layer, pair)| match pair {
            (Some(a), Some(b)) => Ok((layer, (a, b))),
            _ => Err(ModelLoadError::Incompatible(format!(
                "adapter '{}' is missing one of its factors",
                layer
            ))),
        })
        .collect()
}

fn unexpected_tensor(path: &Path, name: &str) -> ModelLoadError {
    ModelLoadError::Parse {
        path: path.to_path_buf(),
        message: format!("unexpected tensor '{}'", name),
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let json = serde_json::to_string(value)
        .map_err(|e| TrainingError::Checkpoint(format!("failed to serialize {}: {}", path.display(), e)))?;
    fs::write(path, json)
        .map_err(|e| TrainingError::Checkpoint(format!("failed to write {}: {}", path.display(), e)))
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::MissingArtifact(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| ModelLoadError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
