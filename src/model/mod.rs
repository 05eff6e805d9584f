/*!
 * Base translation model and its low-rank adapters.
 *
 * The pretrained encoder-decoder is reached through the `BaseModel` trait:
 * encode a source sequence, score the next token of a target prefix, and
 * compute the shifted next-token loss with gradients for injected adapters.
 * The base weights are frozen; only `AdapterSet` parameters are trained.
 *
 * - `tokenizer`: vocabulary with language tokens
 * - `lora`: adapter variables and gradient accumulation
 * - `reference`: the bundled deterministic encoder-decoder on candle
 * - `checkpoint`: adapter checkpoint persistence
 */

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::app_config::ModelConfig;
use crate::errors::ModelLoadError;

pub mod checkpoint;
pub mod lora;
pub mod reference;
pub mod tokenizer;

pub use checkpoint::AdapterCheckpoint;
pub use lora::{AdapterGradients, AdapterSet, LoraWeights};
pub use reference::ReferenceModel;
pub use tokenizer::Tokenizer;

/// Projection layers that accept adapters
pub const PROJECTION_LAYERS: [&str; 6] = ["q_proj", "k_proj", "v_proj", "o_proj", "fc1", "fc2"];

/// A frozen weight matrix of the base model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGroup {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub trainable: bool,
}

/// Encoder hidden states of one source sequence
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Model-specific hidden states consumed by `decode_step`
    pub states: Vec<Tensor>,
    /// Sentence-level representation, `(hidden_size,)`
    pub pooled: Tensor,
}

/// One shifted next-token training example
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    /// `[source language, pieces..., </s>]`
    pub source_ids: Vec<u32>,
    /// `[decoder start, target language, pieces...]`
    pub decoder_input: Vec<u32>,
    /// `[target language, pieces..., </s>]`
    pub labels: Vec<u32>,
}

impl TrainingExample {
    /// Tokens held in memory during a step
    pub fn sequence_len(&self) -> usize {
        self.source_ids.len() + self.decoder_input.len()
    }
}

/// Summed token loss
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossOutput {
    pub loss_sum: f32,
    pub tokens: usize,
}

impl LossOutput {
    pub fn mean(&self) -> f32 {
        if self.tokens == 0 {
            0.0
        } else {
            self.loss_sum / self.tokens as f32
        }
    }

    pub fn add(&mut self, other: LossOutput) {
        self.loss_sum += other.loss_sum;
        self.tokens += other.tokens;
    }
}

/// Settings for one training forward/backward pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOptions {
    /// Seed for this example's dropout masks
    pub dropout_seed: u64,
    /// Multiplier of the summed token loss before `backward`
    pub gradient_scale: f32,
    /// Round activations through bf16
    pub mixed_precision: bool,
    /// Run one backward pass per target position, recomputing the encoder each time
    pub gradient_checkpointing: bool,
}

/// Frozen encoder-decoder with projections that accept adapters
pub trait BaseModel: Send + Sync {
    fn model_id(&self) -> &str;

    fn hidden_size(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Device holding the weights; adapters are created on it
    fn device(&self) -> &Device;

    /// Frozen projection matrices, by layer name
    fn parameter_groups(&self) -> Vec<ParameterGroup>;

    /// Encode a source sequence
    fn encode(&self, source_ids: &[u32], adapters: Option<&AdapterSet>) -> candle_core::Result<EncoderOutput>;

    /// Next-token logits after `prefix` (which starts with the decoder start token)
    fn decode_step(
        &self,
        encoded: &EncoderOutput,
        prefix: &[u32],
        adapters: Option<&AdapterSet>,
    ) -> candle_core::Result<Vec<f32>>;

    /// Shifted next-token loss without dropout
    fn forward(&self, example: &TrainingExample, adapters: Option<&AdapterSet>) -> candle_core::Result<LossOutput>;

    /// Shifted next-token loss; `backward` gradients of the adapters go into `gradients`
    fn forward_backward(
        &self,
        example: &TrainingExample,
        adapters: &AdapterSet,
        options: &StepOptions,
        gradients: &mut AdapterGradients,
    ) -> candle_core::Result<LossOutput>;

    /// Floats held per sequence position during a training step
    fn activation_floats_per_token(&self, gradient_checkpointing: bool) -> usize;
}

/// Stable 64-bit seed from string parts
pub fn derive_seed(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Instantiate the configured base model over a vocabulary
pub fn load_base_model(config: &ModelConfig, tokenizer: &Tokenizer) -> Result<Arc<dyn BaseModel>, ModelLoadError> {
    let model = ReferenceModel::new(
        &config.model_name,
        config.hidden_size,
        tokenizer.pieces(),
        &Device::Cpu,
    )?;
    Ok(Arc::new(model))
}
