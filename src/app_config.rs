use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::default::Default;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::dataset::augment::{default_templates, ContextTemplate};
use crate::dataset::pairs::PairMode;
use crate::dataset::splitter::SplitRatios;
use crate::language_utils::IdiomLanguage;
use crate::model::PROJECTION_LAYERS;

/// Application configuration module
/// This module handles the application configuration including loading,
/// validating and saving configuration settings.
/// Represents the application configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Base model settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Low-rank adapter settings
    #[serde(default)]
    pub lora: LoraConfig,

    /// Training hyperparameters
    #[serde(default)]
    pub training: TrainingConfig,

    /// Dataset construction settings
    #[serde(default)]
    pub data: DataConfig,

    /// Decoding settings
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Base translation model configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    /// Identifier of the frozen base model
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Maximum tokens per encoded sequence
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Hidden size of the reference model
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            max_length: default_max_length(),
            hidden_size: default_hidden_size(),
        }
    }
}

/// Low-rank adapter configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoraConfig {
    /// Adapter rank (capacity)
    #[serde(default = "default_lora_rank")]
    pub r: usize,

    /// Scaling factor; the adapter delta is multiplied by `lora_alpha / r`
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f32,

    /// Dropout probability applied to adapter inputs during training
    #[serde(default = "default_lora_dropout")]
    pub lora_dropout: f32,

    /// Projection layers that receive adapters
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
}

impl LoraConfig {
    /// Effective multiplier applied to the adapter output
    pub fn scaling(&self) -> f32 {
        self.lora_alpha / self.r as f32
    }
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: default_lora_rank(),
            lora_alpha: default_lora_alpha(),
            lora_dropout: default_lora_dropout(),
            target_modules: default_target_modules(),
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TrainingConfig {
    /// Directory that receives checkpoints
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Micro-batch size per optimizer step
    #[serde(default = "default_train_batch_size")]
    pub per_device_train_batch_size: usize,

    /// Batch size for validation loss evaluation
    #[serde(default = "default_eval_batch_size")]
    pub per_device_eval_batch_size: usize,

    /// Micro-batches accumulated before each optimizer step
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,

    /// Peak learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Linear warmup length in optimizer steps
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,

    /// Decoupled weight decay
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,

    /// Number of passes over the training split
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: usize,

    /// Hard cap on optimizer steps; overrides the epoch count when set
    #[serde(default)]
    pub max_steps: Option<usize>,

    /// Global gradient norm clip
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f32,

    /// Reduced-precision activations
    #[serde(default = "default_true", alias = "fp16")]
    pub use_mixed_precision: bool,

    /// Recompute activations during the backward pass
    #[serde(default = "default_true", alias = "gradient_checkpointing")]
    pub use_gradient_checkpointing: bool,

    /// Evaluate every N optimizer steps instead of once per epoch
    #[serde(default)]
    pub eval_steps: Option<usize>,

    /// Maximum number of step checkpoints kept on disk
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: usize,

    /// Seed for shuffling, initialization and dropout
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Evaluations without improvement before stopping
    #[serde(default = "default_early_stopping_patience")]
    pub early_stopping_patience: usize,

    /// Minimum validation loss improvement
    #[serde(default)]
    pub early_stopping_threshold: f32,

    /// Activation memory budget per micro-batch (None = unlimited)
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    /// Show per-epoch progress bars
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

impl TrainingConfig {
    /// Examples contributing to one optimizer step
    pub fn effective_batch_size(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            per_device_train_batch_size: default_train_batch_size(),
            per_device_eval_batch_size: default_eval_batch_size(),
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
            learning_rate: default_learning_rate(),
            warmup_steps: default_warmup_steps(),
            weight_decay: default_weight_decay(),
            num_train_epochs: default_num_train_epochs(),
            max_steps: None,
            max_grad_norm: default_max_grad_norm(),
            use_mixed_precision: true,
            use_gradient_checkpointing: true,
            eval_steps: None,
            save_total_limit: default_save_total_limit(),
            seed: default_seed(),
            early_stopping_patience: default_early_stopping_patience(),
            early_stopping_threshold: 0.0,
            memory_limit_mb: None,
            show_progress: true,
        }
    }
}

/// Dataset construction settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DataConfig {
    /// Directory holding the per-language tables
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: PathBuf,

    /// English idiom table
    #[serde(default = "default_english_file")]
    pub english_file: String,

    /// Hindi idiom table
    #[serde(default = "default_hindi_file")]
    pub hindi_file: String,

    /// Telugu idiom table
    #[serde(default = "default_telugu_file")]
    pub telugu_file: String,

    /// Directory receiving the prepared corpus
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,

    /// Share of pairs in the train split
    #[serde(default = "default_train_split")]
    pub train_split: f64,

    /// Share of pairs in the validation split
    #[serde(default = "default_eval_split")]
    pub val_split: f64,

    /// Share of pairs in the test split
    #[serde(default = "default_eval_split")]
    pub test_split: f64,

    /// Whether targets are idioms or meanings
    #[serde(default)]
    pub pair_mode: PairMode,

    /// Embed idioms into sentence templates
    #[serde(default = "default_true")]
    pub add_context_variations: bool,

    /// Multilingual sentence templates
    #[serde(default = "default_templates")]
    pub context_templates: Vec<ContextTemplate>,

    /// Header of the idiom column
    #[serde(default = "default_idiom_column")]
    pub idiom_column: String,

    /// Header of the meaning column
    #[serde(default = "default_meaning_column")]
    pub meaning_column: String,

    /// Shared identifier column; positional alignment when absent
    #[serde(default)]
    pub key_column: Option<String>,
}

impl DataConfig {
    /// Path of the table for a language
    pub fn table_path(&self, language: IdiomLanguage) -> PathBuf {
        let file = match language {
            IdiomLanguage::English => &self.english_file,
            IdiomLanguage::Hindi => &self.hindi_file,
            IdiomLanguage::Telugu => &self.telugu_file,
        };
        self.dataset_dir.join(file)
    }

    /// Split ratios as configured
    pub fn ratios(&self) -> SplitRatios {
        SplitRatios {
            train: self.train_split,
            validation: self.val_split,
            test: self.test_split,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset_dir: default_dataset_dir(),
            english_file: default_english_file(),
            hindi_file: default_hindi_file(),
            telugu_file: default_telugu_file(),
            corpus_dir: default_corpus_dir(),
            train_split: default_train_split(),
            val_split: default_eval_split(),
            test_split: default_eval_split(),
            pair_mode: PairMode::default(),
            add_context_variations: true,
            context_templates: default_templates(),
            idiom_column: default_idiom_column(),
            meaning_column: default_meaning_column(),
            key_column: None,
        }
    }
}

/// Decoding configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InferenceConfig {
    /// Checkpoint to serve; defaults to the training output directory
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Beam width
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    /// Candidates returned per request
    #[serde(default = "default_num_candidates")]
    pub num_candidates: usize,

    /// Maximum generated tokens
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Minimum generated content tokens
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Forbid repeating n-grams of this size (0 disables)
    #[serde(default = "default_no_repeat_ngram_size")]
    pub no_repeat_ngram_size: usize,

    /// Penalty for tokens already generated
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// Exponent of the length normalization
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f32,

    /// Shortest accepted input in characters
    #[serde(default = "default_min_input_chars")]
    pub min_input_chars: usize,

    /// Retry with the bare base model when no adapted candidate is in the target script
    #[serde(default = "default_true")]
    pub fallback_to_base: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            beam_width: default_beam_width(),
            num_candidates: default_num_candidates(),
            max_length: default_max_length(),
            min_length: default_min_length(),
            no_repeat_ngram_size: default_no_repeat_ngram_size(),
            repetition_penalty: default_repetition_penalty(),
            length_penalty: default_length_penalty(),
            min_input_chars: default_min_input_chars(),
            fallback_to_base: true,
        }
    }
}

/// Log verbosity level
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

fn default_model_name() -> String {
    "facebook/nllb-200-distilled-600M".to_string()
}

fn default_max_length() -> usize {
    256
}

fn default_hidden_size() -> usize {
    64
}

fn default_lora_rank() -> usize {
    16
}

fn default_lora_alpha() -> f32 {
    32.0
}

fn default_lora_dropout() -> f32 {
    0.05
}

fn default_target_modules() -> Vec<String> {
    ["q_proj", "v_proj", "k_proj", "o_proj", "fc1", "fc2"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./nllb_idiom_finetuned")
}

fn default_train_batch_size() -> usize {
    12
}

fn default_eval_batch_size() -> usize {
    16
}

fn default_gradient_accumulation_steps() -> usize {
    4 // effective batch of 48
}

fn default_learning_rate() -> f32 {
    5e-4
}

fn default_warmup_steps() -> usize {
    100
}

fn default_weight_decay() -> f32 {
    0.01
}

fn default_num_train_epochs() -> usize {
    2
}

fn default_max_grad_norm() -> f32 {
    1.0
}

fn default_save_total_limit() -> usize {
    2
}

fn default_seed() -> u64 {
    42
}

fn default_early_stopping_patience() -> usize {
    2
}

fn default_dataset_dir() -> PathBuf {
    PathBuf::from("./Dataset")
}

fn default_english_file() -> String {
    "English_proverbs_translation.csv".to_string()
}

fn default_hindi_file() -> String {
    "Hindi_Proverbs_Translation.csv".to_string()
}

fn default_telugu_file() -> String {
    "Telugu_Proverbs_Hindi.csv".to_string()
}

fn default_corpus_dir() -> PathBuf {
    PathBuf::from("./corpus")
}

fn default_train_split() -> f64 {
    0.8
}

fn default_eval_split() -> f64 {
    0.1
}

fn default_idiom_column() -> String {
    "idiom".to_string()
}

fn default_meaning_column() -> String {
    "meaning".to_string()
}

fn default_beam_width() -> usize {
    5
}

fn default_num_candidates() -> usize {
    1
}

fn default_min_length() -> usize {
    1
}

fn default_no_repeat_ngram_size() -> usize {
    3
}

fn default_repetition_penalty() -> f32 {
    1.2
}

fn default_length_penalty() -> f32 {
    1.0
}

fn default_min_input_chars() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<()> {
        if self.model.model_name.trim().is_empty() {
            return Err(anyhow!("model.model_name must not be empty"));
        }
        if self.model.hidden_size == 0 || self.model.max_length < 2 {
            return Err(anyhow!("model.hidden_size must be positive and model.max_length at least 2"));
        }

        // Adapter capacity
        if self.lora.r == 0 || self.lora.r > self.model.hidden_size {
            return Err(anyhow!(
                "lora.r must be between 1 and the hidden size ({}), got {}",
                self.model.hidden_size,
                self.lora.r
            ));
        }
        if !(0.0..1.0).contains(&self.lora.lora_dropout) {
            return Err(anyhow!("lora.lora_dropout must be in [0, 1), got {}", self.lora.lora_dropout));
        }
        if self.lora.target_modules.is_empty() {
            return Err(anyhow!("lora.target_modules must name at least one projection"));
        }
        if let Some(unknown) = self
            .lora
            .target_modules
            .iter()
            .find(|name| !PROJECTION_LAYERS.contains(&name.as_str()))
        {
            return Err(anyhow!(
                "Unknown target module '{}', expected one of {:?}",
                unknown,
                PROJECTION_LAYERS
            ));
        }

        // Training loop
        let training = &self.training;
        if training.per_device_train_batch_size == 0
            || training.per_device_eval_batch_size == 0
            || training.gradient_accumulation_steps == 0
        {
            return Err(anyhow!("Batch sizes and gradient_accumulation_steps must be positive"));
        }
        if training.learning_rate <= 0.0 {
            return Err(anyhow!("training.learning_rate must be positive"));
        }
        if training.num_train_epochs == 0 && training.max_steps.is_none() {
            return Err(anyhow!("Either num_train_epochs or max_steps must be set"));
        }
        if training.eval_steps == Some(0) {
            return Err(anyhow!("training.eval_steps must be positive when set"));
        }

        // Dataset
        self.data
            .ratios()
            .validate()
            .map_err(|e| anyhow!("Invalid data split ratios: {}", e))?;

        // Decoding
        let inference = &self.inference;
        if inference.beam_width == 0 || inference.num_candidates == 0 {
            return Err(anyhow!("inference.beam_width and num_candidates must be positive"));
        }
        if inference.num_candidates > inference.beam_width {
            return Err(anyhow!(
                "inference.num_candidates ({}) cannot exceed beam_width ({})",
                inference.num_candidates,
                inference.beam_width
            ));
        }
        if inference.repetition_penalty <= 0.0 {
            return Err(anyhow!("inference.repetition_penalty must be positive"));
        }

        Ok(())
    }

    /// Checkpoint directory served by the inference engine
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.inference
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.training.output_dir.clone())
    }

    /// Load a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .context(format!("Failed to open config file: {}", path.display()))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .context(format!("Failed to parse config file: {}", path.display()))
    }

    /// Load a configuration file, writing the defaults when it does not exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }

        warn!("Config file not found at '{}', creating default config.", path.display());
        let config = Config::default();
        config.save(path)?;
        Ok(config)
    }

    /// Save the configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config_json = serde_json::to_string_pretty(self)
            .context("Failed to serialize config to JSON")?;
        std::fs::write(path, config_json)
            .context(format!("Failed to write config to file: {}", path.display()))
    }
}
