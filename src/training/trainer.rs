use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::app_config::{Config, LoraConfig, TrainingConfig};
use crate::dataset::pairs::TranslationPair;
use crate::dataset::splitter::SplitDataset;
use crate::errors::TrainingError;
use crate::model::checkpoint::{read_json, write_json};
use crate::model::lora::AdapterSet;
use crate::model::{
    derive_seed, load_base_model, AdapterCheckpoint, BaseModel, LossOutput, StepOptions, Tokenizer,
    TrainingExample,
};

use super::optimizer::{clip_grad_norm, AdapterOptimizer, LrSchedule, OptimizerState};

// @module: Adapter fine-tuning loop

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
pub const OPTIMIZER_STATE_FILE: &str = "optimizer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Training loss after one optimizer step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub step: usize,
    pub loss: f32,
    pub learning_rate: f32,
}

/// One validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub step: usize,
    pub epoch: usize,
    pub validation_loss: f32,
}

/// Progress of a training run, threaded through the loop and persisted with each checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub run_id: String,
    pub global_step: usize,
    /// Epoch in progress
    pub epoch: usize,
    /// Micro-batches of `epoch` already consumed
    pub epoch_offset: usize,
    pub total_steps: usize,
    pub initial_validation_loss: Option<f32>,
    pub best_validation_loss: Option<f32>,
    pub best_checkpoint: Option<PathBuf>,
    pub patience_counter: usize,
    pub skipped_pairs: usize,
    pub loss_history: Vec<LossRecord>,
    pub eval_history: Vec<EvalRecord>,
    pub stopped_early: bool,
}

impl TrainerState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            global_step: 0,
            epoch: 0,
            epoch_offset: 0,
            total_steps: 0,
            initial_validation_loss: None,
            best_validation_loss: None,
            best_checkpoint: None,
            patience_counter: 0,
            skipped_pairs: 0,
            loss_history: Vec::new(),
            eval_history: Vec::new(),
            stopped_early: false,
        }
    }

    /// Training loss of the latest optimizer step
    pub fn last_train_loss(&self) -> Option<f32> {
        self.loss_history.last().map(|r| r.loss)
    }
}

impl Default for TrainerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a finished run
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Best checkpoint, also written to the output directory root
    pub checkpoint: Arc<AdapterCheckpoint>,
    pub output_dir: PathBuf,
    pub state: TrainerState,
}

/// Fine-tunes low-rank adapters against a frozen base model
pub struct AdapterTrainer {
    // @field: Frozen base model
    model: Arc<dyn BaseModel>,
    // @field: Vocabulary shared with inference
    tokenizer: Arc<Tokenizer>,
    lora: LoraConfig,
    config: TrainingConfig,
    max_length: usize,
}

impl AdapterTrainer {
    pub fn new(
        model: Arc<dyn BaseModel>,
        tokenizer: Arc<Tokenizer>,
        lora: LoraConfig,
        config: TrainingConfig,
        max_length: usize,
    ) -> Result<Self, TrainingError> {
        if config.per_device_train_batch_size == 0 || config.gradient_accumulation_steps == 0 {
            return Err(TrainingError::Config(
                "batch size and gradient accumulation steps must be positive".to_string(),
            ));
        }
        if config.num_train_epochs == 0 && config.max_steps.is_none() {
            return Err(TrainingError::Config(
                "either num_train_epochs or max_steps must be set".to_string(),
            ));
        }
        if config.eval_steps == Some(0) {
            return Err(TrainingError::Config("eval_steps must be positive".to_string()));
        }

        Ok(Self {
            model,
            tokenizer,
            lora,
            config,
            max_length,
        })
    }

    /// Trainer over the configured base model
    pub fn from_config(config: &Config, tokenizer: Arc<Tokenizer>) -> Result<Self, TrainingError> {
        let model = load_base_model(&config.model, &tokenizer)?;
        Self::new(
            model,
            tokenizer,
            config.lora.clone(),
            config.training.clone(),
            config.model.max_length,
        )
    }

    pub fn model(&self) -> &Arc<dyn BaseModel> {
        &self.model
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    /// Tokenize pairs, returning the usable examples and the number skipped
    pub fn prepare_examples(&self, pairs: &[TranslationPair]) -> (Vec<TrainingExample>, usize) {
        let mut examples = Vec::with_capacity(pairs.len());
        let mut skipped = 0;
        for pair in pairs {
            match self.tokenizer.training_example(pair, self.max_length) {
                Some(example) => examples.push(example),
                None => {
                    debug!(
                        "Skipping malformed pair {} (row {}): '{}' -> '{}'",
                        pair.direction(),
                        pair.base_row_index,
                        pair.source_text,
                        pair.target_text
                    );
                    skipped += 1;
                }
            }
        }
        (examples, skipped)
    }

    /// Estimated activation memory of a micro-batch in MB
    pub fn estimate_memory_mb(&self, batch: &[&TrainingExample]) -> f64 {
        let longest = batch.iter().map(|e| e.sequence_len()).max().unwrap_or(0);
        let floats = self
            .model
            .activation_floats_per_token(self.config.use_gradient_checkpointing);
        let bytes_per_float = if self.config.use_mixed_precision { 2 } else { 4 };
        (batch.len() * longest * floats * bytes_per_float) as f64 / (1024.0 * 1024.0)
    }

    /// Mean token loss over examples
    pub fn validation_loss(&self, adapters: &AdapterSet, examples: &[TrainingExample]) -> Result<f32, TrainingError> {
        let mut total = LossOutput::default();
        for batch in examples.chunks(self.config.per_device_eval_batch_size.max(1)) {
            for example in batch {
                total.add(self.model.forward(example, Some(adapters))?);
            }
        }
        Ok(total.mean())
    }

    /// Train fresh adapters; step checkpoints left in the output directory by earlier runs are removed
    pub fn train(&self, dataset: &SplitDataset) -> Result<TrainingOutcome, TrainingError> {
        self.clear_previous_checkpoints()?;
        let adapters = AdapterSet::inject(self.model.as_ref(), &self.lora, self.config.seed)?;
        info!(
            "Injected rank-{} adapters into {:?} ({} trainable parameters)",
            adapters.rank,
            adapters.target_layers(),
            adapters.num_parameters()
        );
        self.run(
            dataset,
            adapters,
            OptimizerState::new(self.config.weight_decay as f64),
            TrainerState::new(),
        )
    }

    /// Continue a run from one of its checkpoints
    pub fn resume<P: AsRef<Path>>(
        &self,
        dataset: &SplitDataset,
        checkpoint_dir: P,
    ) -> Result<TrainingOutcome, TrainingError> {
        let dir = checkpoint_dir.as_ref();
        let checkpoint = AdapterCheckpoint::load(dir)?;
        checkpoint.adapter_weights.check_compatible(self.model.as_ref())?;

        let tokenizer = Tokenizer::load(dir)?;
        if tokenizer != *self.tokenizer {
            return Err(TrainingError::Checkpoint(format!(
                "tokenizer in {} differs from the trainer's vocabulary",
                dir.display()
            )));
        }

        let state: TrainerState = read_json(&dir.join(TRAINER_STATE_FILE))
            .map_err(|e| TrainingError::Checkpoint(e.to_string()))?;
        let optimizer: OptimizerState = read_json(&dir.join(OPTIMIZER_STATE_FILE))
            .map_err(|e| TrainingError::Checkpoint(e.to_string()))?;

        info!(
            "Resuming run {} from step {} (epoch {})",
            state.run_id, state.global_step, state.epoch
        );
        self.run(dataset, checkpoint.adapter_weights, optimizer, state)
    }

    fn run(
        &self,
        dataset: &SplitDataset,
        adapters: AdapterSet,
        optimizer_state: OptimizerState,
        mut state: TrainerState,
    ) -> Result<TrainingOutcome, TrainingError> {
        let config = &self.config;
        let mut optimizer = AdapterOptimizer::from_state(&adapters, optimizer_state)?;

        let (train, skipped_train) = self.prepare_examples(&dataset.train);
        let (mut validation, skipped_validation) = self.prepare_examples(&dataset.validation);
        state.skipped_pairs = skipped_train + skipped_validation;
        if state.skipped_pairs > 0 {
            warn!("Skipped {} malformed pairs", state.skipped_pairs);
        }
        if train.is_empty() {
            return Err(TrainingError::EmptyTrainingSplit {
                skipped: state.skipped_pairs,
            });
        }
        if validation.is_empty() {
            warn!("Validation split is empty, using the training split for validation");
            validation = train.clone();
        }

        let batch_size = config.per_device_train_batch_size;
        let accumulation = config.gradient_accumulation_steps;
        let micro_per_epoch = train.len().div_ceil(batch_size);
        let steps_per_epoch = micro_per_epoch.div_ceil(accumulation);
        state.total_steps = config
            .max_steps
            .unwrap_or(config.num_train_epochs * steps_per_epoch);
        let epochs = match config.max_steps {
            Some(max_steps) => max_steps.div_ceil(steps_per_epoch),
            None => config.num_train_epochs,
        };
        let schedule = LrSchedule {
            base_lr: config.learning_rate,
            warmup_steps: config.warmup_steps,
            total_steps: state.total_steps,
        };

        fs::create_dir_all(&config.output_dir)?;
        info!(
            "Training on {} examples ({} validation): {} epochs, {} optimizer steps, effective batch {}",
            train.len(),
            validation.len(),
            epochs,
            state.total_steps,
            config.effective_batch_size()
        );

        if state.initial_validation_loss.is_none() {
            let initial = self.validation_loss(&adapters, &validation)?;
            info!("Initial validation loss: {:.4}", initial);
            state.initial_validation_loss = Some(initial);
        }

        let mut best = match &state.best_checkpoint {
            Some(dir) if AdapterCheckpoint::exists(dir) => Some(AdapterCheckpoint::load(dir)?),
            _ => None,
        };

        let mut gradients = adapters.zero_gradients();
        let mut group_loss = LossOutput::default();
        let mut accumulated = 0usize;
        let mut finished = state.global_step >= state.total_steps;

        'epochs: for epoch in state.epoch..epochs {
            if finished {
                break;
            }

            let order = epoch_order(train.len(), config.seed, epoch);
            let progress = self.progress_bar(micro_per_epoch as u64, epoch, epochs);
            progress.set_position(state.epoch_offset as u64);

            for (micro_index, chunk) in order.chunks(batch_size).enumerate().skip(state.epoch_offset) {
                let batch: Vec<&TrainingExample> = chunk.iter().map(|&i| &train[i]).collect();

                if let Some(limit_mb) = config.memory_limit_mb {
                    let required_mb = self.estimate_memory_mb(&batch);
                    if required_mb > limit_mb as f64 {
                        progress.abandon();
                        return Err(TrainingError::ResourceExhausted {
                            required_mb,
                            limit_mb,
                            batch_size: batch.len(),
                        });
                    }
                }

                let group_start = (micro_index / accumulation) * accumulation;
                let group_len = accumulation.min(micro_per_epoch - group_start);
                let tokens: usize = batch.iter().map(|e| e.labels.len()).sum();
                let gradient_scale = 1.0 / (tokens.max(1) * group_len) as f32;

                for (position, example) in batch.iter().enumerate() {
                    let options = StepOptions {
                        dropout_seed: derive_seed(&[
                            &config.seed.to_string(),
                            "dropout",
                            &epoch.to_string(),
                            &micro_index.to_string(),
                            &position.to_string(),
                        ]),
                        gradient_scale,
                        mixed_precision: config.use_mixed_precision,
                        gradient_checkpointing: config.use_gradient_checkpointing,
                    };
                    group_loss.add(
                        self.model
                            .forward_backward(example, &adapters, &options, &mut gradients)?,
                    );
                }

                accumulated += 1;
                progress.inc(1);
                if accumulated < group_len {
                    continue;
                }

                let grad_norm = clip_grad_norm(&mut gradients, config.max_grad_norm)?;
                let learning_rate = schedule.lr_at(state.global_step);
                optimizer.step(&mut gradients, &adapters, learning_rate)?;
                gradients.clear();

                state.global_step += 1;
                state.epoch_offset = micro_index + 1;
                state.loss_history.push(LossRecord {
                    step: state.global_step,
                    loss: group_loss.mean(),
                    learning_rate,
                });
                debug!(
                    "step {} loss {:.4} grad_norm {:.4} lr {:.2e}",
                    state.global_step,
                    group_loss.mean(),
                    grad_norm,
                    learning_rate
                );
                progress.set_message(format!("loss {:.4}", group_loss.mean()));
                group_loss = LossOutput::default();
                accumulated = 0;

                if let Some(eval_steps) = config.eval_steps {
                    if state.global_step % eval_steps == 0
                        && self.evaluate_and_checkpoint(&adapters, &optimizer, &mut state, &validation, &mut best)?
                    {
                        progress.finish_and_clear();
                        break 'epochs;
                    }
                }

                if state.global_step >= state.total_steps {
                    finished = true;
                    break;
                }
            }

            progress.finish_and_clear();
            if finished {
                break;
            }

            state.epoch = epoch + 1;
            state.epoch_offset = 0;
            if let Some(train_loss) = state.last_train_loss() {
                info!("Epoch {}/{} done, training loss {:.4}", epoch + 1, epochs, train_loss);
            }

            if config.eval_steps.is_none()
                && self.evaluate_and_checkpoint(&adapters, &optimizer, &mut state, &validation, &mut best)?
            {
                break;
            }
        }

        if !state.stopped_early && state.eval_history.last().map(|e| e.step) != Some(state.global_step) {
            self.evaluate_and_checkpoint(&adapters, &optimizer, &mut state, &validation, &mut best)?;
        }

        let best = match best {
            Some(best) => best,
            None => self.snapshot(&adapters, &state, state.eval_history.last().map(|e| e.validation_loss))?,
        };

        // Best model at the root of the output directory
        best.save(&config.output_dir)?;
        self.tokenizer.save(&config.output_dir)?;
        write_json(&config.output_dir.join(TRAINER_STATE_FILE), &state)?;

        info!(
            "Training finished at step {}; best validation loss {:?} (initial {:?})",
            state.global_step, state.best_validation_loss, state.initial_validation_loss
        );

        Ok(TrainingOutcome {
            checkpoint: Arc::new(best),
            output_dir: config.output_dir.clone(),
            state,
        })
    }

    /// Evaluate, checkpoint on improvement and report whether to stop
    fn evaluate_and_checkpoint(
        &self,
        adapters: &AdapterSet,
        optimizer: &AdapterOptimizer,
        state: &mut TrainerState,
        validation: &[TrainingExample],
        best: &mut Option<AdapterCheckpoint>,
    ) -> Result<bool, TrainingError> {
        let loss = self.validation_loss(adapters, validation)?;
        state.eval_history.push(EvalRecord {
            step: state.global_step,
            epoch: state.epoch,
            validation_loss: loss,
        });

        let improved = match state.best_validation_loss {
            None => true,
            Some(previous) => previous - loss > self.config.early_stopping_threshold,
        };

        if improved {
            info!("Step {}: validation loss improved to {:.4}", state.global_step, loss);
            state.best_validation_loss = Some(loss);
            state.patience_counter = 0;

            let dir = self
                .config
                .output_dir
                .join(format!("{}{}", CHECKPOINT_PREFIX, state.global_step));
            state.best_checkpoint = Some(dir.clone());
            let checkpoint = self.snapshot(adapters, state, Some(loss))?;
            self.save_checkpoint(&dir, &checkpoint, optimizer, state)?;
            self.prune_checkpoints(&dir, &state.run_id)?;
            *best = Some(checkpoint);
            return Ok(false);
        }

        state.patience_counter += 1;
        info!(
            "Step {}: validation loss {:.4} did not improve on {:.4} ({}/{})",
            state.global_step,
            loss,
            state.best_validation_loss.unwrap_or(loss),
            state.patience_counter,
            self.config.early_stopping_patience
        );

        let patience = self.config.early_stopping_patience;
        if patience > 0 && state.patience_counter >= patience {
            info!("Early stopping after {} evaluations without improvement", patience);
            state.stopped_early = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Checkpoint over a copy of the current adapter values
    fn snapshot(
        &self,
        adapters: &AdapterSet,
        state: &TrainerState,
        loss: Option<f32>,
    ) -> Result<AdapterCheckpoint, TrainingError> {
        Ok(AdapterCheckpoint::new(
            self.model.model_id(),
            self.model.hidden_size(),
            adapters.deep_copy()?,
            state.global_step,
            loss,
        ))
    }

    fn save_checkpoint(
        &self,
        dir: &Path,
        checkpoint: &AdapterCheckpoint,
        optimizer: &AdapterOptimizer,
        state: &TrainerState,
    ) -> Result<(), TrainingError> {
        checkpoint.save(dir)?;
        self.tokenizer.save(dir)?;
        write_json(&dir.join(TRAINER_STATE_FILE), state)?;
        write_json(&dir.join(OPTIMIZER_STATE_FILE), optimizer.state())?;
        debug!("Checkpoint written to {}", dir.display());
        Ok(())
    }

    /// Keep at most `save_total_limit` step checkpoints of run `run_id`, never removing `keep`
    fn prune_checkpoints(&self, keep: &Path, run_id: &str) -> Result<(), TrainingError> {
        let limit = self.config.save_total_limit;
        if limit == 0 {
            return Ok(());
        }

        let mut checkpoints: Vec<(usize, PathBuf)> = list_checkpoints(&self.config.output_dir)?
            .into_iter()
            .filter(|(_, dir)| checkpoint_run_id(dir).as_deref() == Some(run_id))
            .collect();
        while checkpoints.len() > limit {
            let (_, oldest) = checkpoints.remove(0);
            if oldest.as_path() == keep {
                continue;
            }
            debug!("Removing old checkpoint {}", oldest.display());
            fs::remove_dir_all(&oldest)?;
        }
        Ok(())
    }

    /// Remove step checkpoints of earlier runs before a fresh run reuses the output directory
    fn clear_previous_checkpoints(&self) -> Result<(), TrainingError> {
        let stale = list_checkpoints(&self.config.output_dir)?;
        if stale.is_empty() {
            return Ok(());
        }
        info!(
            "Removing {} checkpoints of a previous run in {}",
            stale.len(),
            self.config.output_dir.display()
        );
        for (_, dir) in stale {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn progress_bar(&self, len: u64, epoch: usize, epochs: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }

        let progress_bar = ProgressBar::new(len);
        let template_result = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({percent}%) {msg} {eta}")
            .or_else(|_| ProgressStyle::default_bar().template("{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} ({percent}%) {msg}"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        progress_bar.set_style(template_result.progress_chars("█▓▒░"));
        progress_bar.set_prefix(format!("epoch {}/{}", epoch + 1, epochs));
        progress_bar
    }
}

/// Example order for an epoch, reshuffled per epoch
pub fn epoch_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(derive_seed(&[&seed.to_string(), "epoch", &epoch.to_string()]));
    order.shuffle(&mut rng);
    order
}

/// Run that wrote a step checkpoint
fn checkpoint_run_id(dir: &Path) -> Option<String> {
    read_json::<TrainerState>(&dir.join(TRAINER_STATE_FILE))
        .ok()
        .map(|state| state.run_id)
}

/// Step checkpoints in a directory, oldest first
pub fn list_checkpoints(dir: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut checkpoints = Vec::new();
    if !dir.exists() {
        return Ok(checkpoints);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(step) = name
            .to_str()
            .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if entry.path().is_dir() {
            checkpoints.push((step, entry.path()));
        }
    }
    checkpoints.sort();
    Ok(checkpoints)
}
