use anyhow::{Result, Context, anyhow};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::app_config::Config;
use crate::dataset::corpus::{CorpusBuilder, PreparedCorpus, STATS_FILE};
use crate::dataset::aligner::TripletAligner;
use crate::dataset::tables::{load_tables, IdiomTables};
use crate::evaluation::{EvaluationReport, Evaluator};
use crate::file_utils::FileManager;
use crate::inference::{IdiomDetector, InferenceEngine};
use crate::model::{AdapterCheckpoint, Tokenizer};
use crate::training::{AdapterTrainer, TrainingOutcome};

// @module: Application controller for the idiom translation workflow

const TRAINING_LOG_FILE: &str = "training_log.txt";

/// Main application controller: prepare, train, evaluate and fine-tune
pub struct Controller {
    // @field: App configuration
    config: Config,
}

impl Controller {
    /// Create a new controller for test purposes with default configuration
    pub fn new_for_test() -> Result<Self> {
        Self::with_config(Config::default())
    }

    // @method: Create a new controller with the given configuration
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the corpus from the configured tables and write it to the corpus directory
    pub fn prepare(&self) -> Result<PreparedCorpus> {
        let data = &self.config.data;
        info!("Preparing corpus from {}", data.dataset_dir.display());

        let corpus = CorpusBuilder::build_from_config(data, self.config.training.seed)?;
        corpus.save(&data.corpus_dir)?;
        info!("Corpus written to {}", data.corpus_dir.display());
        Ok(corpus)
    }

    /// Build the corpus from in-memory tables
    pub fn prepare_from_tables(&self, tables: &IdiomTables) -> Result<PreparedCorpus> {
        CorpusBuilder::new(&self.config.data, self.config.training.seed).build(tables)
    }

    /// Reuse a prepared corpus when one exists, otherwise prepare it
    pub fn load_or_prepare(&self) -> Result<PreparedCorpus> {
        let corpus_dir = &self.config.data.corpus_dir;
        if FileManager::file_exists(corpus_dir.join(STATS_FILE)) {
            info!("Loading prepared corpus from {}", corpus_dir.display());
            return PreparedCorpus::load(corpus_dir);
        }
        self.prepare()
    }

    /// Train adapters on the prepared corpus, optionally resuming a checkpoint
    pub fn train(&self, resume_from: Option<&Path>) -> Result<TrainingOutcome> {
        let corpus = self.load_or_prepare()?;
        self.train_on(&corpus, resume_from)
    }

    /// Train adapters on a given corpus
    pub fn train_on(&self, corpus: &PreparedCorpus, resume_from: Option<&Path>) -> Result<TrainingOutcome> {
        let start_time = Instant::now();

        let tokenizer = match resume_from {
            Some(dir) => Tokenizer::load(dir)
                .context(format!("Failed to load tokenizer from {}", dir.display()))?,
            None => Tokenizer::from_pairs(corpus.dataset.all_pairs()),
        };
        info!("Vocabulary: {} tokens", tokenizer.vocab_size());

        let trainer = AdapterTrainer::from_config(&self.config, Arc::new(tokenizer))?;
        let outcome = match resume_from {
            Some(dir) => trainer.resume(&corpus.dataset, dir)?,
            None => trainer.train(&corpus.dataset)?,
        };

        let duration = start_time.elapsed();
        info!(
            "Training completed in {} ({} steps)",
            Self::format_duration(duration),
            outcome.state.global_step
        );
        self.write_training_log(&outcome, duration)?;
        Ok(outcome)
    }

    /// Score a checkpoint on the test split and save `evaluation_results.json` next to it
    pub fn evaluate(&self, checkpoint_dir: Option<&Path>, beam_width: Option<usize>) -> Result<EvaluationReport> {
        let dir = checkpoint_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.checkpoint_dir());
        let corpus = self.load_or_prepare()?;
        if corpus.dataset.test.is_empty() {
            return Err(anyhow!("The test split is empty, nothing to evaluate"));
        }

        let checkpoint = AdapterCheckpoint::load(&dir)
            .context(format!("Failed to load checkpoint from {}", dir.display()))?;
        let tokenizer = Tokenizer::load(&dir)
            .context(format!("Failed to load tokenizer from {}", dir.display()))?;

        let report = self.evaluate_checkpoint(Arc::new(checkpoint), Arc::new(tokenizer), &corpus, beam_width)?;
        let path = report.save(&dir)?;
        info!("Evaluation results written to {}", path.display());
        Ok(report)
    }

    fn evaluate_checkpoint(
        &self,
        checkpoint: Arc<AdapterCheckpoint>,
        tokenizer: Arc<Tokenizer>,
        corpus: &PreparedCorpus,
        beam_width: Option<usize>,
    ) -> Result<EvaluationReport> {
        let mut evaluator = Evaluator::from_config(&self.config, tokenizer)?;
        if let Some(beam_width) = beam_width {
            evaluator = evaluator.with_beam_width(beam_width);
        }
        Ok(evaluator.evaluate(checkpoint, &corpus.dataset.test)?)
    }

    /// Prepare, train and evaluate from idiom rows in one go
    pub fn fine_tune(&self, tables: &IdiomTables) -> Result<TrainingOutcome> {
        let corpus = self.prepare_from_tables(tables)?;
        let outcome = self.train_on(&corpus, None)?;

        if corpus.dataset.test.is_empty() {
            warn!("No test pairs, skipping evaluation");
        } else {
            let report = self.evaluate_checkpoint(
                Arc::clone(&outcome.checkpoint),
                Arc::new(Tokenizer::load(&outcome.output_dir)?),
                &corpus,
                None,
            )?;
            report.save(&outcome.output_dir)?;
        }
        Ok(outcome)
    }

    /// Inference engine over a checkpoint, loaded and ready
    pub fn load_engine(&self, checkpoint_dir: Option<&Path>) -> Result<InferenceEngine> {
        let dir: PathBuf = checkpoint_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.checkpoint_dir());
        let mut engine = InferenceEngine::new(self.config.model.clone(), self.config.inference.clone(), &dir);
        engine
            .load()
            .context(format!("Failed to load model from {}", dir.display()))?;
        Ok(engine)
    }

    /// Idiom detector over the configured tables
    pub fn idiom_detector(&self) -> Result<IdiomDetector> {
        let tables = load_tables(&self.config.data)?;
        self.idiom_detector_from_tables(&tables)
    }

    /// Idiom detector over in-memory tables
    pub fn idiom_detector_from_tables(&self, tables: &IdiomTables) -> Result<IdiomDetector> {
        let report = TripletAligner::from_config(&self.config.data).align(tables);
        let detector = IdiomDetector::from_triplets(&report.triplets).context("Failed to compile idiom patterns")?;
        info!("Loaded {} idiom patterns from {} groups", detector.len(), report.triplets.len());
        Ok(detector)
    }

    // Format duration in a human-readable format (HH:MM:SS)
    fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}.{:03}s", seconds, duration.subsec_millis())
        }
    }

    /// Append a run summary to the training log
    fn write_training_log(&self, outcome: &TrainingOutcome, duration: Duration) -> Result<()> {
        let state = &outcome.state;
        let summary = format!(
            "run {}: {} steps in {}, validation loss {:?} -> {:?}, {} skipped pairs{}",
            state.run_id,
            state.global_step,
            Self::format_duration(duration),
            state.initial_validation_loss,
            state.best_validation_loss,
            state.skipped_pairs,
            if state.stopped_early { ", stopped early" } else { "" }
        );
        FileManager::append_to_log_file(outcome.output_dir.join(TRAINING_LOG_FILE), &summary)
    }
}
