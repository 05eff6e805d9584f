use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::app_config::{Config, InferenceConfig};
use crate::dataset::pairs::TranslationPair;
use crate::errors::ModelLoadError;
use crate::inference::engine::{InferenceEngine, TranslateOptions, TranslationRequest};
use crate::model::{load_base_model, AdapterCheckpoint, BaseModel, Tokenizer};

use super::metrics::{corpus_bleu, corpus_chrf, exact_match, similarity_score, word_count};

// @module: Checkpoint scoring on held-out pairs

pub const EVALUATION_FILE: &str = "evaluation_results.json";

/// One scored prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSample {
    pub direction: String,
    pub source: String,
    pub reference: String,
    pub prediction: String,
    pub decode_failure: bool,
    pub semantic_similarity: f64,
}

/// Metrics of a checkpoint, overall and per direction
///
/// Metric maps are keyed by stable names (`bleu`, `chrf`, `semantic_similarity`,
/// `exact_match`, `avg_pred_length`, `avg_ref_length`, `length_ratio`,
/// `num_pairs`, `decode_failures`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub base_model_id: String,
    pub checkpoint_step: usize,
    pub evaluated_at: String,
    pub num_pairs: usize,
    pub decode_failures: usize,
    pub overall: BTreeMap<String, f64>,
    pub per_direction: BTreeMap<String, BTreeMap<String, f64>>,
    pub samples: Vec<EvaluationSample>,
}

impl EvaluationReport {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.overall.get(name).copied()
    }

    /// Write `evaluation_results.json` into `dir`
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).context(format!("Failed to create directory: {}", dir.display()))?;
        let path = dir.join(EVALUATION_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize evaluation report")?;
        fs::write(&path, json).context(format!("Failed to write evaluation report: {}", path.display()))?;
        Ok(path)
    }

    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(EVALUATION_FILE);
        let content = fs::read_to_string(&path)
            .context(format!("Failed to read evaluation report: {}", path.display()))?;
        serde_json::from_str(&content).context(format!("Failed to parse evaluation report: {}", path.display()))
    }
}

/// Scores adapter checkpoints against test pairs
pub struct Evaluator {
    model: Arc<dyn BaseModel>,
    tokenizer: Arc<Tokenizer>,
    config: InferenceConfig,
    options: TranslateOptions,
}

impl Evaluator {
    pub fn new(model: Arc<dyn BaseModel>, tokenizer: Arc<Tokenizer>, config: InferenceConfig) -> Self {
        let options = TranslateOptions::from_config(&config);
        Self {
            model,
            tokenizer,
            config,
            options,
        }
    }

    pub fn from_config(config: &Config, tokenizer: Arc<Tokenizer>) -> Result<Self, ModelLoadError> {
        let model = load_base_model(&config.model, &tokenizer)?;
        Ok(Self::new(model, tokenizer, config.inference.clone()))
    }

    /// Override the beam width used for generation
    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.options.beam_width = beam_width.max(1);
        self
    }

    /// Translate every test pair with the checkpoint attached and score the output
    pub fn evaluate(
        &self,
        checkpoint: Arc<AdapterCheckpoint>,
        test_pairs: &[TranslationPair],
    ) -> Result<EvaluationReport, ModelLoadError> {
        let engine = InferenceEngine::from_parts(
            Arc::clone(&self.model),
            Arc::clone(&self.tokenizer),
            Arc::clone(&checkpoint),
            self.config.clone(),
        )?;

        let requests: Vec<TranslationRequest> = test_pairs
            .iter()
            .map(|p| TranslationRequest::new(&p.source_text, p.source_lang.code(), p.target_lang.code()))
            .collect();
        let options = TranslateOptions {
            num_candidates: 1,
            ..self.options
        };
        info!("Evaluating {} test pairs (beam width {})", test_pairs.len(), options.beam_width);
        let results = engine.translate_batch(&requests, &options);

        let mut samples = Vec::with_capacity(test_pairs.len());
        for (pair, result) in test_pairs.iter().zip(results) {
            let (prediction, decode_failure) = match result {
                Ok(candidates) => (candidates.into_iter().next().map(|c| c.text).unwrap_or_default(), false),
                Err(e) => {
                    warn!("No prediction for {} '{}': {}", pair.direction(), pair.source_text, e);
                    (String::new(), true)
                }
            };
            let semantic_similarity = if prediction.is_empty() {
                0.0
            } else {
                match (
                    engine.embed(&prediction, pair.target_lang),
                    engine.embed(&pair.target_text, pair.target_lang),
                ) {
                    (Ok(hyp), Ok(reference)) => similarity_score(&hyp, &reference),
                    _ => 0.0,
                }
            };
            samples.push(EvaluationSample {
                direction: pair.direction(),
                source: pair.source_text.clone(),
                reference: pair.target_text.clone(),
                prediction,
                decode_failure,
                semantic_similarity,
            });
        }

        let mut by_direction: BTreeMap<String, Vec<&EvaluationSample>> = BTreeMap::new();
        for sample in &samples {
            by_direction.entry(sample.direction.clone()).or_default().push(sample);
        }
        let per_direction: BTreeMap<String, BTreeMap<String, f64>> = by_direction
            .iter()
            .map(|(direction, group)| (direction.clone(), score(group)))
            .collect();
        let all: Vec<&EvaluationSample> = samples.iter().collect();
        let overall = score(&all);

        let decode_failures = samples.iter().filter(|s| s.decode_failure).count();
        info!(
            "BLEU {:.2}, chrF {:.2}, semantic similarity {:.2} over {} pairs ({} without prediction)",
            overall.get("bleu").copied().unwrap_or_default(),
            overall.get("chrf").copied().unwrap_or_default(),
            overall.get("semantic_similarity").copied().unwrap_or_default(),
            samples.len(),
            decode_failures
        );

        Ok(EvaluationReport {
            base_model_id: checkpoint.base_model_id.clone(),
            checkpoint_step: checkpoint.training_step,
            evaluated_at: Utc::now().to_rfc3339(),
            num_pairs: samples.len(),
            decode_failures,
            overall,
            per_direction,
            samples,
        })
    }
}

fn score(samples: &[&EvaluationSample]) -> BTreeMap<String, f64> {
    let hypotheses: Vec<&str> = samples.iter().map(|s| s.prediction.as_str()).collect();
    let references: Vec<&str> = samples.iter().map(|s| s.reference.as_str()).collect();
    let count = samples.len().max(1) as f64;

    let pred_words: usize = hypotheses.iter().map(|h| word_count(h)).sum();
    let ref_words: usize = references.iter().map(|r| word_count(r)).sum();
    let avg_pred = pred_words as f64 / count;
    let avg_ref = ref_words as f64 / count;

    let mut metrics = BTreeMap::new();
    metrics.insert("bleu".to_string(), corpus_bleu(&hypotheses, &references));
    metrics.insert("chrf".to_string(), corpus_chrf(&hypotheses, &references));
    metrics.insert(
        "semantic_similarity".to_string(),
        samples.iter().map(|s| s.semantic_similarity).sum::<f64>() / count,
    );
    metrics.insert("exact_match".to_string(), exact_match(&hypotheses, &references));
    metrics.insert("avg_pred_length".to_string(), avg_pred);
    metrics.insert("avg_ref_length".to_string(), avg_ref);
    metrics.insert(
        "length_ratio".to_string(),
        if avg_ref > 0.0 { avg_pred / avg_ref } else { 0.0 },
    );
    metrics.insert("num_pairs".to_string(), samples.len() as f64);
    metrics.insert(
        "decode_failures".to_string(),
        samples.iter().filter(|s| s.decode_failure).count() as f64,
    );
    metrics
}
