/*!
 * Service boundary for an outer (web) layer.
 *
 * `IdiomService` is cheap to clone and shares one inference engine behind a
 * read-write lock. Translation takes the read lock; a successful fine-tune
 * loads the new checkpoint off the lock and swaps it in under the write lock.
 * Fine-tunes run one at a time, so concurrent calls never share an output
 * directory mid-run.
 */

use anyhow::{Context, Result};
use log::{error, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::app_config::Config;
use crate::app_controller::Controller;
use crate::dataset::tables::IdiomTables;
use crate::errors::NO_TRANSLATION_PLACEHOLDER;
use crate::inference::{InferenceEngine, TranslateOptions};

/// Reply to a translation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslateResponse {
    /// Ranked translations, or the placeholder when none could be produced
    pub candidates: Vec<String>,
    pub scores: Vec<f32>,
    pub success: bool,
    pub error: Option<String>,
}

/// Reply to a fine-tuning call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneResponse {
    pub checkpoint_path: Option<PathBuf>,
    pub success: bool,
    pub error: Option<String>,
}

/// Shared translation and fine-tuning service
#[derive(Clone)]
pub struct IdiomService {
    engine: Arc<RwLock<InferenceEngine>>,
    options: TranslateOptions,
    // @field: Held from training start until the new engine is in place
    fine_tune_lock: Arc<tokio::sync::Mutex<()>>,
}

impl IdiomService {
    pub fn new(engine: InferenceEngine, options: TranslateOptions) -> Self {
        Self {
            engine: Arc::new(RwLock::new(engine)),
            options,
            fine_tune_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Service over the configured checkpoint; a missing checkpoint leaves the engine unloaded
    pub fn from_config(config: &Config) -> Self {
        let mut engine = InferenceEngine::from_config(config);
        if let Err(e) = engine.load() {
            error!("Starting without a model: {}", e);
        }
        Self::new(engine, TranslateOptions::from_config(&config.inference))
    }

    pub fn engine(&self) -> Arc<RwLock<InferenceEngine>> {
        Arc::clone(&self.engine)
    }

    pub fn is_ready(&self) -> bool {
        self.engine.read().is_ready()
    }

    /// Translate with the service's default options
    pub fn translate(&self, text: &str, source_lang: &str, target_lang: &str) -> TranslateResponse {
        self.translate_with(text, source_lang, target_lang, &self.options)
    }

    pub fn translate_with(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        options: &TranslateOptions,
    ) -> TranslateResponse {
        let result = self.engine.read().translate(text, source_lang, target_lang, options);
        match result {
            Ok(candidates) => TranslateResponse {
                scores: candidates.iter().map(|c| c.score).collect(),
                candidates: candidates.into_iter().map(|c| c.text).collect(),
                success: true,
                error: None,
            },
            Err(e) if e.is_decode_failure() => TranslateResponse {
                candidates: vec![NO_TRANSLATION_PLACEHOLDER.to_string()],
                scores: Vec::new(),
                success: false,
                error: Some(e.to_string()),
            },
            Err(e) => TranslateResponse {
                candidates: Vec::new(),
                scores: Vec::new(),
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Train adapters on idiom rows and serve the resulting checkpoint
    ///
    /// Training and loading run on the blocking thread pool; the engine is
    /// replaced only when both succeed.
    pub async fn fine_tune(&self, training_corpus: IdiomTables, config: Config) -> FineTuneResponse {
        match self.run_fine_tune(training_corpus, config).await {
            Ok(checkpoint_path) => FineTuneResponse {
                checkpoint_path: Some(checkpoint_path),
                success: true,
                error: None,
            },
            Err(e) => {
                error!("Fine-tuning failed: {:#}", e);
                FineTuneResponse {
                    checkpoint_path: None,
                    success: false,
                    error: Some(format!("{:#}", e)),
                }
            }
        }
    }

    async fn run_fine_tune(&self, training_corpus: IdiomTables, config: Config) -> Result<PathBuf> {
        let _guard = match self.fine_tune_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Waiting for the running fine-tune to finish");
                self.fine_tune_lock.lock().await
            }
        };

        let (engine, checkpoint_path) = tokio::task::spawn_blocking(move || -> Result<(InferenceEngine, PathBuf)> {
            let controller = Controller::with_config(config)?;
            let outcome = controller.fine_tune(&training_corpus)?;
            let engine = controller.load_engine(Some(&outcome.output_dir))?;
            Ok((engine, outcome.output_dir))
        })
        .await
        .context("Fine-tuning task panicked")??;

        *self.engine.write() = engine;
        info!("Now serving checkpoint {}", checkpoint_path.display());
        Ok(checkpoint_path)
    }
}
