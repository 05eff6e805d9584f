use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::app_config::{Config, InferenceConfig, ModelConfig};
use crate::dataset::normalizer::normalize;
use crate::errors::{ModelLoadError, TranslationError, ValidationError};
use crate::language_utils::{detect_script, IdiomLanguage};
use crate::model::{load_base_model, AdapterCheckpoint, AdapterSet, BaseModel, EncoderOutput, Tokenizer};

use super::beam::{BeamSearch, GenerationConfig};

/// Lifecycle of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// One ranked translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    pub score: f32,
    /// Generated tokens; the first one is the target-language token
    pub tokens: Vec<u32>,
    pub language: IdiomLanguage,
    /// Produced by the base model without adapters
    #[serde(default)]
    pub fallback: bool,
}

/// Per-request decoding options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateOptions {
    pub beam_width: usize,
    pub num_candidates: usize,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            beam_width: 5,
            num_candidates: 1,
        }
    }
}

impl TranslateOptions {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            beam_width: config.beam_width,
            num_candidates: config.num_candidates,
        }
    }
}

/// A request in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

impl TranslationRequest {
    pub fn new(text: &str, source_lang: &str, target_lang: &str) -> Self {
        Self {
            text: text.to_string(),
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
        }
    }
}

/// A validated request
#[derive(Debug, Clone)]
struct Prepared {
    text: String,
    source: IdiomLanguage,
    target: IdiomLanguage,
}

struct LoadedModel {
    model: Arc<dyn BaseModel>,
    tokenizer: Arc<Tokenizer>,
    checkpoint: Arc<AdapterCheckpoint>,
}

/// Serves translations from the base model with an attached adapter checkpoint
pub struct InferenceEngine {
    model_config: ModelConfig,
    config: InferenceConfig,
    checkpoint_dir: PathBuf,
    state: EngineState,
    loaded: Option<LoadedModel>,
}

impl InferenceEngine {
    /// Unloaded engine for a checkpoint directory
    pub fn new<P: AsRef<Path>>(model_config: ModelConfig, config: InferenceConfig, checkpoint_dir: P) -> Self {
        Self {
            model_config,
            config,
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            state: EngineState::Unloaded,
            loaded: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.model.clone(), config.inference.clone(), config.checkpoint_dir())
    }

    /// Ready engine over already loaded parts
    pub fn from_parts(
        model: Arc<dyn BaseModel>,
        tokenizer: Arc<Tokenizer>,
        checkpoint: Arc<AdapterCheckpoint>,
        config: InferenceConfig,
    ) -> Result<Self, ModelLoadError> {
        check_checkpoint(model.as_ref(), &checkpoint, &tokenizer)?;
        let model_config = ModelConfig {
            model_name: model.model_id().to_string(),
            hidden_size: model.hidden_size(),
            ..ModelConfig::default()
        };

        Ok(Self {
            model_config,
            config,
            checkpoint_dir: PathBuf::new(),
            state: EngineState::Ready,
            loaded: Some(LoadedModel {
                model,
                tokenizer,
                checkpoint,
            }),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Point the engine at another checkpoint; takes effect on the next `load`
    pub fn set_checkpoint_dir<P: AsRef<Path>>(&mut self, dir: P) {
        self.checkpoint_dir = dir.as_ref().to_path_buf();
    }

    pub fn checkpoint(&self) -> Option<Arc<AdapterCheckpoint>> {
        self.loaded.as_ref().map(|l| Arc::clone(&l.checkpoint))
    }

    pub fn tokenizer(&self) -> Option<Arc<Tokenizer>> {
        self.loaded.as_ref().map(|l| Arc::clone(&l.tokenizer))
    }

    /// Load the tokenizer, base model and adapter checkpoint
    ///
    /// The engine becomes `Ready` only when every part loads; otherwise it
    /// stays `Unloaded`.
    pub fn load(&mut self) -> Result<(), ModelLoadError> {
        self.state = EngineState::Loading;
        self.loaded = None;

        match self.load_parts() {
            Ok(loaded) => {
                info!(
                    "Loaded adapter checkpoint from {} (step {}, rank {})",
                    self.checkpoint_dir.display(),
                    loaded.checkpoint.training_step,
                    loaded.checkpoint.rank()
                );
                self.loaded = Some(loaded);
                self.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                error!("Failed to load model from {}: {}", self.checkpoint_dir.display(), e);
                self.state = EngineState::Unloaded;
                Err(e)
            }
        }
    }

    fn load_parts(&self) -> Result<LoadedModel, ModelLoadError> {
        let dir = &self.checkpoint_dir;
        if !dir.is_dir() {
            return Err(ModelLoadError::MissingArtifact(dir.clone()));
        }

        let tokenizer = Arc::new(Tokenizer::load(dir)?);
        let checkpoint = AdapterCheckpoint::load(dir)?;
        if checkpoint.base_model_id != self.model_config.model_name {
            return Err(ModelLoadError::Incompatible(format!(
                "checkpoint was trained on '{}' but the configured base model is '{}'",
                checkpoint.base_model_id, self.model_config.model_name
            )));
        }
        if checkpoint.hidden_size != self.model_config.hidden_size {
            return Err(ModelLoadError::Incompatible(format!(
                "checkpoint hidden size {} does not match the configured {}",
                checkpoint.hidden_size, self.model_config.hidden_size
            )));
        }

        let model = load_base_model(&self.model_config, &tokenizer)?;
        check_checkpoint(model.as_ref(), &checkpoint, &tokenizer)?;

        Ok(LoadedModel {
            model,
            tokenizer,
            checkpoint: Arc::new(checkpoint),
        })
    }

    /// Drop the loaded model
    pub fn release(&mut self) {
        if self.loaded.take().is_some() {
            info!("Released inference model");
        }
        self.state = EngineState::Unloaded;
    }

    fn ready(&self) -> Result<&LoadedModel, TranslationError> {
        match (&self.loaded, self.state) {
            (Some(loaded), EngineState::Ready) => Ok(loaded),
            _ => Err(TranslationError::NotReady(self.state.to_string())),
        }
    }

    fn prepare(&self, text: &str, source_lang: &str, target_lang: &str) -> Result<Prepared, ValidationError> {
        let source = IdiomLanguage::parse(source_lang)?;
        let target = IdiomLanguage::parse(target_lang)?;
        if source == target {
            return Err(ValidationError::SameLanguage(source.code().to_string()));
        }

        let text = normalize(text);
        if text.is_empty() {
            return Err(ValidationError::EmptyInput);
        }
        let length = text.chars().count();
        if length < self.config.min_input_chars {
            return Err(ValidationError::InputTooShort {
                minimum: self.config.min_input_chars,
                actual: length,
            });
        }

        Ok(Prepared { text, source, target })
    }

    fn encode(
        &self,
        loaded: &LoadedModel,
        request: &Prepared,
        adapters: Option<&AdapterSet>,
    ) -> Result<EncoderOutput, TranslationError> {
        let source_ids = loaded
            .tokenizer
            .encode(&request.text, request.source, self.model_config.max_length);
        Ok(loaded.model.encode(&source_ids, adapters)?)
    }

    fn generate(
        &self,
        loaded: &LoadedModel,
        encoded: &EncoderOutput,
        request: &Prepared,
        options: &TranslateOptions,
    ) -> Result<Vec<Candidate>, TranslationError> {
        let beam_width = options.beam_width.max(1);
        let generation = GenerationConfig {
            beam_width,
            num_candidates: options.num_candidates.clamp(1, beam_width),
            ..GenerationConfig::from(&self.config)
        };

        let adapters = &loaded.checkpoint.adapter_weights;
        let (mut candidates, rejected) =
            self.collect_candidates(loaded, encoded, request, &generation, Some(adapters))?;

        if candidates.is_empty() && self.config.fallback_to_base {
            warn!(
                "{} -> {}: no adapted candidate in {} script ({} rejected), retrying with the base model",
                request.source,
                request.target,
                request.target.script(),
                rejected
            );
            let base_encoded = self.encode(loaded, request, None)?;
            let (base, _) = self.collect_candidates(loaded, &base_encoded, request, &generation, None)?;
            candidates = base;
        }

        if candidates.is_empty() {
            return Err(TranslationError::DecodeFailure {
                source_lang: request.source.code().to_string(),
                target_lang: request.target.code().to_string(),
                reason: format!("no candidate in {} script ({} rejected)", request.target.script(), rejected),
            });
        }

        candidates.sort_by(|a, b| rank_candidates(&loaded.tokenizer, a, b));
        candidates.truncate(generation.num_candidates);
        debug!(
            "{} -> {}: '{}' -> '{}' ({:.3})",
            request.source, request.target, request.text, candidates[0].text, candidates[0].score
        );
        Ok(candidates)
    }

    /// Distinct beam outputs in the target script and the number rejected for their script
    fn collect_candidates(
        &self,
        loaded: &LoadedModel,
        encoded: &EncoderOutput,
        request: &Prepared,
        generation: &GenerationConfig,
        adapters: Option<&AdapterSet>,
    ) -> Result<(Vec<Candidate>, usize), TranslationError> {
        let search = BeamSearch::new(generation, &loaded.tokenizer, request.target);
        let beams = search.search(|prefix| loaded.model.decode_step(encoded, prefix, adapters))?;

        let expected = request.target.script();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut rejected = 0usize;
        for beam in beams {
            let text = loaded.tokenizer.decode(&beam.tokens);
            if text.is_empty() || detect_script(&text) != expected {
                rejected += 1;
                continue;
            }
            if candidates.iter().any(|c| c.text == text) {
                continue;
            }
            candidates.push(Candidate {
                text,
                score: beam.score,
                tokens: beam.tokens,
                language: request.target,
                fallback: adapters.is_none(),
            });
        }
        Ok((candidates, rejected))
    }

    /// Translate one text
    ///
    /// The first generated token is always the target-language token.
    pub fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        options: &TranslateOptions,
    ) -> Result<Vec<Candidate>, TranslationError> {
        let loaded = self.ready()?;
        let request = self.prepare(text, source_lang, target_lang)?;
        let encoded = self.encode(loaded, &request, Some(&loaded.checkpoint.adapter_weights))?;
        self.generate(loaded, &encoded, &request, options)
    }

    /// Translate many texts; results keep the input order and a bad request
    /// only fails its own slot
    pub fn translate_batch(
        &self,
        requests: &[TranslationRequest],
        options: &TranslateOptions,
    ) -> Vec<Result<Vec<Candidate>, TranslationError>> {
        let loaded = match self.ready() {
            Ok(loaded) => loaded,
            Err(e) => return requests.iter().map(|_| Err(e.clone())).collect(),
        };

        let prepared: Vec<Result<Prepared, ValidationError>> = requests
            .iter()
            .map(|r| self.prepare(&r.text, &r.source_lang, &r.target_lang))
            .collect();

        // Encode every valid request before decoding
        let adapters = &loaded.checkpoint.adapter_weights;
        let encoded: Vec<Option<Result<EncoderOutput, TranslationError>>> = prepared
            .iter()
            .map(|p| p.as_ref().ok().map(|request| self.encode(loaded, request, Some(adapters))))
            .collect();

        prepared
            .into_iter()
            .zip(encoded)
            .map(|(request, encoded)| match (request, encoded) {
                (Ok(request), Some(Ok(encoded))) => self.generate(loaded, &encoded, &request, options),
                (Ok(_), Some(Err(e))) => Err(e),
                (Err(e), _) => Err(TranslationError::Validation(e)),
                (Ok(request), None) => Err(TranslationError::DecodeFailure {
                    source_lang: request.source.code().to_string(),
                    target_lang: request.target.code().to_string(),
                    reason: "request was not encoded".to_string(),
                }),
            })
            .collect()
    }

    /// Sentence representation of a text under the loaded adapters
    pub fn embed(&self, text: &str, language: IdiomLanguage) -> Result<Vec<f32>, TranslationError> {
        let loaded = self.ready()?;
        let source_ids = loaded
            .tokenizer
            .encode(&normalize(text), language, self.model_config.max_length);
        let encoded = loaded
            .model
            .encode(&source_ids, Some(&loaded.checkpoint.adapter_weights))?;
        Ok(encoded.pooled.flatten_all()?.to_vec1::<f32>()?)
    }
}

/// Best score first, then fewer content tokens, then text
pub fn rank_candidates(tokenizer: &Tokenizer, a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| tokenizer.content_len(&a.tokens).cmp(&tokenizer.content_len(&b.tokens)))
        .then_with(|| a.text.cmp(&b.text))
}

fn check_checkpoint(
    model: &dyn BaseModel,
    checkpoint: &AdapterCheckpoint,
    tokenizer: &Tokenizer,
) -> Result<(), ModelLoadError> {
    if checkpoint.base_model_id != model.model_id() {
        return Err(ModelLoadError::Incompatible(format!(
            "checkpoint base model '{}' does not match '{}'",
            checkpoint.base_model_id,
            model.model_id()
        )));
    }
    if model.vocab_size() != tokenizer.vocab_size() {
        return Err(ModelLoadError::Incompatible(format!(
            "model vocabulary ({}) does not match the tokenizer ({})",
            model.vocab_size(),
            tokenizer.vocab_size()
        )));
    }
    checkpoint.adapter_weights.check_compatible(model)
}
