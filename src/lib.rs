/*!
 * # ContextBridge - idiom translation across English, Hindi and Telugu
 *
 * A Rust library that fine-tunes low-rank adapters on a frozen multilingual
 * translation model so that idioms are translated into idioms (or their
 * meanings) instead of word for word.
 *
 * ## Features
 *
 * - Load one idiom table per language and align them into triplets
 * - Generate directed pairs for every language combination
 * - Augment pairs with idioms embedded in sentence templates
 * - Split by idiom group so no idiom leaks between train, validation and test
 * - Train rank-r adapters with gradient accumulation, warmup-cosine schedule,
 *   early stopping and resumable checkpoints
 * - Score checkpoints with BLEU, chrF and embedding similarity
 * - Beam search that forces and validates the target language
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `app_config`: Configuration management
 * - `dataset`: Normalization, alignment, pair generation, augmentation and splitting
 * - `model`: The `BaseModel` seam, tokenizer, adapters and checkpoints
 * - `training`: The adapter training loop and optimizer
 * - `evaluation`: Metrics and checkpoint evaluation
 * - `inference`: Constrained beam search and the inference engine
 * - `service`: The translate / fine-tune boundary for outer layers
 * - `app_controller`: Main application workflow
 * - `file_utils`: File system operations
 * - `language_utils`: Language codes and script detection
 * - `errors`: Custom error types for the application
 */

// Global lints configuration
// These lints will be allowed but not auto-fixed
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]

// Public modules
pub mod app_config;
pub mod app_controller;
pub mod dataset;
pub mod errors;
pub mod evaluation;
pub mod file_utils;
pub mod inference;
pub mod language_utils;
pub mod model;
pub mod service;
pub mod training;

// Re-export main types for easier usage
pub use app_config::Config;
pub use app_controller::Controller;
pub use dataset::{CorpusBuilder, IdiomRecord, IdiomTriplet, PreparedCorpus, SplitDataset, TranslationPair};
pub use errors::{AppError, ModelLoadError, TrainingError, TranslationError, ValidationError};
pub use evaluation::{EvaluationReport, Evaluator};
pub use inference::{Candidate, EngineState, InferenceEngine, TranslateOptions};
pub use language_utils::{detect_script, IdiomLanguage, Script};
pub use model::{AdapterCheckpoint, BaseModel, Tokenizer};
pub use service::IdiomService;
pub use training::AdapterTrainer;
