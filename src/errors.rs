/*!
 * Error types for the contextbridge library.
 *
 * This module contains custom error types for the different stages of the
 * idiom translation pipeline, using the thiserror crate for ergonomic error
 * definitions. Application glue (CLI, controller) wraps these in anyhow.
 */

use std::path::PathBuf;

use thiserror::Error;

/// Placeholder returned to callers when no translation could be produced
pub const NO_TRANSLATION_PLACEHOLDER: &str = "[no translation available]";

/// Errors raised when a single request or pair is rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Input text was empty after normalization
    #[error("Input text is empty")]
    EmptyInput,

    /// Input text is shorter than the configured minimum
    #[error("Input text is too short: {actual} characters (minimum {minimum})")]
    InputTooShort {
        /// Minimum accepted number of characters
        minimum: usize,
        /// Number of characters received
        actual: usize,
    },

    /// Language code is not one of the supported languages
    #[error("Unknown or unsupported language code: {0}")]
    UnknownLanguage(String),

    /// Source and target language are identical
    #[error("Source and target language are both {0}")]
    SameLanguage(String),
}

/// Errors that can occur while loading a model and its adapter checkpoint
#[derive(Error, Debug)]
pub enum ModelLoadError {
    /// A required checkpoint artifact does not exist
    #[error("Missing checkpoint artifact: {0}")]
    MissingArtifact(PathBuf),

    /// A checkpoint artifact could not be parsed
    #[error("Failed to parse {path}: {message}")]
    Parse {
        /// Artifact path
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// The checkpoint does not match the base model
    #[error("Incompatible checkpoint: {0}")]
    Incompatible(String),

    /// Underlying IO failure
    #[error("IO error while loading model: {0}")]
    Io(String),

    /// A tensor operation failed
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Errors that can occur during translation requests
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    /// The request was rejected before decoding
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// The engine has no model loaded
    #[error("Inference engine is not ready (state: {0})")]
    NotReady(String),

    /// Generation produced no valid candidate
    #[error("No translation available for {source_lang} -> {target_lang}: {reason}")]
    DecodeFailure {
        /// Source language code
        source_lang: String,
        /// Target language code
        target_lang: String,
        /// Why every candidate was rejected
        reason: String,
    },

    /// The model failed while encoding or decoding
    #[error("Model failure: {0}")]
    Model(String),
}

impl TranslationError {
    /// Whether this error is the distinguishable "no translation" outcome
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::DecodeFailure { .. })
    }
}

/// Errors that can occur during adapter training
#[derive(Error, Debug)]
pub enum TrainingError {
    /// The step would not fit into the configured memory budget
    #[error(
        "Resource exhausted: step needs ~{required_mb:.1} MB but the limit is {limit_mb} MB \
         (batch size {batch_size}); reduce per_device_train_batch_size or increase gradient_accumulation_steps"
    )]
    ResourceExhausted {
        /// Estimated activation memory of the micro-batch
        required_mb: f64,
        /// Configured memory limit
        limit_mb: u64,
        /// Micro-batch size that triggered the condition
        batch_size: usize,
    },

    /// No usable pairs were left in the training split
    #[error("Training split contains no usable pairs ({skipped} skipped)")]
    EmptyTrainingSplit {
        /// Number of malformed pairs that were skipped
        skipped: usize,
    },

    /// Invalid training configuration
    #[error("Invalid training configuration: {0}")]
    Config(String),

    /// Failed to persist or restore a checkpoint
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Model could not be prepared for training
    #[error("Model error: {0}")]
    Model(#[from] ModelLoadError),

    /// A forward or backward pass failed
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl From<std::io::Error> for TrainingError {
    fn from(error: std::io::Error) -> Self {
        Self::Checkpoint(error.to_string())
    }
}

impl From<candle_core::Error> for TranslationError {
    fn from(error: candle_core::Error) -> Self {
        Self::Model(error.to_string())
    }
}

impl From<std::io::Error> for ModelLoadError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Main application error type that wraps all other errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Error from a file operation
    #[error("File error: {0}")]
    File(String),

    /// Error from request validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Error from model loading
    #[error("Model load error: {0}")]
    ModelLoad(#[from] ModelLoadError),

    /// Error from translation
    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    /// Error from training
    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    /// Any other error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl AppError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Unknown(_) => 1,
            Self::Validation(_) => 2,
            Self::File(_) => 3,
            Self::ModelLoad(_) => 4,
            Self::Translation(_) => 5,
            Self::Training(_) => 6,
        }
    }
}

// Utility functions for error conversion
impl From<anyhow::Error> for AppError {
    /// Recover the component error behind an `anyhow` chain, keeping its context otherwise
    fn from(error: anyhow::Error) -> Self {
        let error = match error.downcast::<ValidationError>() {
            Ok(e) => return Self::Validation(e),
            Err(error) => error,
        };
        let error = match error.downcast::<ModelLoadError>() {
            Ok(e) => return Self::ModelLoad(e),
            Err(error) => error,
        };
        let error = match error.downcast::<TranslationError>() {
            Ok(e) => return Self::Translation(e),
            Err(error) => error,
        };
        let error = match error.downcast::<TrainingError>() {
            Ok(e) => return Self::Training(e),
            Err(error) => error,
        };
        match error.downcast::<std::io::Error>() {
            Ok(e) => Self::File(e.to_string()),
            Err(error) => Self::Unknown(format!("{:#}", error)),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::File(error.to_string())
    }
}
