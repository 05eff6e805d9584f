/*!
 * Constrained decoding and serving.
 *
 * - `beam`: beam search restricted to the target language
 * - `contextual`: sentence translation with table idioms
 * - `engine`: the loadable inference engine
 * - `modes`: interactive, demo and file-batch front ends
 */

pub mod beam;
pub mod contextual;
pub mod engine;
pub mod modes;

pub use beam::{BeamHypothesis, BeamSearch, GenerationConfig};
pub use contextual::{ContextualTranslation, ContextualTranslator, IdiomDetector, TranslationMethod};
pub use engine::{Candidate, EngineState, InferenceEngine, TranslateOptions, TranslationRequest};
