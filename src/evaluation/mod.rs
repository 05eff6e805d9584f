/*!
 * Checkpoint evaluation.
 *
 * - `metrics`: BLEU, chrF, exact match and embedding similarity
 * - `evaluator`: runs a checkpoint over test pairs and builds the report
 */

pub mod evaluator;
pub mod metrics;

pub use evaluator::{EvaluationReport, EvaluationSample, Evaluator, EVALUATION_FILE};
