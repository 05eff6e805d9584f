/*!
 * Adapter fine-tuning.
 *
 * - `optimizer`: AdamW over the adapter variables, gradient clipping and the learning rate schedule
 * - `trainer`: the training loop, checkpointing and resumption
 */

pub mod optimizer;
pub mod trainer;

pub use optimizer::{AdapterOptimizer, LrSchedule, OptimizerState};
pub use trainer::{AdapterTrainer, TrainerState, TrainingOutcome};
